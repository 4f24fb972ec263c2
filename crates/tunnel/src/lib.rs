//! Tunnel registry and wire protocol for the Warren edge server.
//!
//! The manager owns the `subdomain -> live tunnel` map and, inside each
//! connection, the `request-id -> reply channel` correlation table. Public
//! HTTP handlers call [`TunnelManager::forward`]; the transport layer feeds
//! authenticated client connections into
//! [`TunnelManager::serve_connection`].

pub mod conn;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod transport;

pub use conn::{ForwardRequest, ForwardResponse, TunnelHandle};
pub use error::{ForwardError, ProtocolError, TransportError};
pub use manager::{ClaimContext, RegistrationPolicy, TunnelConfig, TunnelManager};
pub use protocol::{DEFAULT_MAX_BODY, Frame, HeaderSet, MAX_HEADERS};
pub use transport::{FrameSink, FrameStream, MemoryTransport, memory_pair};
