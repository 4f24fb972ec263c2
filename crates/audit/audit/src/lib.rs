//! Append-only audit trail of authentication and forwarding decisions.
//!
//! Every decision point in the middleware emits exactly one [`AuthEvent`];
//! events flow through the [`BatchingAuditWriter`] so the request path never
//! blocks on the audit backend. Events carry monotonic timestamps but may be
//! written out of wall-clock order when batched — consumers sort by
//! timestamp.

pub mod batch;
pub mod error;
pub mod record;
pub mod sink;

pub use batch::{BatchingAuditWriter, WriterConfig};
pub use error::AuditError;
pub use record::AuthEvent;
pub use sink::AuditSink;
