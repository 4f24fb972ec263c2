//! Transport seam beneath the framing layer.
//!
//! The registry speaks in whole messages; the transport provides reliable
//! ordered delivery of them. The server implements these traits over a
//! WebSocket; tests use the in-process [`memory_pair`].

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Write half: one call per protocol frame.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Best-effort close of the underlying connection.
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Read half: `Ok(None)` means the peer closed cleanly.
#[async_trait]
pub trait FrameStream: Send {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// One end of an in-process transport.
pub struct MemoryTransport {
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
}

/// Build a connected pair of in-process transports.
///
/// Message framing and FIFO ordering come from the channels, matching the
/// guarantees the real transport provides.
#[must_use]
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        MemoryTransport { tx: a_tx, rx: b_rx },
        MemoryTransport { tx: b_tx, rx: a_rx },
    )
}

impl MemoryTransport {
    /// Split into sink and stream halves.
    #[must_use]
    pub fn split(self) -> (MemorySink, MemoryStream) {
        (MemorySink { tx: self.tx }, MemoryStream { rx: self.rx })
    }
}

/// Write half of a [`MemoryTransport`].
pub struct MemorySink {
    tx: mpsc::Sender<Bytes>,
}

/// Read half of a [`MemoryTransport`].
pub struct MemoryStream {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}
