//! Per-connection state: the correlation map, serialized writes, and the
//! reader/writer pumps.
//!
//! One connection may carry several subdomain claims; each claim gets its
//! own [`TunnelHandle`] in the live map, all sharing the connection's
//! correlation table and write queue. Request ids are allocated from a
//! single counter so they are unique within the connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use warren_core::{AppId, OrgId, Subdomain, TunnelRecord};

use crate::error::{ForwardError, TransportError};
use crate::protocol::{Frame, HeaderSet};
use crate::transport::{FrameSink, FrameStream};

/// A request about to cross the tunnel.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: String,
    pub path_and_query: String,
    pub headers: HeaderSet,
    pub body: Bytes,
}

/// The client's answer for one request id.
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: u16,
    pub headers: HeaderSet,
    pub body: Bytes,
}

type ReplySender = oneshot::Sender<Result<ForwardResponse, ForwardError>>;

/// Correlation table guarded by one per-connection lock.
struct Pending {
    map: HashMap<u64, ReplySender>,
    /// Set during teardown; no new entries are accepted once true.
    closed: bool,
}

/// State shared by every claim on one connection.
pub(crate) struct ConnShared {
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    writer: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    forward_timeout: Duration,
}

impl ConnShared {
    pub(crate) fn new(writer: mpsc::Sender<Frame>, forward_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(Pending {
                map: HashMap::new(),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
            writer,
            cancel: CancellationToken::new(),
            forward_timeout,
        }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Queue a frame for the writer task.
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), ForwardError> {
        self.writer
            .send(frame)
            .await
            .map_err(|_| ForwardError::Closed)
    }

    /// Resolve every outstanding correlation entry and refuse new ones.
    ///
    /// Called exactly once during teardown, before the live-map entries are
    /// removed, so no caller can observe a mapped subdomain whose pending
    /// requests will never complete.
    pub(crate) fn fail_pending(&self) {
        let drained: Vec<ReplySender> = {
            let mut pending = self.pending.lock();
            pending.closed = true;
            pending.map.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(ForwardError::Closed));
        }
        if count > 0 {
            debug!(count, "failed pending requests on tunnel close");
        }
    }

    /// Hand a decoded reply to the waiting request, if it is still waiting.
    pub(crate) fn resolve(&self, id: u64, reply: Result<ForwardResponse, ForwardError>) {
        let entry = self.pending.lock().map.remove(&id);
        match entry {
            Some(tx) => {
                // A send error means the waiter timed out in the meantime.
                if tx.send(reply).is_err() {
                    trace!(id, "reply channel already consumed, dropping");
                }
            }
            None => {
                // Unknown or already-timed-out id; non-fatal.
                debug!(id, "response for unknown request id, dropping");
            }
        }
    }
}

/// One subdomain claim on a live connection; the value type of the live map.
pub struct TunnelHandle {
    pub subdomain: Subdomain,
    pub record: TunnelRecord,
    pub org_id: Option<OrgId>,
    pub app_id: Option<AppId>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    conn: Arc<ConnShared>,
}

impl TunnelHandle {
    pub(crate) fn new(
        subdomain: Subdomain,
        record: TunnelRecord,
        org_id: Option<OrgId>,
        app_id: Option<AppId>,
        conn: Arc<ConnShared>,
    ) -> Self {
        Self {
            subdomain,
            record,
            org_id,
            app_id,
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            conn,
        }
    }

    /// Bytes forwarded toward the client so far.
    #[must_use]
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes forwarded back to public callers so far.
    #[must_use]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub(crate) fn shares_conn_of(&self, other: &TunnelHandle) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }

    pub(crate) async fn send_shutdown(&self) -> Result<(), ForwardError> {
        self.conn.send(Frame::Shutdown).await
    }

    pub(crate) fn cancel(&self) {
        self.conn.cancel.cancel();
    }

    /// Issue a correlated request over the tunnel and await the reply.
    ///
    /// Exactly one of three things happens: the client's response arrives,
    /// the forward timeout elapses (the correlation entry is released), or
    /// the tunnel closes (the entry is failed by teardown).
    pub async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, ForwardError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.conn.pending.lock();
            if pending.closed {
                return Err(ForwardError::Closed);
            }
            let id = self.conn.next_id.fetch_add(1, Ordering::Relaxed);
            pending.map.insert(id, tx);
            id
        };

        let body_len = request.body.len() as u64;
        let frame = Frame::HttpRequest {
            id,
            method: request.method,
            path_and_query: request.path_and_query,
            headers: request.headers,
            body: request.body,
        };
        if self.conn.send(frame).await.is_err() {
            self.conn.pending.lock().map.remove(&id);
            return Err(ForwardError::Closed);
        }
        self.bytes_in.fetch_add(body_len, Ordering::Relaxed);

        match tokio::time::timeout(self.conn.forward_timeout, rx).await {
            Ok(Ok(Ok(response))) => {
                self.bytes_out
                    .fetch_add(response.body.len() as u64, Ordering::Relaxed);
                Ok(response)
            }
            Ok(Ok(Err(e))) => Err(e),
            // Teardown dropped the sender without resolving; treat as closed.
            Ok(Err(_)) => Err(ForwardError::Closed),
            Err(_) => {
                // Deadline: release the correlation entry ourselves.
                self.conn.pending.lock().map.remove(&id);
                Err(ForwardError::Timeout)
            }
        }
    }
}

/// Why the reader loop ended; stamped on the close audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// The peer closed or the transport failed.
    Disconnected,
    /// Read deadline or heartbeat budget exhausted.
    Stalled,
    /// The peer violated the framing contract.
    ProtocolError,
    /// Server-initiated drain.
    Shutdown,
}

impl CloseReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Stalled => "stalled",
            Self::ProtocolError => "protocol_error",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Writer pump: serializes every frame for this connection onto the sink.
pub(crate) async fn run_writer(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(frame.encode()).await {
                            debug!(error = %e, "tunnel write failed");
                            cancel.cancel();
                            break;
                        }
                    }
                    None => break,
                }
            }
            () = cancel.cancelled() => {
                // Flush whatever is already queued, then stop.
                while let Ok(frame) = rx.try_recv() {
                    if sink.send(frame.encode()).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
}

/// Reader pump: demultiplexes frames into the correlation table and runs
/// the heartbeat schedule. Returns the close reason.
pub(crate) async fn run_reader(
    mut stream: Box<dyn FrameStream>,
    conn: &Arc<ConnShared>,
    heartbeat_interval: Duration,
    max_body: usize,
) -> CloseReason {
    // Every received message refreshes the read deadline; two heartbeat
    // intervals of silence is the stall budget.
    let read_deadline = heartbeat_interval * 2;
    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it.
    ticker.tick().await;
    let mut unanswered_pings: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if unanswered_pings >= 2 {
                    return CloseReason::Stalled;
                }
                if conn.send(Frame::Ping).await.is_err() {
                    return CloseReason::Disconnected;
                }
                unanswered_pings += 1;
            }
            received = tokio::time::timeout(read_deadline, stream.recv()) => {
                let frame = match received {
                    Err(_) => return CloseReason::Stalled,
                    Ok(Err(TransportError::Closed)) | Ok(Ok(None)) => {
                        return CloseReason::Disconnected;
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, "tunnel read failed");
                        return CloseReason::Disconnected;
                    }
                    Ok(Ok(Some(data))) => match Frame::decode(data, max_body) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "framing violation");
                            return CloseReason::ProtocolError;
                        }
                    },
                };
                match frame {
                    Frame::HttpResponse { id, status, headers, body } => {
                        conn.resolve(id, Ok(ForwardResponse { status, headers, body }));
                    }
                    Frame::Error { id, kind } => {
                        conn.resolve(id, Err(ForwardError::Upstream(kind)));
                    }
                    Frame::Pong => unanswered_pings = 0,
                    Frame::Ping => {
                        if conn.send(Frame::Pong).await.is_err() {
                            return CloseReason::Disconnected;
                        }
                    }
                    Frame::Shutdown => return CloseReason::Disconnected,
                    // Registration is over; anything else is a violation.
                    Frame::Register { .. }
                    | Frame::RegisterOk { .. }
                    | Frame::RegisterReject { .. }
                    | Frame::HttpRequest { .. } => {
                        warn!("unexpected frame after registration");
                        return CloseReason::ProtocolError;
                    }
                }
            }
            () = conn.cancel.cancelled() => {
                return CloseReason::Shutdown;
            }
        }
    }
}
