use thiserror::Error;

/// Errors from audit sinks.
///
/// The request path never propagates these; they are logged and dropped
/// so an audit outage cannot fail a request.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The backend rejected or failed the write.
    #[error("audit backend error: {0}")]
    Backend(String),

    /// The writer's queue is gone (shutdown already completed).
    #[error("audit writer closed")]
    Closed,
}
