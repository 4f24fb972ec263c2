use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by repository implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The addressed row does not exist (for operations that require it).
    #[error("not found")]
    NotFound,

    /// A uniqueness or referential constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend is transiently contended; the caller should retry.
    #[error("store busy")]
    Busy,

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Bounded attempts for [`with_busy_retry`].
const BUSY_ATTEMPTS: u32 = 5;
/// Initial backoff, doubled per attempt.
const BUSY_BACKOFF: Duration = Duration::from_millis(10);

/// Run a store operation, retrying [`StoreError::Busy`] with capped
/// exponential backoff. Every other outcome is returned as-is.
pub async fn with_busy_retry<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut backoff = BUSY_BACKOFF;
    for attempt in 1..=BUSY_ATTEMPTS {
        match op().await {
            Err(StoreError::Busy) if attempt < BUSY_ATTEMPTS => {
                tracing::debug!(attempt, "store busy, backing off");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            other => return other,
        }
    }
    Err(StoreError::Busy)
}
