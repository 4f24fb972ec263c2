use async_trait::async_trait;

use crate::error::AuditError;
use crate::record::AuthEvent;

/// Storage backend for audit events.
///
/// Implementations must be `Send + Sync`. `append_batch` is the only write
/// entry point; the batching writer hands it groups of events in arrival
/// order.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist a batch of events.
    async fn append_batch(&self, events: Vec<AuthEvent>) -> Result<(), AuditError>;
}
