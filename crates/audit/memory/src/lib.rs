//! In-memory audit sink.
//!
//! Holds every appended event in arrival order. Useful for tests asserting
//! on audit behavior and for dev deployments without a durable backend.

use async_trait::async_trait;
use parking_lot::Mutex;

use warren_audit::{AuditError, AuditSink, AuthEvent};
use warren_core::FailureReason;

/// Sink that appends into a process-local vector.
#[derive(Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuthEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event appended so far, in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<AuthEvent> {
        self.events.lock().clone()
    }

    /// Count of failure events carrying the given reason.
    #[must_use]
    pub fn failures_with(&self, reason: FailureReason) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| !e.success && e.reason == Some(reason))
            .count()
    }

    /// Count of success events.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.events.lock().iter().filter(|e| e.success).count()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append_batch(&self, mut batch: Vec<AuthEvent>) -> Result<(), AuditError> {
        self.events.lock().append(&mut batch);
        Ok(())
    }
}
