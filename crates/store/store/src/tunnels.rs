use async_trait::async_trait;
use chrono::{DateTime, Utc};

use warren_core::{TunnelId, TunnelRecord};

use crate::error::StoreError;

/// The historical tunnel ledger: one row per accepted registration.
#[async_trait]
pub trait TunnelStore: Send + Sync {
    async fn record_open(&self, record: TunnelRecord) -> Result<(), StoreError>;

    /// Stamp the close time and final byte counters on an open row.
    async fn record_close(
        &self,
        id: TunnelId,
        closed_at: DateTime<Utc>,
        bytes_in: u64,
        bytes_out: u64,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: TunnelId) -> Result<Option<TunnelRecord>, StoreError>;

    /// Rows with no close stamp yet.
    async fn list_open(&self) -> Result<Vec<TunnelRecord>, StoreError>;
}
