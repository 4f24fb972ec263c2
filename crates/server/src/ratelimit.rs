//! Sliding-window rate limiting with persistent block windows.
//!
//! Hot state lives in a read-mostly map; every mutation marks its key dirty
//! and a background task writes dirty keys through to the store on a coarse
//! interval, so an in-force block survives a process restart. Transitions
//! are linearizable per key under the map's write lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warren_core::RateLimitState;
use warren_store::RateLimitStore;

use crate::config::RateLimitConfig;

/// Write-through cadence for dirty keys.
const FLUSH_INTERVAL: Duration = Duration::from_secs(15);

/// Outcome of a pre-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Proceed; report the outcome later via record_success/record_failure.
    Allowed,
    /// Inside a block window.
    Blocked {
        /// Seconds until the block lifts, for the `Retry-After` header.
        retry_after_seconds: u64,
    },
}

/// The limiter over one logical key space.
pub struct RateLimiter {
    entries: RwLock<HashMap<String, RateLimitState>>,
    dirty: Mutex<HashSet<String>>,
    config: RateLimitConfig,
    store: Arc<dyn RateLimitStore>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            config,
            store,
        }
    }

    /// Repopulate the hot map from persisted rows.
    ///
    /// A store failure degrades to an empty map — requests are allowed
    /// rather than denied on infrastructure trouble.
    pub async fn load_persisted(&self) {
        match self.store.load_all().await {
            Ok(rows) => {
                let count = rows.len();
                let mut entries = self.entries.write();
                for (key, state) in rows {
                    entries.insert(key, state);
                }
                debug!(count, "rate-limit state repopulated");
            }
            Err(e) => {
                warn!(error = %e, "rate-limit state load failed, starting empty");
            }
        }
    }

    /// Pre-check: only an in-force block denies.
    #[must_use]
    pub fn check(&self, key: &str, now: DateTime<Utc>) -> Decision {
        let entries = self.entries.read();
        if let Some(state) = entries.get(key)
            && let Some(until) = state.blocked_until
            && until > now
        {
            // Round up so a block set moments ago reports its full length.
            let millis = (until - now).num_milliseconds();
            #[allow(clippy::cast_sign_loss)]
            let retry_after_seconds = ((millis + 999) / 1000).max(1) as u64;
            return Decision::Blocked {
                retry_after_seconds,
            };
        }
        Decision::Allowed
    }

    /// Record a failed attempt; crossing the threshold inside the window
    /// stamps the block.
    pub fn record_failure(&self, key: &str, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.config.window()).unwrap_or_default();
        {
            let mut entries = self.entries.write();
            let state = entries
                .entry(key.to_owned())
                .or_insert_with(|| RateLimitState::fresh(now));
            if now - state.window_start > window {
                state.window_start = now;
                state.count = 0;
            }
            state.count += 1;
            if state.count >= self.config.max_attempts {
                let block =
                    chrono::Duration::from_std(self.config.block_duration()).unwrap_or_default();
                state.blocked_until = Some(now + block);
                state.count = 0;
                state.window_start = now;
            }
        }
        self.dirty.lock().insert(key.to_owned());
    }

    /// Record a success: walk the counter back toward zero and lift any
    /// block.
    pub fn record_success(&self, key: &str) {
        let mut changed = false;
        {
            let mut entries = self.entries.write();
            if let Some(state) = entries.get_mut(key) {
                state.count = state.count.saturating_sub(1);
                state.blocked_until = None;
                changed = true;
            }
        }
        if changed {
            self.dirty.lock().insert(key.to_owned());
        }
    }

    /// Write dirty keys through to the store; swept keys are deleted.
    pub async fn flush(&self) {
        let keys: Vec<String> = {
            let mut dirty = self.dirty.lock();
            dirty.drain().collect()
        };
        for key in keys {
            let state = self.entries.read().get(&key).cloned();
            let result = match state {
                Some(state) => self.store.put(&key, &state).await,
                None => self.store.delete(&key).await.map(|_| ()),
            };
            if let Err(e) = result {
                warn!(error = %e, key, "rate-limit flush failed");
                // Leave it dirty so the next flush retries.
                self.dirty.lock().insert(key);
            }
        }
    }

    /// Evict entries whose window has lapsed and that are not blocked.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let window = chrono::Duration::from_std(self.config.window()).unwrap_or_default();
        let mut swept = Vec::new();
        {
            let mut entries = self.entries.write();
            entries.retain(|key, state| {
                let keep = state.is_blocked(now) || now - state.window_start <= window;
                if !keep {
                    swept.push(key.clone());
                }
                keep
            });
        }
        if !swept.is_empty() {
            debug!(count = swept.len(), "swept expired rate-limit entries");
            let mut dirty = self.dirty.lock();
            for key in swept {
                dirty.insert(key);
            }
        }
    }

    /// Entry count (test helper).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Flush and sweep loop; runs until cancelled, with a final flush.
pub async fn run_background(limiter: Arc<RateLimiter>, cancel: CancellationToken) {
    let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
    let mut sweep_tick = tokio::time::interval(limiter.config.sweep_interval());
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = flush_tick.tick() => limiter.flush().await,
            _ = sweep_tick.tick() => limiter.sweep(Utc::now()),
            () = cancel.cancelled() => {
                limiter.flush().await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use warren_store_memory::MemoryStore;

    use super::*;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            window_seconds: 900,
            max_attempts: 10,
            block_duration_seconds: 1800,
            sweep_interval_seconds: 300,
        }
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(config(), Arc::new(MemoryStore::new()))
    }

    #[test]
    fn tenth_failure_blocks_with_full_retry_after() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..9 {
            limiter.record_failure("ip:1.2.3.4", now);
        }
        assert_eq!(limiter.check("ip:1.2.3.4", now), Decision::Allowed);

        limiter.record_failure("ip:1.2.3.4", now);
        assert_eq!(
            limiter.check("ip:1.2.3.4", now),
            Decision::Blocked {
                retry_after_seconds: 1800
            }
        );
    }

    #[test]
    fn block_expires_and_next_attempt_is_evaluated_normally() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..10 {
            limiter.record_failure("ip:1.2.3.4", now);
        }
        let after_block = now + chrono::Duration::seconds(1801);
        assert_eq!(limiter.check("ip:1.2.3.4", after_block), Decision::Allowed);
    }

    #[test]
    fn success_walks_the_counter_back_and_never_blocks_at_max_minus_one() {
        let limiter = limiter();
        let now = Utc::now();
        limiter.record_success("user:u");

        // success then up to max-1 failures never blocks
        for _ in 0..9 {
            limiter.record_failure("user:u", now);
        }
        assert_eq!(limiter.check("user:u", now), Decision::Allowed);

        limiter.record_success("user:u");
        limiter.record_failure("user:u", now);
        assert_eq!(limiter.check("user:u", now), Decision::Allowed);
    }

    #[test]
    fn window_expiry_resets_the_counter() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..9 {
            limiter.record_failure("ip:5.6.7.8", now);
        }
        let later = now + chrono::Duration::seconds(901);
        limiter.record_failure("ip:5.6.7.8", later);
        assert_eq!(limiter.check("ip:5.6.7.8", later), Decision::Allowed);
    }

    #[test]
    fn sweep_keeps_blocked_entries() {
        let limiter = limiter();
        let now = Utc::now();
        for _ in 0..10 {
            limiter.record_failure("ip:blocked", now);
        }
        limiter.record_failure("ip:stale", now);

        let later = now + chrono::Duration::seconds(1000);
        limiter.sweep(later);
        assert_eq!(limiter.len(), 1);
        assert!(matches!(
            limiter.check("ip:blocked", later),
            Decision::Blocked { .. }
        ));
    }

    #[tokio::test]
    async fn state_survives_a_restart_through_the_store() {
        let store = Arc::new(MemoryStore::new());
        let first = RateLimiter::new(config(), Arc::clone(&store) as Arc<dyn RateLimitStore>);
        let now = Utc::now();
        for _ in 0..10 {
            first.record_failure("ip:9.9.9.9", now);
        }
        first.flush().await;

        let second = RateLimiter::new(config(), store as Arc<dyn RateLimitStore>);
        second.load_persisted().await;
        assert!(matches!(
            second.check("ip:9.9.9.9", now),
            Decision::Blocked { .. }
        ));
    }
}
