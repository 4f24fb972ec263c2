//! In-memory repository backend.
//!
//! Backs tests and single-process dev deployments. Every operation is
//! linearizable per key through `DashMap` entry locking; uniqueness indexes
//! (username, org name, subdomain, key hash) are claimed through the index
//! map's entry API so concurrent creates resolve to one winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use uuid::Uuid;

use warren_core::{
    Account, AccountId, ApiKey, AppId, Application, AuthPolicy, AuthSession, KeyId, OrgId,
    Organization, RateLimitState, Subdomain, TunnelId, TunnelRecord, UsagePeriod, UsageSnapshot,
    WhitelistEntry, WhitelistScope, period_start,
};
use warren_store::{
    AccountStore, ApiKeyStore, AppStore, OrgStore, PolicyStore, RateLimitStore, SessionStore,
    StoreError, TunnelStore, UsageDelta, UsageStore, WhitelistSets, WhitelistStore,
};

/// The whole repository surface over process-local maps.
#[derive(Default)]
pub struct MemoryStore {
    accounts: DashMap<AccountId, Account>,
    usernames: DashMap<String, AccountId>,
    orgs: DashMap<OrgId, Organization>,
    org_names: DashMap<String, OrgId>,
    apps: DashMap<AppId, Application>,
    app_subdomains: DashMap<Subdomain, AppId>,
    org_policies: DashMap<OrgId, AuthPolicy>,
    app_policies: DashMap<AppId, AuthPolicy>,
    keys: DashMap<KeyId, ApiKey>,
    key_hashes: DashMap<String, KeyId>,
    sessions: DashMap<String, AuthSession>,
    ratelimits: DashMap<String, RateLimitState>,
    tunnels: DashMap<TunnelId, TunnelRecord>,
    /// Live in-period counters, keyed by organization and granularity.
    usage: DashMap<(OrgId, UsagePeriod), UsageSnapshot>,
    /// Live concurrent-tunnel count per organization, for peak tracking.
    concurrency: DashMap<OrgId, i64>,
    /// Closed-period snapshots in write order.
    snapshots: Mutex<Vec<UsageSnapshot>>,
    whitelist: DashMap<Uuid, WhitelistEntry>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Closed-period snapshots written so far (test helper).
    #[must_use]
    pub fn closed_snapshots(&self) -> Vec<UsageSnapshot> {
        self.snapshots.lock().clone()
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.get(&id).map(|a| a.clone()))
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<Account>, StoreError> {
        let Some(id) = self.usernames.get(username).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.accounts.get(&id).map(|a| a.clone()))
    }

    async fn create(&self, account: Account) -> Result<(), StoreError> {
        match self.usernames.entry(account.username.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "username '{}' already exists",
                account.username
            ))),
            Entry::Vacant(slot) => {
                slot.insert(account.id);
                self.accounts.insert(account.id, account);
                Ok(())
            }
        }
    }

    async fn update(&self, account: Account) -> Result<(), StoreError> {
        match self.accounts.entry(account.id) {
            Entry::Occupied(mut slot) => {
                slot.insert(account);
                Ok(())
            }
            Entry::Vacant(_) => Err(StoreError::NotFound),
        }
    }

    async fn deactivate(&self, id: AccountId) -> Result<(), StoreError> {
        match self.accounts.get_mut(&id) {
            Some(mut account) => {
                account.active = false;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn validate_token(&self, token_hash: &str) -> Result<Option<Account>, StoreError> {
        Ok(self
            .accounts
            .iter()
            .find(|a| a.active && a.token_hash == token_hash)
            .map(|a| a.clone()))
    }
}

#[async_trait]
impl OrgStore for MemoryStore {
    async fn get(&self, id: OrgId) -> Result<Option<Organization>, StoreError> {
        Ok(self.orgs.get(&id).map(|o| o.clone()))
    }

    async fn get_by_name(&self, name: &str) -> Result<Option<Organization>, StoreError> {
        let Some(id) = self.org_names.get(name).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.orgs.get(&id).map(|o| o.clone()))
    }

    async fn create(&self, org: Organization) -> Result<(), StoreError> {
        match self.org_names.entry(org.name.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "organization '{}' already exists",
                org.name
            ))),
            Entry::Vacant(slot) => {
                slot.insert(org.id);
                self.orgs.insert(org.id, org);
                Ok(())
            }
        }
    }

    async fn update(&self, org: Organization) -> Result<(), StoreError> {
        match self.orgs.entry(org.id) {
            Entry::Occupied(mut slot) => {
                slot.insert(org);
                Ok(())
            }
            Entry::Vacant(_) => Err(StoreError::NotFound),
        }
    }

    async fn delete(&self, id: OrgId) -> Result<(), StoreError> {
        if self.apps.iter().any(|a| a.org_id == id) {
            return Err(StoreError::Conflict(
                "organization still owns applications".to_owned(),
            ));
        }
        match self.orgs.remove(&id) {
            Some((_, org)) => {
                self.org_names.remove(&org.name);
                self.org_policies.remove(&id);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

#[async_trait]
impl AppStore for MemoryStore {
    async fn get(&self, id: AppId) -> Result<Option<Application>, StoreError> {
        Ok(self.apps.get(&id).map(|a| a.clone()))
    }

    async fn get_by_subdomain(
        &self,
        subdomain: &Subdomain,
    ) -> Result<Option<Application>, StoreError> {
        let Some(id) = self.app_subdomains.get(subdomain).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.apps.get(&id).map(|a| a.clone()))
    }

    async fn list_by_org(&self, org: OrgId) -> Result<Vec<Application>, StoreError> {
        Ok(self
            .apps
            .iter()
            .filter(|a| a.org_id == org)
            .map(|a| a.clone())
            .collect())
    }

    async fn create(&self, app: Application) -> Result<(), StoreError> {
        match self.app_subdomains.entry(app.subdomain.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "subdomain '{}' already claimed",
                app.subdomain
            ))),
            Entry::Vacant(slot) => {
                slot.insert(app.id);
                self.apps.insert(app.id, app);
                Ok(())
            }
        }
    }

    async fn update(&self, app: Application) -> Result<(), StoreError> {
        // Never hold the apps guard while touching the subdomain index;
        // `create` takes the locks in the opposite order.
        let old = match self.apps.get(&app.id) {
            Some(existing) => existing.clone(),
            None => return Err(StoreError::NotFound),
        };
        if old.subdomain != app.subdomain {
            // Re-point the uniqueness index when the subdomain moves.
            match self.app_subdomains.entry(app.subdomain.clone()) {
                Entry::Occupied(_) => {
                    return Err(StoreError::Conflict(format!(
                        "subdomain '{}' already claimed",
                        app.subdomain
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(app.id);
                }
            }
            self.app_subdomains.remove(&old.subdomain);
        }
        self.apps.insert(app.id, app);
        Ok(())
    }

    async fn delete(&self, id: AppId) -> Result<(), StoreError> {
        match self.apps.remove(&id) {
            Some((_, app)) => {
                self.app_subdomains.remove(&app.subdomain);
                self.app_policies.remove(&id);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn org_policy(&self, org: OrgId) -> Result<Option<AuthPolicy>, StoreError> {
        Ok(self.org_policies.get(&org).map(|p| p.clone()))
    }

    async fn app_policy(&self, app: AppId) -> Result<Option<AuthPolicy>, StoreError> {
        Ok(self.app_policies.get(&app).map(|p| p.clone()))
    }

    async fn put_org_policy(&self, org: OrgId, policy: AuthPolicy) -> Result<(), StoreError> {
        self.org_policies.insert(org, policy);
        Ok(())
    }

    async fn put_app_policy(&self, app: AppId, policy: AuthPolicy) -> Result<(), StoreError> {
        self.app_policies.insert(app, policy);
        Ok(())
    }

    async fn delete_org_policy(&self, org: OrgId) -> Result<bool, StoreError> {
        Ok(self.org_policies.remove(&org).is_some())
    }

    async fn delete_app_policy(&self, app: AppId) -> Result<bool, StoreError> {
        Ok(self.app_policies.remove(&app).is_some())
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn validate(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        let Some(id) = self.key_hashes.get(key_hash).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.keys.get(&id).map(|k| k.clone()))
    }

    async fn create(&self, key: ApiKey) -> Result<(), StoreError> {
        match self.key_hashes.entry(key.key_hash.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict("key hash already exists".to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(key.id);
                self.keys.insert(key.id, key);
                Ok(())
            }
        }
    }

    async fn list_by_org(&self, org: OrgId) -> Result<Vec<ApiKey>, StoreError> {
        Ok(self
            .keys
            .iter()
            .filter(|k| k.org_id == org)
            .map(|k| k.clone())
            .collect())
    }

    async fn revoke(&self, id: KeyId) -> Result<bool, StoreError> {
        match self.keys.remove(&id) {
            Some((_, key)) => {
                self.key_hashes.remove(&key.key_hash);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_last_used(&self, id: KeyId, at: DateTime<Utc>) -> Result<(), StoreError> {
        match self.keys.get_mut(&id) {
            Some(mut key) => {
                key.last_used_at = Some(at);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: AuthSession) -> Result<(), StoreError> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn validate(&self, id: &str) -> Result<Option<AuthSession>, StoreError> {
        let now = Utc::now();
        if let Some(session) = self.sessions.get(id) {
            if !session.is_expired(now) {
                return Ok(Some(session.clone()));
            }
        } else {
            return Ok(None);
        }
        // Expired: drop the row eagerly.
        self.sessions.remove(id);
        Ok(None)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.remove(id).is_some())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        Ok(before.saturating_sub(self.sessions.len()) as u64)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<RateLimitState>, StoreError> {
        Ok(self.ratelimits.get(key).map(|s| s.clone()))
    }

    async fn put(&self, key: &str, state: &RateLimitState) -> Result<(), StoreError> {
        self.ratelimits.insert(key.to_owned(), state.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.ratelimits.remove(key).is_some())
    }

    async fn load_all(&self) -> Result<Vec<(String, RateLimitState)>, StoreError> {
        Ok(self
            .ratelimits
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }
}

#[async_trait]
impl TunnelStore for MemoryStore {
    async fn record_open(&self, record: TunnelRecord) -> Result<(), StoreError> {
        self.tunnels.insert(record.id, record);
        Ok(())
    }

    async fn record_close(
        &self,
        id: TunnelId,
        closed_at: DateTime<Utc>,
        bytes_in: u64,
        bytes_out: u64,
    ) -> Result<(), StoreError> {
        match self.tunnels.get_mut(&id) {
            Some(mut record) => {
                record.closed_at = Some(closed_at);
                record.bytes_in = bytes_in;
                record.bytes_out = bytes_out;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn get(&self, id: TunnelId) -> Result<Option<TunnelRecord>, StoreError> {
        Ok(self.tunnels.get(&id).map(|r| r.clone()))
    }

    async fn list_open(&self) -> Result<Vec<TunnelRecord>, StoreError> {
        Ok(self
            .tunnels
            .iter()
            .filter(|r| r.closed_at.is_none())
            .map(|r| r.clone())
            .collect())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    async fn increment(&self, org: OrgId, delta: UsageDelta) -> Result<(), StoreError> {
        let now = Utc::now();

        let live = if delta.concurrency == 0 {
            None
        } else {
            let mut counter = self.concurrency.entry(org).or_insert(0);
            *counter = counter.saturating_add(delta.concurrency);
            Some(*counter)
        };

        for period in [UsagePeriod::Hour, UsagePeriod::Day, UsagePeriod::Month] {
            let start = period_start(period, now);
            let mut entry = self
                .usage
                .entry((org, period))
                .or_insert_with(|| UsageSnapshot::empty(org, period, now));
            if entry.period_start != start {
                // The period rolled over since the last write; bank the old
                // counters and start fresh.
                self.snapshots.lock().push(entry.clone());
                *entry = UsageSnapshot::empty(org, period, now);
            }
            entry.bandwidth_bytes = entry.bandwidth_bytes.saturating_add(delta.bandwidth_bytes);
            entry.request_count = entry.request_count.saturating_add(delta.requests);
            entry.tunnel_seconds = entry.tunnel_seconds.saturating_add(delta.tunnel_seconds);
            if let Some(live) = live
                && live > 0
            {
                let live = live.min(i64::from(u32::MAX)) as u32;
                entry.peak_concurrent = entry.peak_concurrent.max(live);
            }
        }
        Ok(())
    }

    async fn current(
        &self,
        org: OrgId,
        period: UsagePeriod,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, StoreError> {
        let start = period_start(period, now);
        match self.usage.get(&(org, period)) {
            Some(snap) if snap.period_start == start => Ok(snap.clone()),
            _ => Ok(UsageSnapshot::empty(org, period, now)),
        }
    }

    async fn put_snapshot(&self, snapshot: UsageSnapshot) -> Result<(), StoreError> {
        self.snapshots.lock().push(snapshot);
        Ok(())
    }

    async fn rollup(&self, period: UsagePeriod, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let start = period_start(period, now);
        let mut rolled = 0u64;
        let stale: Vec<(OrgId, UsagePeriod)> = self
            .usage
            .iter()
            .filter(|e| e.key().1 == period && e.period_start != start)
            .map(|e| *e.key())
            .collect();
        for key in stale {
            if let Some((_, snap)) = self.usage.remove(&key) {
                self.snapshots.lock().push(snap);
                rolled += 1;
            }
        }
        Ok(rolled)
    }
}

#[async_trait]
impl WhitelistStore for MemoryStore {
    async fn entries(&self, scope: &WhitelistScope) -> Result<Vec<WhitelistEntry>, StoreError> {
        Ok(self
            .whitelist
            .iter()
            .filter(|e| e.scope == *scope)
            .map(|e| e.clone())
            .collect())
    }

    async fn scoped(
        &self,
        app: Option<AppId>,
        org: Option<OrgId>,
        account: Option<AccountId>,
    ) -> Result<WhitelistSets, StoreError> {
        let mut sets = WhitelistSets::default();
        for entry in &self.whitelist {
            match entry.scope {
                WhitelistScope::Global => sets.global.push(entry.cidr),
                WhitelistScope::Org { org_id } if Some(org_id) == org => {
                    sets.org.push(entry.cidr);
                }
                WhitelistScope::App { app_id } if Some(app_id) == app => {
                    sets.app.push(entry.cidr);
                }
                WhitelistScope::Account { account_id } if Some(account_id) == account => {
                    sets.account.push(entry.cidr);
                }
                _ => {}
            }
        }
        Ok(sets)
    }

    async fn add(&self, entry: WhitelistEntry) -> Result<(), StoreError> {
        self.whitelist.insert(entry.id, entry);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.whitelist.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use warren_core::Identity;
    use warren_core::policy::AuthType;

    use super::*;

    fn subdomain(s: &str) -> Subdomain {
        Subdomain::parse(s).unwrap()
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let store = MemoryStore::new();
        AccountStore::create(&store, Account::new("alice", "h1"))
            .await
            .unwrap();
        let err = AccountStore::create(&store, Account::new("alice", "h2"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn token_validation_skips_inactive_accounts() {
        let store = MemoryStore::new();
        let account = Account::new("bob", "tok-hash");
        let id = account.id;
        AccountStore::create(&store, account).await.unwrap();
        assert!(store.validate_token("tok-hash").await.unwrap().is_some());

        store.deactivate(id).await.unwrap();
        assert!(store.validate_token("tok-hash").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn org_delete_refuses_while_apps_exist() {
        let store = MemoryStore::new();
        let org = Organization::new("acme", None);
        let org_id = org.id;
        OrgStore::create(&store, org).await.unwrap();
        AppStore::create(&store, Application::new(org_id, subdomain("docs")))
            .await
            .unwrap();

        let err = OrgStore::delete(&store, org_id).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn subdomain_uniqueness_is_global() {
        let store = MemoryStore::new();
        let org_a = Organization::new("a", None);
        let org_b = Organization::new("b", None);
        let (ida, idb) = (org_a.id, org_b.id);
        OrgStore::create(&store, org_a).await.unwrap();
        OrgStore::create(&store, org_b).await.unwrap();

        AppStore::create(&store, Application::new(ida, subdomain("web")))
            .await
            .unwrap();
        let err = AppStore::create(&store, Application::new(idb, subdomain("web")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn expired_sessions_are_filtered_and_purged() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let live = AuthSession {
            id: "a".repeat(64),
            identity: Identity::new("alice", AuthType::Oidc),
            org_id: None,
            app_id: None,
            claims: serde_json::Value::Null,
            created_at: now,
            expires_at: now + Duration::hours(1),
        };
        let dead = AuthSession {
            id: "b".repeat(64),
            expires_at: now - Duration::seconds(1),
            ..live.clone()
        };
        SessionStore::create(&store, live.clone()).await.unwrap();
        SessionStore::create(&store, dead).await.unwrap();

        assert!(
            SessionStore::validate(&store, &live.id)
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            SessionStore::validate(&store, &"b".repeat(64))
                .await
                .unwrap()
                .is_none()
        );
        // The expired row was dropped by validate; purge finds nothing left.
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn usage_increment_tracks_peak_concurrency() {
        let store = MemoryStore::new();
        let org = OrgId::new();
        let now = Utc::now();

        for _ in 0..3 {
            store
                .increment(
                    org,
                    UsageDelta {
                        concurrency: 1,
                        ..UsageDelta::default()
                    },
                )
                .await
                .unwrap();
        }
        store
            .increment(
                org,
                UsageDelta {
                    concurrency: -1,
                    ..UsageDelta::default()
                },
            )
            .await
            .unwrap();

        let snap = store.current(org, UsagePeriod::Hour, now).await.unwrap();
        assert_eq!(snap.peak_concurrent, 3);
    }

    #[tokio::test]
    async fn request_delta_accumulates() {
        let store = MemoryStore::new();
        let org = OrgId::new();
        store.increment(org, UsageDelta::request(100)).await.unwrap();
        store.increment(org, UsageDelta::request(250)).await.unwrap();

        let snap = store
            .current(org, UsagePeriod::Month, Utc::now())
            .await
            .unwrap();
        assert_eq!(snap.request_count, 2);
        assert_eq!(snap.bandwidth_bytes, 350);
    }

    #[tokio::test]
    async fn whitelist_scoped_fetch_fills_only_matching_tiers() {
        let store = MemoryStore::new();
        let org = OrgId::new();
        let app = AppId::new();
        store
            .add(WhitelistEntry::new(
                WhitelistScope::Global,
                "0.0.0.0/0".parse().unwrap(),
            ))
            .await
            .unwrap();
        store
            .add(WhitelistEntry::new(
                WhitelistScope::Org { org_id: org },
                "10.0.0.0/8".parse().unwrap(),
            ))
            .await
            .unwrap();
        store
            .add(WhitelistEntry::new(
                WhitelistScope::App { app_id: AppId::new() },
                "192.168.0.0/16".parse().unwrap(),
            ))
            .await
            .unwrap();

        let sets = store.scoped(Some(app), Some(org), None).await.unwrap();
        assert_eq!(sets.global.len(), 1);
        assert_eq!(sets.org.len(), 1);
        assert!(sets.app.is_empty());
        assert!(sets.account.is_empty());
    }
}
