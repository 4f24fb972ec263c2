//! The live-tunnel registry: registration handshake, request dispatch, and
//! teardown.
//!
//! Lock discipline: the live map is read-mostly and its guard is never held
//! across a tunnel-local lock or a socket write — lookups clone the `Arc`
//! and drop the guard before touching the connection.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn};
use tracing::Instrument;

use warren_core::{Account, AppId, FailureReason, OrgId, Subdomain, TunnelRecord};

use crate::conn::{
    CloseReason, ConnShared, ForwardRequest, ForwardResponse, TunnelHandle, run_reader, run_writer,
};
use crate::error::ForwardError;
use crate::protocol::{DEFAULT_MAX_BODY, Frame};
use crate::transport::{FrameSink, FrameStream};

/// Context resolved for one subdomain claim.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClaimContext {
    /// Organization the claim is accounted against.
    pub org_id: Option<OrgId>,
    /// Persistent application owning the subdomain, if any.
    pub app_id: Option<AppId>,
}

/// Policy seam the server wires in: ownership checks, quota reservation,
/// record keeping, and audit around the registry's map operations.
#[async_trait]
pub trait RegistrationPolicy: Send + Sync {
    /// Authorize one subdomain claim and reserve quota for it.
    ///
    /// The registry has already rejected reserved labels. Implementations
    /// check persistent-app ownership and the concurrency quota; a granted
    /// reservation is paid back through [`release`](Self::release) or
    /// [`closed`](Self::closed).
    async fn authorize(
        &self,
        account: &Account,
        subdomain: &Subdomain,
    ) -> Result<ClaimContext, FailureReason>;

    /// The claim lost the insertion race; release what `authorize` reserved.
    async fn release(&self, ctx: ClaimContext);

    /// The claim committed: persist the opened record, emit audit.
    async fn opened(&self, record: &TunnelRecord, ctx: ClaimContext);

    /// The tunnel closed: stamp the record, release quota, account usage.
    async fn closed(
        &self,
        record: &TunnelRecord,
        ctx: ClaimContext,
        bytes_in: u64,
        bytes_out: u64,
        reason: &str,
    );
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Labels that can never be claimed (already normalized).
    pub reserved: HashSet<String>,
    /// Heartbeat cadence; the read deadline is twice this.
    pub heartbeat_interval: Duration,
    /// Per-request deadline for forwarded traffic.
    pub forward_timeout: Duration,
    /// Body cap applied to decoded frames.
    pub max_body: usize,
    /// URL scheme for composed public URLs.
    pub scheme: String,
    /// Base domain for composed public URLs.
    pub domain: String,
}

impl TunnelConfig {
    /// Compose the public URL for a claimed subdomain.
    #[must_use]
    pub fn public_url(&self, subdomain: &Subdomain) -> String {
        format!("{}://{}.{}", self.scheme, subdomain, self.domain)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            reserved: HashSet::new(),
            heartbeat_interval: Duration::from_secs(30),
            forward_timeout: Duration::from_secs(300),
            max_body: DEFAULT_MAX_BODY,
            scheme: "https".to_owned(),
            domain: "localhost".to_owned(),
        }
    }
}

/// The registry of live tunnels, indexed by subdomain.
pub struct TunnelManager {
    live: DashMap<Subdomain, Arc<TunnelHandle>>,
    config: TunnelConfig,
    policy: Arc<dyn RegistrationPolicy>,
    draining: AtomicBool,
}

impl TunnelManager {
    #[must_use]
    pub fn new(config: TunnelConfig, policy: Arc<dyn RegistrationPolicy>) -> Self {
        Self {
            live: DashMap::new(),
            config,
            policy,
            draining: AtomicBool::new(false),
        }
    }

    /// Whether a live tunnel currently owns `subdomain`.
    #[must_use]
    pub fn is_attached(&self, subdomain: &Subdomain) -> bool {
        self.live.contains_key(subdomain)
    }

    /// Number of live claims.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// The organization the live claim on `subdomain` is accounted to.
    ///
    /// Ephemeral subdomains carry no persistent application, so the claim
    /// context is the only place their organization is known.
    #[must_use]
    pub fn claim_org(&self, subdomain: &Subdomain) -> Option<OrgId> {
        self.live.get(subdomain).and_then(|entry| entry.org_id)
    }

    /// Live claims accounted to `org`.
    #[must_use]
    pub fn live_count_for_org(&self, org: OrgId) -> usize {
        self.live
            .iter()
            .filter(|e| e.org_id == Some(org))
            .count()
    }

    /// Forward a public request to the owner of `subdomain`.
    pub async fn forward(
        &self,
        subdomain: &Subdomain,
        request: ForwardRequest,
    ) -> Result<ForwardResponse, ForwardError> {
        // Clone out of the map so the shard guard is not held across the
        // socket write or the wait.
        let handle = self
            .live
            .get(subdomain)
            .map(|entry| Arc::clone(entry.value()));
        let Some(handle) = handle else {
            return Err(ForwardError::NoTunnel);
        };
        handle.forward(request).await
    }

    /// Drive one authenticated client connection to completion.
    ///
    /// Performs the registration handshake, then pumps frames until the
    /// connection ends, and finally tears down every claim. The account has
    /// already been token-authenticated by the caller.
    pub async fn serve_connection(
        &self,
        sink: Box<dyn FrameSink>,
        stream: Box<dyn FrameStream>,
        account: Account,
        client_ip: IpAddr,
    ) {
        if self.draining.load(Ordering::SeqCst) {
            debug!("refusing registration while draining");
            return;
        }

        let span = info_span!("tunnel", account = %account.username, %client_ip);
        self.serve_inner(sink, stream, account, client_ip)
            .instrument(span)
            .await;
    }

    async fn serve_inner(
        &self,
        sink: Box<dyn FrameSink>,
        mut stream: Box<dyn FrameStream>,
        account: Account,
        client_ip: IpAddr,
    ) {
        // Registration must arrive within one read deadline.
        let first = tokio::time::timeout(self.config.heartbeat_interval * 2, stream.recv()).await;
        let subdomains = match first {
            Ok(Ok(Some(data))) => match Frame::decode(data, self.config.max_body) {
                Ok(Frame::Register { subdomains }) => subdomains,
                Ok(_) | Err(_) => {
                    warn!("connection opened with a non-register frame");
                    return;
                }
            },
            _ => return,
        };

        let (writer_tx, writer_rx) = mpsc::channel(64);
        let conn = Arc::new(ConnShared::new(writer_tx, self.config.forward_timeout));
        let cancel = conn.cancel_token();
        let writer_task = tokio::spawn(run_writer(sink, writer_rx, cancel.clone()));

        let mut handles: Vec<Arc<TunnelHandle>> = Vec::new();
        let mut contexts: Vec<ClaimContext> = Vec::new();
        for raw in subdomains {
            match self
                .register_claim(&raw, &account, client_ip, &conn)
                .await
            {
                Ok((handle, ctx)) => {
                    let frame = Frame::RegisterOk {
                        subdomain: handle.subdomain.to_string(),
                        public_url: self.config.public_url(&handle.subdomain),
                    };
                    if conn.send(frame).await.is_err() {
                        break;
                    }
                    handles.push(handle);
                    contexts.push(ctx);
                }
                Err(reason) => {
                    let frame = Frame::RegisterReject {
                        subdomain: raw,
                        reason: reason.as_str().to_owned(),
                    };
                    if conn.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }

        let reason = if handles.is_empty() {
            debug!("no subdomain accepted, closing");
            CloseReason::Disconnected
        } else {
            info!(claims = handles.len(), "tunnel established");
            run_reader(
                stream,
                &conn,
                self.config.heartbeat_interval,
                self.config.max_body,
            )
            .await
        };

        // Teardown. Pending entries are resolved before the live-map
        // entries go away, and the closed flag keeps new ones out.
        conn.fail_pending();
        for (handle, ctx) in handles.iter().zip(contexts) {
            self.live
                .remove_if(&handle.subdomain, |_, v| v.shares_conn_of(handle));
            self.policy
                .closed(
                    &handle.record,
                    ctx,
                    handle.bytes_in(),
                    handle.bytes_out(),
                    reason.as_str(),
                )
                .await;
        }
        cancel.cancel();
        let _ = writer_task.await;
        info!(reason = reason.as_str(), "tunnel closed");
    }

    /// Authorize and commit one subdomain claim.
    async fn register_claim(
        &self,
        raw: &str,
        account: &Account,
        client_ip: IpAddr,
        conn: &Arc<ConnShared>,
    ) -> Result<(Arc<TunnelHandle>, ClaimContext), FailureReason> {
        let Ok(subdomain) = Subdomain::parse(raw) else {
            return Err(FailureReason::ProtocolError);
        };
        if self.config.reserved.contains(subdomain.as_str()) {
            return Err(FailureReason::SubdomainReserved);
        }

        // Ownership and quota are settled before the insertion commits.
        let ctx = self.policy.authorize(account, &subdomain).await?;

        let record = TunnelRecord::open(account.id, subdomain.clone(), client_ip, ctx.app_id);
        let handle = Arc::new(TunnelHandle::new(
            subdomain.clone(),
            record,
            ctx.org_id,
            ctx.app_id,
            Arc::clone(conn),
        ));

        // The entry guard is synchronous; no await happens while a shard
        // lock is held.
        let inserted = match self.live.entry(subdomain) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                true
            }
        };
        if inserted {
            self.policy.opened(&handle.record, ctx).await;
            Ok((handle, ctx))
        } else {
            // Lost the race; the first inserter keeps the claim.
            self.policy.release(ctx).await;
            Err(FailureReason::SubdomainConflict)
        }
    }

    /// Stop accepting registrations, tell every client to move, and close
    /// what remains after the grace period.
    pub async fn drain(&self, grace: Duration) {
        self.draining.store(true, Ordering::SeqCst);

        let handles: Vec<Arc<TunnelHandle>> = self
            .live
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for handle in &handles {
            let _ = handle.send_shutdown().await;
        }
        if handles.is_empty() {
            return;
        }

        info!(live = handles.len(), "draining tunnels");
        tokio::time::sleep(grace).await;
        for handle in &handles {
            handle.cancel();
        }
        // Give the serve tasks a moment to finish teardown.
        for _ in 0..50 {
            if self.live.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
