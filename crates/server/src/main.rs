//! Warren edge server binary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use warren_audit::{BatchingAuditWriter, WriterConfig};
use warren_audit_memory::MemoryAuditSink;
use warren_core::{Account, Organization, WhitelistEntry, WhitelistScope};
use warren_crypto::{random_hex, sha256_hex};
use warren_store::Repositories;
use warren_store_memory::MemoryStore;
use warren_tunnel::{TunnelManager, TunnelConfig};

use warren_server::auth::oidc::OidcClient;
use warren_server::auth::session;
use warren_server::config::Config;
use warren_server::policy::{self, PolicyLoader};
use warren_server::quota::{self, QuotaAccountant};
use warren_server::ratelimit::{self, RateLimiter};
use warren_server::registration::EdgeRegistrationPolicy;
use warren_server::{AppState, build_router, telemetry};

/// Cadence of the expired-session purge.
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Parser)]
#[command(name = "warren-server", about = "Reverse tunnel edge server")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "warren.toml")]
    config: String,

    /// Override the configured listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Dev mode: accept a generated signing key and seed fixtures.
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config, cli.dev)?;
    if let Some(port) = cli.port {
        config.raw.port = port;
    }
    let config = Arc::new(config);

    // The durable store is an external collaborator; this binary wires the
    // in-memory backend, suitable for dev and single-process deployments.
    let store = Arc::new(MemoryStore::new());
    let repos = Repositories {
        accounts: store.clone(),
        orgs: store.clone(),
        apps: store.clone(),
        policies: store.clone(),
        keys: store.clone(),
        sessions: store.clone(),
        ratelimit: store.clone(),
        tunnels: store.clone(),
        usage: store.clone(),
        whitelist: store.clone(),
    };

    let audit = Arc::new(BatchingAuditWriter::spawn(
        Arc::new(MemoryAuditSink::new()),
        WriterConfig {
            flush_interval: config.audit_flush_interval(),
            ..WriterConfig::default()
        },
    ));

    let limiter = Arc::new(RateLimiter::new(
        config.raw.rate_limit.clone(),
        Arc::clone(&repos.ratelimit),
    ));
    limiter.load_persisted().await;

    let policies = Arc::new(PolicyLoader::new(
        Arc::clone(&repos.apps),
        Arc::clone(&repos.policies),
        config.policy_cache_ttl(),
    ));
    let quota = Arc::new(QuotaAccountant::new(
        Arc::clone(&repos.orgs),
        Arc::clone(&repos.usage),
    ));

    let registration = Arc::new(EdgeRegistrationPolicy::new(
        repos.clone(),
        Arc::clone(&quota),
        Arc::clone(&audit),
    ));
    let tunnels = Arc::new(TunnelManager::new(
        TunnelConfig {
            reserved: config.reserved.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            forward_timeout: config.forward_timeout(),
            max_body: config.raw.max_body_bytes,
            scheme: config.raw.scheme.clone(),
            domain: config.raw.domain.clone(),
        },
        registration,
    ));

    if config.raw.dev_mode {
        seed_dev_fixtures(&repos).await;
    }

    let state = AppState {
        config: Arc::clone(&config),
        repos: repos.clone(),
        audit: Arc::clone(&audit),
        limiter: Arc::clone(&limiter),
        policies: Arc::clone(&policies),
        quota: Arc::clone(&quota),
        tunnels: Arc::clone(&tunnels),
        oidc: Arc::new(OidcClient::new()),
    };

    let cancel = CancellationToken::new();
    let tasks = TaskTracker::new();
    tasks.spawn(ratelimit::run_background(
        Arc::clone(&limiter),
        cancel.clone(),
    ));
    tasks.spawn(policy::run_sweeper(
        Arc::clone(&policies),
        config.policy_cache_ttl(),
        cancel.clone(),
    ));
    tasks.spawn(quota::run_rollup(
        Arc::clone(&repos.usage),
        config.usage_rollup_interval(),
        cancel.clone(),
    ));
    tasks.spawn(session::run_purge(
        Arc::clone(&repos.sessions),
        SESSION_PURGE_INTERVAL,
        cancel.clone(),
    ));

    let router = build_router(state);
    let bind: SocketAddr = ([0, 0, 0, 0], config.raw.port).into();
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(
        %bind,
        domain = config.raw.domain,
        scheme = config.raw.scheme,
        "warren edge listening"
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain: stop registrations, notify clients, close stragglers, then
    // flush every piece of persistent state.
    info!("shutting down");
    tunnels.drain(config.shutdown_grace()).await;
    cancel.cancel();
    tasks.close();
    tasks.wait().await;
    limiter.flush().await;
    audit.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Seed an organization, an account, and a wildcard whitelist for local
/// use. The raw token is printed once; only its hash is stored.
async fn seed_dev_fixtures(repos: &Repositories) {
    let org = Organization::new("dev", None);
    let org_id = org.id;
    if let Err(e) = repos.orgs.create(org).await {
        warn!(error = %e, "dev org seed failed");
        return;
    }

    let token = format!("wtk_{}", random_hex(16));
    let mut account = Account::new("dev", sha256_hex(token.as_bytes()));
    account.org_id = Some(org_id);
    account.is_org_admin = true;
    if let Err(e) = repos.accounts.create(account).await {
        warn!(error = %e, "dev account seed failed");
        return;
    }

    for range in ["0.0.0.0/0", "::/0"] {
        let entry = WhitelistEntry::new(WhitelistScope::Global, range.parse().expect("parses"));
        if let Err(e) = repos.whitelist.add(entry).await {
            warn!(error = %e, "dev whitelist seed failed");
        }
    }

    info!(token = %token, "dev fixtures seeded; authenticate tunnel clients with this token");
}
