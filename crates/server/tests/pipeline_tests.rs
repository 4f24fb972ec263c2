//! End-to-end pipeline tests: the real router over in-memory backends,
//! with scripted tunnel clients attached through the in-process transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use argon2::Argon2;
use argon2::password_hash::{PasswordHasher, SaltString, rand_core::OsRng};
use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use tower::ServiceExt;

use warren_audit::{BatchingAuditWriter, WriterConfig};
use warren_audit_memory::MemoryAuditSink;
use warren_core::{
    Account, Application, AuthPolicy, AuthScheme, FailureReason, OidcConfig, Organization,
    PlanLimits, Subdomain, UsagePeriod, WhitelistEntry, WhitelistScope,
};
use warren_crypto::sha256_hex;
use warren_store::{Repositories, UsageStore};
use warren_store_memory::MemoryStore;
use warren_tunnel::protocol::Frame;
use warren_tunnel::transport::memory_pair;
use warren_tunnel::{DEFAULT_MAX_BODY, TunnelConfig, TunnelManager};

use warren_server::auth::oidc::OidcClient;
use warren_server::config::{Config, ValidatedConfig};
use warren_server::policy::PolicyLoader;
use warren_server::quota::QuotaAccountant;
use warren_server::ratelimit::RateLimiter;
use warren_server::registration::EdgeRegistrationPolicy;
use warren_server::{AppState, build_router};

// -- Harness --------------------------------------------------------------

struct Harness {
    router: Router,
    state: AppState,
    store: Arc<MemoryStore>,
    sink: Arc<MemoryAuditSink>,
}

fn test_config() -> ValidatedConfig {
    let config: Config = toml::from_str(
        r#"
        domain = "tun.example"
        scheme = "https"
        jwt_secret = "0123456789abcdef0123456789abcdef"
        trusted_proxies = ["private"]
        "#,
    )
    .unwrap();
    config.validate().unwrap()
}

fn build_harness() -> Harness {
    let config = Arc::new(test_config());
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

    let sink = Arc::new(MemoryAuditSink::new());
    let audit = Arc::new(BatchingAuditWriter::spawn(
        sink.clone(),
        WriterConfig {
            flush_interval: Duration::from_millis(10),
            max_batch: 1,
            queue_capacity: 1024,
        },
    ));

    let limiter = Arc::new(RateLimiter::new(
        config.raw.rate_limit.clone(),
        Arc::clone(&repos.ratelimit),
    ));
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
            heartbeat_interval: Duration::from_secs(30),
            forward_timeout: Duration::from_secs(2),
            max_body: config.raw.max_body_bytes,
            scheme: config.raw.scheme.clone(),
            domain: config.raw.domain.clone(),
        },
        registration,
    ));

    let state = AppState {
        config,
        repos,
        audit,
        limiter,
        policies,
        quota,
        tunnels,
        oidc: Arc::new(OidcClient::new()),
    };
    Harness {
        router: build_router(state.clone()),
        state,
        store,
        sink,
    }
}

/// Fire one request at the router with a fixed socket peer.
async fn send(
    router: &Router,
    method: &str,
    host: &str,
    path: &str,
    peer: &str,
    headers: &[(&str, &str)],
) -> Response {
    let mut builder = Request::builder().method(method).uri(path).header("host", host);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let mut request = builder.body(Body::empty()).unwrap();
    let peer: SocketAddr = format!("{peer}:44321").parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    router.clone().oneshot(request).await.unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Attach a scripted tunnel client that answers every forwarded request
/// with a fixed response. Returns once registration completed, with the
/// count of requests the client has seen.
async fn attach_client(
    state: &AppState,
    account: Account,
    subdomain: &str,
    status: u16,
    body: &'static [u8],
) -> Arc<AtomicU32> {
    let (server_side, client_side) = memory_pair(64);
    let (sink, stream) = server_side.split();
    let manager = Arc::clone(&state.tunnels);
    let client_ip = "203.0.113.50".parse().unwrap();
    tokio::spawn(async move {
        manager
            .serve_connection(Box::new(sink), Box::new(stream), account, client_ip)
            .await;
    });

    let (mut tx, mut rx) = client_side.split();
    use warren_tunnel::{FrameSink, FrameStream};
    tx.send(
        Frame::Register {
            subdomains: vec![subdomain.to_owned()],
        }
        .encode(),
    )
    .await
    .unwrap();
    let reply = rx.recv().await.unwrap().expect("registration reply");
    match Frame::decode(reply, DEFAULT_MAX_BODY).unwrap() {
        Frame::RegisterOk { .. } => {}
        other => panic!("registration failed: {other:?}"),
    }

    let seen = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&seen);
    tokio::spawn(async move {
        while let Ok(Some(data)) = rx.recv().await {
            match Frame::decode(data, DEFAULT_MAX_BODY) {
                Ok(Frame::HttpRequest { id, .. }) => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let frame = Frame::HttpResponse {
                        id,
                        status,
                        headers: vec![(
                            bytes::Bytes::from_static(b"content-type"),
                            bytes::Bytes::from_static(b"text/plain"),
                        )],
                        body: bytes::Bytes::from_static(body),
                    };
                    if tx.send(frame.encode()).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Ping) => {
                    if tx.send(Frame::Pong.encode()).await.is_err() {
                        break;
                    }
                }
                Ok(Frame::Shutdown) => break,
                _ => {}
            }
        }
    });
    seen
}

async fn seed_org_account(store: &Arc<MemoryStore>, plan: Option<PlanLimits>) -> (Organization, Account) {
    use warren_store::{AccountStore, OrgStore};
    let org = Organization::new("acme", plan);
    OrgStore::create(&**store, org.clone()).await.unwrap();
    let mut account = Account::new("tunneler", sha256_hex(b"raw-token"));
    account.org_id = Some(org.id);
    AccountStore::create(&**store, account.clone()).await.unwrap();
    (org, account)
}

async fn allow_all(store: &Arc<MemoryStore>) {
    use warren_store::WhitelistStore;
    store
        .add(WhitelistEntry::new(
            WhitelistScope::Global,
            "0.0.0.0/0".parse().unwrap(),
        ))
        .await
        .unwrap();
}

fn basic_policy() -> AuthPolicy {
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(b"p", &salt)
        .unwrap()
        .to_string();
    AuthPolicy {
        scheme: AuthScheme::Basic {
            username_hash: sha256_hex(b"u"),
            password_hash,
        },
        accept_api_keys: false,
        session_duration: Duration::from_secs(3600),
    }
}

/// Wait until the batched audit writer has surfaced a matching event.
async fn await_audit<F: Fn(&Arc<MemoryAuditSink>) -> bool>(sink: &Arc<MemoryAuditSink>, check: F) {
    for _ in 0..100 {
        if check(sink) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("audit event did not arrive");
}

// -- Scenarios ------------------------------------------------------------

#[tokio::test]
async fn happy_forward_counts_usage() {
    let h = build_harness();
    allow_all(&h.store).await;
    let (org, account) = seed_org_account(&h.store, None).await;
    attach_client(&h.state, account, "web", 200, b"pong").await;

    let response = send(&h.router, "GET", "web.tun.example", "/ping", "8.8.8.8", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "pong");

    let usage = h
        .store
        .current(org.id, UsagePeriod::Month, chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(usage.request_count, 1);
    assert_eq!(usage.bandwidth_bytes, 4);
    assert_eq!(usage.peak_concurrent, 1);
}

#[tokio::test]
async fn security_headers_on_every_response() {
    let h = build_harness();
    let response = send(&h.router, "GET", "tun.example", "/", "8.8.8.8", &[]).await;
    let headers = response.headers();
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(
        headers.get("strict-transport-security").unwrap(),
        "max-age=31536000; includeSubDomains"
    );
    assert_eq!(
        headers.get("content-security-policy").unwrap(),
        "default-src 'self'; frame-ancestors 'none'"
    );
    assert_eq!(
        headers.get("referrer-policy").unwrap(),
        "strict-origin-when-cross-origin"
    );
}

#[tokio::test]
async fn reserved_label_is_never_forwarded() {
    let h = build_harness();
    allow_all(&h.store).await;
    let response = send(&h.router, "GET", "admin.tun.example", "/", "8.8.8.8", &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_tunnel_is_not_queued() {
    let h = build_harness();
    allow_all(&h.store).await;
    let response = send(&h.router, "GET", "ghost.tun.example", "/", "8.8.8.8", &[]).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    await_audit(&h.sink, |s| {
        s.failures_with(FailureReason::NoTunnel) == 1
    })
    .await;
}

#[tokio::test]
async fn basic_challenge_then_success() {
    use warren_store::{AppStore, PolicyStore};
    let h = build_harness();
    allow_all(&h.store).await;
    let (org, account) = seed_org_account(&h.store, None).await;
    let app = Application::new(org.id, Subdomain::parse("docs").unwrap());
    AppStore::create(&*h.store, app.clone()).await.unwrap();
    h.store.put_org_policy(org.id, basic_policy()).await.unwrap();
    attach_client(&h.state, account, "docs", 200, b"hello").await;

    // No credentials: challenged.
    let response = send(&h.router, "GET", "docs.tun.example", "/", "8.8.8.8", &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get("www-authenticate").unwrap(),
        "Basic realm=\"docs\""
    );

    // "u:p" in base64.
    let response = send(
        &h.router,
        "GET",
        "docs.tun.example",
        "/",
        "8.8.8.8",
        &[("authorization", "Basic dTpw")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "hello");

    await_audit(&h.sink, |s| {
        s.events()
            .iter()
            .any(|e| e.success && e.identity.as_deref() == Some("u"))
    })
    .await;
}

#[tokio::test]
async fn basic_success_sets_a_session_cookie_that_skips_the_challenge() {
    use warren_store::{AppStore, PolicyStore};
    let h = build_harness();
    allow_all(&h.store).await;
    let (org, account) = seed_org_account(&h.store, None).await;
    let app = Application::new(org.id, Subdomain::parse("docs").unwrap());
    AppStore::create(&*h.store, app).await.unwrap();
    h.store.put_org_policy(org.id, basic_policy()).await.unwrap();
    attach_client(&h.state, account, "docs", 200, b"hello").await;

    let response = send(
        &h.router,
        "GET",
        "docs.tun.example",
        "/",
        "8.8.8.8",
        &[("authorization", "Basic dTpw")],
    )
    .await;
    let set_cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(set_cookie.contains("HttpOnly"));
    let pair = set_cookie.split(';').next().unwrap().to_owned();

    // Same request with only the cookie: no challenge.
    let response = send(
        &h.router,
        "GET",
        "docs.tun.example",
        "/",
        "8.8.8.8",
        &[("cookie", pair.as_str())],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_blocks_the_eleventh_attempt() {
    use warren_store::{AppStore, PolicyStore};
    let h = build_harness();
    allow_all(&h.store).await;
    let (org, account) = seed_org_account(&h.store, None).await;
    let app = Application::new(org.id, Subdomain::parse("docs").unwrap());
    AppStore::create(&*h.store, app).await.unwrap();
    h.store.put_org_policy(org.id, basic_policy()).await.unwrap();
    attach_client(&h.state, account, "docs", 200, b"hello").await;

    // Ten wrong-password attempts from one address.
    for _ in 0..10 {
        let response = send(
            &h.router,
            "GET",
            "docs.tun.example",
            "/",
            "1.2.3.4",
            // "u:wrong" in base64.
            &[("authorization", "Basic dTp3cm9uZw==")],
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = send(
        &h.router,
        "GET",
        "docs.tun.example",
        "/",
        "1.2.3.4",
        &[("authorization", "Basic dTp3cm9uZw==")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("retry-after").unwrap(), "1800");

    // A different address is unaffected.
    let response = send(
        &h.router,
        "GET",
        "docs.tun.example",
        "/",
        "5.6.7.8",
        &[("authorization", "Basic dTpw")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    await_audit(&h.sink, |s| {
        s.failures_with(FailureReason::RateLimited) >= 1
            && s.failures_with(FailureReason::InvalidCredentials) == 10
    })
    .await;
}

#[tokio::test]
async fn quota_hard_stop_emits_no_tunnel_request() {
    let h = build_harness();
    allow_all(&h.store).await;
    let (org, account) = seed_org_account(
        &h.store,
        Some(PlanLimits {
            requests_monthly: Some(2),
            overage_percent: 0,
            ..PlanLimits::unlimited()
        }),
    )
    .await;
    let seen = attach_client(&h.state, account, "web", 200, b"ok").await;

    for _ in 0..2 {
        let response = send(&h.router, "GET", "web.tun.example", "/", "8.8.8.8", &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = send(&h.router, "GET", "web.tun.example", "/", "8.8.8.8", &[]).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("x-quota-remaining").unwrap(), "0");
    assert!(response.headers().contains_key("retry-after"));

    // The over-quota request never crossed the tunnel.
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    let usage = h
        .store
        .current(org.id, UsagePeriod::Month, chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(usage.request_count, 2);
}

#[tokio::test]
async fn whitelist_first_tier_denies_even_if_global_would_admit() {
    use warren_store::{AppStore, WhitelistStore};
    let h = build_harness();
    let (org, account) = seed_org_account(&h.store, None).await;
    let app = Application::new(org.id, Subdomain::parse("internal").unwrap());
    let app_id = app.id;
    AppStore::create(&*h.store, app).await.unwrap();

    h.store
        .add(WhitelistEntry::new(
            WhitelistScope::Global,
            "0.0.0.0/0".parse().unwrap(),
        ))
        .await
        .unwrap();
    h.store
        .add(WhitelistEntry::new(
            WhitelistScope::App { app_id },
            "10.0.0.0/8".parse().unwrap(),
        ))
        .await
        .unwrap();
    attach_client(&h.state, account, "internal", 200, b"secret").await;

    let response = send(
        &h.router,
        "GET",
        "internal.tun.example",
        "/",
        "8.8.8.8",
        &[],
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        body_string(response).await,
        "{\"error\":\"ip_not_whitelisted\"}"
    );
}

#[tokio::test]
async fn oidc_policy_redirects_to_login() {
    use warren_store::{AppStore, PolicyStore};
    let h = build_harness();
    allow_all(&h.store).await;
    let (org, _account) = seed_org_account(&h.store, None).await;
    let app = Application::new(org.id, Subdomain::parse("app1").unwrap());
    AppStore::create(&*h.store, app).await.unwrap();
    h.store
        .put_org_policy(
            org.id,
            AuthPolicy {
                scheme: AuthScheme::Oidc(OidcConfig {
                    issuer: "https://idp.test".to_owned(),
                    client_id: "client-1".to_owned(),
                    client_secret_enc: "ENC[AES256-GCM,data:AAAA,iv:AAAA,tag:AAAA]".to_owned(),
                    scopes: vec!["openid".to_owned(), "email".to_owned()],
                    allowed_email_domains: vec!["acme.test".to_owned()],
                    required_claims: Default::default(),
                }),
                accept_api_keys: false,
                session_duration: Duration::from_secs(3600),
            },
        )
        .await
        .unwrap();

    let response = send(&h.router, "GET", "app1.tun.example", "/", "8.8.8.8", &[]).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "/__auth/login?redirect=%2F"
    );
}

#[tokio::test]
async fn oidc_callback_with_bad_state_is_invalid_credentials() {
    use warren_store::{AppStore, PolicyStore};
    let h = build_harness();
    allow_all(&h.store).await;
    let (org, _account) = seed_org_account(&h.store, None).await;
    let app = Application::new(org.id, Subdomain::parse("app1").unwrap());
    AppStore::create(&*h.store, app).await.unwrap();
    h.store
        .put_org_policy(
            org.id,
            AuthPolicy {
                scheme: AuthScheme::Oidc(OidcConfig {
                    issuer: "https://idp.test".to_owned(),
                    client_id: "client-1".to_owned(),
                    client_secret_enc: "ENC[AES256-GCM,data:AAAA,iv:AAAA,tag:AAAA]".to_owned(),
                    scopes: vec![],
                    allowed_email_domains: vec![],
                    required_claims: Default::default(),
                }),
                accept_api_keys: false,
                session_duration: Duration::from_secs(3600),
            },
        )
        .await
        .unwrap();

    // No state cookie at all: a credential failure, not a redirect loop.
    let response = send(
        &h.router,
        "GET",
        "app1.tun.example",
        "/__auth/callback?code=abc&state=xyz",
        "8.8.8.8",
        &[],
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_string(response).await,
        "{\"error\":\"invalid_credentials\"}"
    );
}

#[tokio::test]
async fn api_key_scope_and_envelope() {
    use warren_store::{ApiKeyStore, AppStore, PolicyStore};
    let h = build_harness();
    allow_all(&h.store).await;
    let (org, account) = seed_org_account(&h.store, None).await;
    let app = Application::new(org.id, Subdomain::parse("api-app").unwrap());
    AppStore::create(&*h.store, app).await.unwrap();
    h.store
        .put_org_policy(
            org.id,
            AuthPolicy {
                scheme: AuthScheme::ApiKey,
                accept_api_keys: true,
                session_duration: Duration::from_secs(3600),
            },
        )
        .await
        .unwrap();
    attach_client(&h.state, account, "api-app", 200, b"data").await;

    // No key: 401 JSON envelope, no challenge header.
    let response = send(&h.router, "GET", "api-app.tun.example", "/", "8.8.8.8", &[]).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get("www-authenticate").is_none());
    assert_eq!(
        body_string(response).await,
        "{\"error\":\"missing_credentials\"}"
    );

    // A key scoped to this org works through X-API-Key.
    let raw = "wk_live_0123456789";
    let key = warren_core::ApiKey {
        id: warren_core::KeyId::new(),
        org_id: org.id,
        app_id: None,
        key_hash: sha256_hex(raw.as_bytes()),
        prefix: "wk_live".to_owned(),
        expires_at: None,
        last_used_at: None,
        created_at: chrono::Utc::now(),
    };
    ApiKeyStore::create(&*h.store, key).await.unwrap();

    let response = send(
        &h.router,
        "GET",
        "api-app.tun.example",
        "/",
        "8.8.8.8",
        &[("x-api-key", raw)],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "data");
}

#[tokio::test]
async fn auth_health_reports_mode_and_policy_presence() {
    use warren_store::{AppStore, PolicyStore};
    let h = build_harness();
    let (org, _account) = seed_org_account(&h.store, None).await;
    let app = Application::new(org.id, Subdomain::parse("docs").unwrap());
    AppStore::create(&*h.store, app).await.unwrap();
    h.store.put_org_policy(org.id, basic_policy()).await.unwrap();

    let response = send(
        &h.router,
        "GET",
        "docs.tun.example",
        "/__auth/health",
        "8.8.8.8",
        &[],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["subdomain"], "docs");
    assert_eq!(body["auth_mode"], "inherit");
    assert_eq!(body["effective_auth"], "basic");
    assert_eq!(body["org_policy"], true);
}

#[tokio::test]
async fn trusted_proxy_chain_resolves_the_real_client() {
    use warren_store::{AppStore, WhitelistStore};
    let h = build_harness();
    let (org, account) = seed_org_account(&h.store, None).await;
    let app = Application::new(org.id, Subdomain::parse("internal").unwrap());
    let app_id = app.id;
    AppStore::create(&*h.store, app).await.unwrap();
    // Only 9.9.9.9 may reach the app.
    h.store
        .add(WhitelistEntry::new(
            WhitelistScope::App { app_id },
            "9.9.9.9/32".parse().unwrap(),
        ))
        .await
        .unwrap();
    attach_client(&h.state, account, "internal", 200, b"ok").await;

    // Trusted peer (private range) forwarding for the whitelisted client.
    let response = send(
        &h.router,
        "GET",
        "internal.tun.example",
        "/",
        "10.0.0.1",
        &[("x-forwarded-for", "9.9.9.9")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Untrusted peer claiming the same header is ignored.
    let response = send(
        &h.router,
        "GET",
        "internal.tun.example",
        "/",
        "8.8.4.4",
        &[("x-forwarded-for", "9.9.9.9")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
