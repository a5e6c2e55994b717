//! End-to-end tests of the admission pipeline, driving the full router
//! with scripted admission stores so no live Redis is needed.

use async_trait::async_trait;
use atlas_shield::{
    build_router, build_state_with_store,
    config::ShieldConfig,
    error::{Result, ShieldError},
    identity::Principal,
    rate_limit::{AdmissionStore, ShieldState, Verdict},
};
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower::ServiceExt;

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Store with a fixed token budget and no refill, so exhaustion is
/// deterministic.
struct BudgetStore {
    tokens: AtomicI64,
    calls: AtomicUsize,
}

impl BudgetStore {
    fn new(tokens: i64) -> Self {
        Self {
            tokens: AtomicI64::new(tokens),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdmissionStore for BudgetStore {
    async fn check_and_consume(&self, _principal: &Principal) -> Result<Verdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let previous = self.tokens.fetch_sub(1, Ordering::SeqCst);
        if previous > 0 {
            Ok(Verdict {
                allowed: true,
                remaining: previous - 1,
                reset: epoch_seconds(),
            })
        } else {
            self.tokens.fetch_add(1, Ordering::SeqCst);
            Ok(Verdict {
                allowed: false,
                remaining: 0,
                reset: epoch_seconds() + 1,
            })
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Store whose every command fails, as if Redis were unreachable
struct UnreachableStore;

#[async_trait]
impl AdmissionStore for UnreachableStore {
    async fn check_and_consume(&self, _principal: &Principal) -> Result<Verdict> {
        Err(ShieldError::StoreTimeout(2000))
    }

    async fn ping(&self) -> Result<()> {
        Err(ShieldError::StoreTimeout(2000))
    }
}

fn test_config() -> ShieldConfig {
    ShieldConfig::for_testing("redis://127.0.0.1:6379")
}

fn state_with(config: &ShieldConfig, store: Arc<dyn AdmissionStore>) -> ShieldState {
    build_state_with_store(config, store).expect("valid test config")
}

fn request_from(addr: &str) -> Request<Body> {
    let mut request = Request::builder()
        .uri("/")
        .body(Body::empty())
        .expect("request");
    let socket: SocketAddr = format!("{}:40000", addr).parse().expect("socket addr");
    request.extensions_mut().insert(ConnectInfo(socket));
    request
}

fn request_with_api_key(key: &str) -> Request<Body> {
    Request::builder()
        .uri("/")
        .header("X-API-Key", key)
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn test_burst_until_exhaustion_then_denial() {
    let store = Arc::new(BudgetStore::new(5));
    let state = state_with(&test_config(), store.clone());
    let app = build_router(state);

    for expected_remaining in (0..5).rev() {
        let response = app
            .clone()
            .oneshot(request_from("1.1.1.1"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("X-RateLimit-Remaining").unwrap(),
            &expected_remaining.to_string()
        );
        assert_eq!(response.headers().get("X-RateLimit-Limit").unwrap(), "100");
    }

    let response = app
        .clone()
        .oneshot(request_from("1.1.1.1"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("Retry-After").unwrap(), "1");

    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("body");
    let json: serde_json::Value = serde_json::from_slice(&body).expect("json body");
    assert_eq!(json["error"], "Too Many Requests");
    assert_eq!(json["banned"], false);
    assert_eq!(json["remaining"], 0);
    assert_eq!(json["retry_after_seconds"], 1);
    assert_eq!(json["threat_detected"], false);
}

#[tokio::test]
async fn test_sustained_violations_escalate_to_ban() {
    let mut config = test_config();
    config.ban_threshold = 3;
    let store = Arc::new(BudgetStore::new(0));
    let state = state_with(&config, store.clone());
    let abuse = Arc::clone(&state.abuse);
    let metrics = Arc::clone(&state.metrics);
    let app = build_router(state);

    // Two plain denials below the threshold
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(request_from("2.2.2.2"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get("X-Threat-Level").is_none());
    }

    // The third denial crosses the threshold and installs the ban
    let response = app
        .clone()
        .oneshot(request_from("2.2.2.2"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("X-Threat-Level").unwrap(), "BANNED");
    assert_eq!(response.headers().get("X-Ban-Remaining").unwrap(), "600");

    let calls_when_banned = store.calls();

    // Subsequent requests short-circuit at the ban gate: 429 with ban
    // headers and no store traffic at all
    let response = app
        .clone()
        .oneshot(request_from("2.2.2.2"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("X-Threat-Level").unwrap(), "BANNED");
    assert_eq!(response.headers().get("X-RateLimit-Remaining").unwrap(), "0");
    assert!(response.headers().get("X-Ban-Remaining").is_some());
    assert_eq!(store.calls(), calls_when_banned);

    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("body");
    let json: serde_json::Value = serde_json::from_slice(&body).expect("json body");
    assert_eq!(json["banned"], true);
    assert_eq!(json["threat_detected"], true);

    // Another principal is untouched by the ban
    let response = app
        .clone()
        .oneshot(request_from("3.3.3.3"))
        .await
        .expect("response");
    assert!(response.headers().get("X-Threat-Level").is_none());

    assert_eq!(abuse.banned_clients(), 1);
    let snapshot = metrics.snapshot(abuse.banned_clients());
    assert_eq!(snapshot.threats_neutralized, 1);
    assert!(snapshot.threats_neutralized <= snapshot.blocked_malicious);
    assert_eq!(
        snapshot.blocked_standard + snapshot.blocked_malicious,
        snapshot.requests_blocked
    );
}

#[tokio::test]
async fn test_store_outage_fails_open() {
    let state = state_with(&test_config(), Arc::new(UnreachableStore));
    let metrics = Arc::clone(&state.metrics);
    let abuse = Arc::clone(&state.abuse);
    let app = build_router(state);

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(request_from("4.4.4.4"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let snapshot = metrics.snapshot(abuse.banned_clients());
    assert_eq!(snapshot.fail_open_events, 3);
    assert_eq!(snapshot.requests_blocked, 0);
    assert_eq!(snapshot.protection_rate, 0.0);
    assert!(snapshot.system_health_score < 100.0);
}

#[tokio::test]
async fn test_api_key_clients_share_one_quota() {
    let store = Arc::new(BudgetStore::new(1));
    let state = state_with(&test_config(), store);
    let metrics = Arc::clone(&state.metrics);
    let abuse = Arc::clone(&state.abuse);
    let app = build_router(state);

    // Same key from two different source addresses: one principal
    let mut first = request_with_api_key("secret123");
    first
        .extensions_mut()
        .insert(ConnectInfo("5.5.5.5:40000".parse::<SocketAddr>().unwrap()));
    let mut second = request_with_api_key("secret123");
    second
        .extensions_mut()
        .insert(ConnectInfo("6.6.6.6:40000".parse::<SocketAddr>().unwrap()));

    let response = app.clone().oneshot(first).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(second).await.expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let snapshot = metrics.snapshot(abuse.banned_clients());
    assert_eq!(snapshot.active_clients, 1);
}

#[tokio::test]
async fn test_missing_peer_degrades_to_unknown_principal() {
    let store = Arc::new(BudgetStore::new(10));
    let state = state_with(&test_config(), store);
    let app = build_router(state);

    // No ConnectInfo at all: the request still gets a decision
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_health_reports_degraded_store_but_stays_ok() {
    let state = state_with(&test_config(), Arc::new(UnreachableStore));
    let app = build_router(state);

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("body");
    let json: serde_json::Value = serde_json::from_slice(&body).expect("json body");
    assert_eq!(json["status"], "ok");
    assert_eq!(json["services"]["api"], "healthy");
    assert_eq!(json["services"]["redis"], "degraded");
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_health_reports_healthy_store() {
    let state = state_with(&test_config(), Arc::new(BudgetStore::new(10)));
    let app = build_router(state);

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.expect("response");

    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("body");
    let json: serde_json::Value = serde_json::from_slice(&body).expect("json body");
    assert_eq!(json["services"]["redis"], "healthy");
}

#[tokio::test]
async fn test_metrics_exposition_and_scrape_guard() {
    let store = Arc::new(BudgetStore::new(100));
    let state = state_with(&test_config(), store);
    let app = build_router(state);

    // Generate a little traffic first
    let response = app
        .clone()
        .oneshot(request_from("7.7.7.7"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("Content-Type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), 256 * 1024)
        .await
        .expect("body");
    let text = String::from_utf8(body.to_vec()).expect("utf8");
    assert!(text.contains("atlas_requests_allowed_total 1"));
    assert!(text.contains("# TYPE atlas_requests_allowed_total counter"));
    assert!(text.contains("atlas_system_health_score 100"));
    assert!(text.contains("atlas_response_time_ms{quantile=\"0.95\"}"));
    // Raw API keys must never leak into the exposition
    assert!(!text.contains("secret123"));

    // The scrape endpoint has its own 50-per-10s guard
    let mut last_status = StatusCode::OK;
    for _ in 0..55 {
        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        last_status = app
            .clone()
            .oneshot(request)
            .await
            .expect("response")
            .status();
    }
    assert_eq!(last_status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_expired_ban_readmits_principal() {
    let mut config = test_config();
    config.ban_threshold = 2;
    config.ban_duration_ms = 50;
    let store = Arc::new(BudgetStore::new(0));
    let state = state_with(&config, store.clone());
    let app = build_router(state);

    // Two denials cross the threshold and install the ban
    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(request_from("8.8.8.8"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
    assert_eq!(store.calls(), 2);

    tokio::time::sleep(std::time::Duration::from_millis(70)).await;

    // Ban expired and violation history purged with it: the request
    // reaches the store again and is denied on tokens, not on the ban
    let response = app
        .clone()
        .oneshot(request_from("8.8.8.8"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get("X-Threat-Level").is_none());
    assert_eq!(store.calls(), 3);
}
