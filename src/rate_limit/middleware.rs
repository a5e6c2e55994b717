use super::store::AdmissionStore;
use super::types::{BucketParams, Verdict};
use crate::abuse::AbuseControl;
use crate::audit;
use crate::identity::{AuthSubject, ClientIdentifier, RequestContext};
use crate::metrics::{ProtectionMetrics, ScrapeGuard};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Shared state for the shield middleware and the admin endpoints
#[derive(Clone)]
pub struct ShieldState {
    pub identifier: Arc<ClientIdentifier>,
    pub store: Arc<dyn AdmissionStore>,
    pub abuse: Arc<AbuseControl>,
    pub metrics: Arc<ProtectionMetrics>,
    pub scrape_guard: Arc<ScrapeGuard>,
    pub params: BucketParams,
}

/// The admission pipeline, applied to every protected request.
///
/// Identify, short-circuit bans, then ask the store for a verdict. Any
/// store failure degrades to admission: rate limiting protects the
/// backend, it must not become an outage of its own.
pub async fn shield_middleware(
    State(state): State<ShieldState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();

    let principal = {
        let ctx = RequestContext {
            headers: request.headers(),
            query: request.uri().query(),
            subject: request.extensions().get::<AuthSubject>(),
            peer: connect_info.map(|ConnectInfo(addr)| addr.ip()),
        };
        state.identifier.identify(&ctx)
    };

    state.metrics.observe_client(&principal);

    // The ban gate runs before any store traffic: a banned principal must
    // not be able to wait out a refill tick.
    if let Some(ban_remaining) = state.abuse.check_ban(&principal) {
        state.metrics.on_banned_block();
        audit::banned_request_blocked(&principal, ban_remaining);
        state.metrics.record_latency(elapsed_ms(started));
        return banned_response(&state.params, ban_remaining);
    }

    let verdict = match state.store.check_and_consume(&principal).await {
        Ok(verdict) => verdict,
        Err(err) => {
            state.metrics.on_fail_open();
            if err.is_store_failure() {
                audit::rate_limit_fail_open(&principal, &err);
            } else {
                audit::rate_limit_error(&principal, &err);
            }
            state.metrics.on_allowed();
            state.metrics.record_latency(elapsed_ms(started));
            let response = next.run(request).await;
            // No verdict to report; assume a fresh bucket so clients are
            // not told to back off during an enforcement gap.
            return with_rate_limit_headers(
                response,
                &state.params,
                i64::from(state.params.capacity.saturating_sub(state.params.cost)),
                epoch_seconds(),
            );
        }
    };

    if verdict.allowed {
        state.metrics.on_allowed();
        audit::rate_limit_allowed(&principal, verdict.remaining);
        state.metrics.record_latency(elapsed_ms(started));
        let response = next.run(request).await;
        return with_rate_limit_headers(response, &state.params, verdict.remaining, verdict.reset);
    }

    let became_banned = state.abuse.track_violation(&principal);
    let retry_after = verdict.reset.saturating_sub(epoch_seconds()).max(1);

    if became_banned {
        let ban_seconds = state.abuse.ban_duration_secs();
        state.metrics.on_ban_escalation();
        audit::malicious_client_detected(&principal, state.abuse.threshold(), ban_seconds);
        state.metrics.record_latency(elapsed_ms(started));
        return banned_response(&state.params, ban_seconds);
    }

    state.metrics.on_standard_block();
    audit::rate_limit_blocked(&principal, verdict.remaining, retry_after);
    state.metrics.record_latency(elapsed_ms(started));
    denied_response(&state.params, &verdict, retry_after)
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn numeric_header(value: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, params: &BucketParams, remaining: i64, reset: u64) {
    headers.insert("X-RateLimit-Limit", numeric_header(params.capacity));
    headers.insert("X-RateLimit-Remaining", numeric_header(remaining.max(0)));
    headers.insert("X-RateLimit-Reset", numeric_header(reset));
}

/// Attach quota headers to a successful (or fail-open) response
pub fn with_rate_limit_headers(
    mut response: Response,
    params: &BucketParams,
    remaining: i64,
    reset: u64,
) -> Response {
    insert_rate_limit_headers(response.headers_mut(), params, remaining, reset);
    response
}

/// 429 for an exhausted bucket, with a retry hint from the store verdict
fn denied_response(params: &BucketParams, verdict: &Verdict, retry_after: u64) -> Response {
    let body = serde_json::json!({
        "error": "Too Many Requests",
        "message": format!("Rate limit exceeded. Retry in {} seconds.", retry_after),
        "banned": false,
        "retry_after_seconds": retry_after,
        "limit": params.capacity,
        "remaining": verdict.remaining.max(0),
        "reset": verdict.reset,
        "threat_detected": false,
    });

    let mut response =
        (StatusCode::TOO_MANY_REQUESTS, body.to_string()).into_response();
    let headers = response.headers_mut();
    insert_rate_limit_headers(headers, params, verdict.remaining, verdict.reset);
    headers.insert("Retry-After", numeric_header(retry_after));
    headers.insert(
        "Content-Type",
        HeaderValue::from_static("application/json"),
    );
    response
}

/// 429 for a banned principal. Reported remaining is always 0; the reset
/// and retry hints point at ban expiry, not the refill clock.
fn banned_response(params: &BucketParams, ban_remaining: u64) -> Response {
    let reset = epoch_seconds() + ban_remaining;
    let body = serde_json::json!({
        "error": "Too Many Requests",
        "message": format!(
            "Temporarily banned due to sustained rate limit violations. Retry in {} seconds.",
            ban_remaining
        ),
        "banned": true,
        "retry_after_seconds": ban_remaining,
        "limit": params.capacity,
        "remaining": 0,
        "reset": reset,
        "threat_detected": true,
    });

    let mut response =
        (StatusCode::TOO_MANY_REQUESTS, body.to_string()).into_response();
    let headers = response.headers_mut();
    insert_rate_limit_headers(headers, params, 0, reset);
    headers.insert("Retry-After", numeric_header(ban_remaining));
    headers.insert("X-Ban-Remaining", numeric_header(ban_remaining));
    headers.insert("X-Threat-Level", HeaderValue::from_static("BANNED"));
    headers.insert(
        "Content-Type",
        HeaderValue::from_static("application/json"),
    );
    response
}
