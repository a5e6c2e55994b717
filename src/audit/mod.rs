//! Structured audit events.
//!
//! Every decision emits exactly one event through `tracing`; the
//! subscriber installed at startup renders them as JSON lines in
//! production or colored human-readable lines in development. Emission
//! is non-fallible, so observability can never fail a request.
//!
//! Principals are already hashed/normalized by the identity layer, so no
//! raw credential ever reaches an event.

use crate::identity::Principal;
use std::fmt::Display;
use tracing::{error, info, warn};

pub fn rate_limit_allowed(client: &Principal, remaining: i64) {
    info!(
        event_type = "rate_limit_allowed",
        client_id = %client,
        action = "ALLOW",
        remaining_tokens = remaining,
        "request admitted"
    );
}

pub fn rate_limit_blocked(client: &Principal, remaining: i64, retry_after: u64) {
    warn!(
        event_type = "rate_limit_blocked",
        client_id = %client,
        action = "DENY",
        remaining_tokens = remaining,
        retry_after_seconds = retry_after,
        "request rejected"
    );
}

pub fn banned_request_blocked(client: &Principal, ban_remaining: u64) {
    warn!(
        event_type = "banned_request_blocked",
        client_id = %client,
        action = "DENY",
        remaining_tokens = 0,
        ban_remaining_seconds = ban_remaining,
        "banned principal rejected"
    );
}

/// The degradation is intentional, so this is WARN, not ERROR
pub fn rate_limit_fail_open(client: &Principal, reason: &dyn Display) {
    warn!(
        event_type = "rate_limit_fail_open",
        client_id = %client,
        action = "ALLOW",
        remaining_tokens = -1,
        reason = %reason,
        "store unavailable, admitting request"
    );
}

pub fn rate_limit_error(client: &Principal, error_detail: &dyn Display) {
    error!(
        event_type = "rate_limit_error",
        client_id = %client,
        action = "ALLOW (fail-open)",
        remaining_tokens = -1,
        error = %error_detail,
        "unexpected middleware error, admitting request"
    );
}

pub fn malicious_client_detected(client: &Principal, violations: u32, ban_seconds: u64) {
    warn!(
        event_type = "malicious_client_detected",
        client_id = %client,
        violations = violations,
        ban_seconds = ban_seconds,
        "sustained violations, principal banned"
    );
}

pub fn server_started(addr: &str) {
    info!(event_type = "server_started", addr = %addr, "shield listening");
}

pub fn redis_connected() {
    info!(event_type = "redis_connected", "store connection verified");
}

pub fn redis_error(error_detail: &dyn Display) {
    warn!(event_type = "redis_error", error = %error_detail, "store error");
}

pub fn redis_connection_closed() {
    info!(
        event_type = "redis_connection_closed",
        "store connection closed"
    );
}
