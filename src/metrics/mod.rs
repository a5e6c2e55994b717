//! Protection metrics.
//!
//! Counters and gauges for the decision pipeline, a latency sketch over
//! the most recent middleware timings, and a plain-text exposition in the
//! Prometheus scrape format under the `atlas_` namespace.
//!
//! Two derived gauges are deliberately kept apart: `protection_rate` says
//! how much traffic is being filtered (a workload signal), while
//! `system_health_score` says how often the store actually delivered a
//! verdict (a health signal). A deployment can be perfectly healthy while
//! blocking half its traffic, or completely degraded while "cleanly"
//! admitting everything through fail-open.

use crate::identity::Principal;
use crate::rate_limit::middleware::ShieldState;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Response, StatusCode, Uri},
    response::IntoResponse,
};
use dashmap::DashSet;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Principals tracked exactly before the active-client gauge saturates
const MAX_TRACKED_CLIENTS: usize = 100_000;

/// Ordinal threat summary for human display
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    /// Classify from live bans and the protection rate (percent); the
    /// stronger signal wins.
    pub fn from_signals(banned_clients: u64, protection_rate: f64) -> Self {
        if banned_clients >= 5 || protection_rate >= 50.0 {
            ThreatLevel::Critical
        } else if banned_clients >= 2 || protection_rate >= 30.0 {
            ThreatLevel::High
        } else if banned_clients >= 1 || protection_rate >= 10.0 {
            ThreatLevel::Medium
        } else {
            ThreatLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "LOW",
            ThreatLevel::Medium => "MEDIUM",
            ThreatLevel::High => "HIGH",
            ThreatLevel::Critical => "CRITICAL",
        }
    }

    /// Numeric form for the gauge (0 = LOW .. 3 = CRITICAL)
    pub fn as_gauge(&self) -> u8 {
        match self {
            ThreatLevel::Low => 0,
            ThreatLevel::Medium => 1,
            ThreatLevel::High => 2,
            ThreatLevel::Critical => 3,
        }
    }
}

/// Circular buffer of recent middleware latencies (milliseconds)
struct LatencyRing {
    samples: Vec<f64>,
    cursor: usize,
    filled: bool,
}

impl LatencyRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity],
            cursor: 0,
            filled: false,
        }
    }

    fn record(&mut self, value_ms: f64) {
        self.samples[self.cursor] = value_ms;
        self.cursor = (self.cursor + 1) % self.samples.len();
        if self.cursor == 0 {
            self.filled = true;
        }
    }

    /// Copy of the valid prefix, for sorting outside the lock
    fn snapshot(&self) -> Vec<f64> {
        if self.filled {
            self.samples.clone()
        } else {
            self.samples[..self.cursor].to_vec()
        }
    }
}

/// Latency percentiles over the ring snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Nearest-rank percentile of a sorted sample; 0 for an empty sample
fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Point-in-time view of every counter and derived gauge
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub requests_allowed: u64,
    pub requests_blocked: u64,
    pub blocked_standard: u64,
    pub blocked_malicious: u64,
    pub threats_neutralized: u64,
    pub redis_errors: u64,
    pub fail_open_events: u64,
    pub active_clients: u64,
    pub banned_clients: u64,
    pub protection_rate: f64,
    pub system_health_score: f64,
    pub threat_level: ThreatLevel,
    pub latency: Percentiles,
}

/// Process-wide protection metrics, shared by reference with every
/// request handler.
pub struct ProtectionMetrics {
    requests_allowed: AtomicU64,
    requests_blocked: AtomicU64,
    blocked_standard: AtomicU64,
    blocked_malicious: AtomicU64,
    threats_neutralized: AtomicU64,
    redis_errors: AtomicU64,
    fail_open_events: AtomicU64,
    active_clients: DashSet<String>,
    clients_saturated: AtomicBool,
    latency: Mutex<LatencyRing>,
}

impl ProtectionMetrics {
    pub fn new(latency_history_size: usize) -> Self {
        Self {
            requests_allowed: AtomicU64::new(0),
            requests_blocked: AtomicU64::new(0),
            blocked_standard: AtomicU64::new(0),
            blocked_malicious: AtomicU64::new(0),
            threats_neutralized: AtomicU64::new(0),
            redis_errors: AtomicU64::new(0),
            fail_open_events: AtomicU64::new(0),
            active_clients: DashSet::new(),
            clients_saturated: AtomicBool::new(false),
            latency: Mutex::new(LatencyRing::new(latency_history_size)),
        }
    }

    /// Track a principal in the active-client set. Cardinality is capped;
    /// past the cap the gauge saturates rather than growing without bound.
    pub fn observe_client(&self, principal: &Principal) {
        if self.active_clients.contains(principal.as_str()) {
            return;
        }
        if self.active_clients.len() < MAX_TRACKED_CLIENTS {
            self.active_clients.insert(principal.as_str().to_string());
        } else if !self.clients_saturated.swap(true, Ordering::Relaxed) {
            warn!(
                cap = MAX_TRACKED_CLIENTS,
                "active-client set saturated, gauge is now a lower bound"
            );
        }
    }

    pub fn on_allowed(&self) {
        self.requests_allowed.fetch_add(1, Ordering::Relaxed);
    }

    /// An ordinary token-exhaustion denial
    pub fn on_standard_block(&self) {
        self.requests_blocked.fetch_add(1, Ordering::Relaxed);
        self.blocked_standard.fetch_add(1, Ordering::Relaxed);
    }

    /// A denial of an already-banned principal
    pub fn on_banned_block(&self) {
        self.requests_blocked.fetch_add(1, Ordering::Relaxed);
        self.blocked_malicious.fetch_add(1, Ordering::Relaxed);
    }

    /// The denial that crossed the violation threshold and installed a ban
    pub fn on_ban_escalation(&self) {
        self.requests_blocked.fetch_add(1, Ordering::Relaxed);
        self.blocked_malicious.fetch_add(1, Ordering::Relaxed);
        self.threats_neutralized.fetch_add(1, Ordering::Relaxed);
    }

    /// A store failure that degraded the decision to fail-open
    pub fn on_fail_open(&self) {
        self.redis_errors.fetch_add(1, Ordering::Relaxed);
        self.fail_open_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, value_ms: f64) {
        // Observability must never fail a request; a poisoned lock just
        // drops the sample.
        if let Ok(mut ring) = self.latency.lock() {
            ring.record(value_ms);
        }
    }

    pub fn percentiles(&self) -> Percentiles {
        let mut samples = match self.latency.lock() {
            Ok(ring) => ring.snapshot(),
            Err(_) => return Percentiles::default(),
        };
        samples.sort_by(|a, b| a.total_cmp(b));

        Percentiles {
            p50: percentile(&samples, 0.50),
            p95: percentile(&samples, 0.95),
            p99: percentile(&samples, 0.99),
        }
    }

    /// Snapshot every counter and compute the derived gauges.
    /// `banned_clients` comes from the ban index, which owns that state.
    pub fn snapshot(&self, banned_clients: u64) -> MetricsSnapshot {
        let requests_allowed = self.requests_allowed.load(Ordering::Relaxed);
        let requests_blocked = self.requests_blocked.load(Ordering::Relaxed);
        let redis_errors = self.redis_errors.load(Ordering::Relaxed);
        let fail_open_events = self.fail_open_events.load(Ordering::Relaxed);

        let total = requests_allowed + requests_blocked;
        let protection_rate = if total == 0 {
            0.0
        } else {
            requests_blocked as f64 * 100.0 / total as f64
        };
        let system_health_score = if total == 0 {
            100.0
        } else {
            (100.0 - (redis_errors + fail_open_events) as f64 * 100.0 / total as f64).max(0.0)
        };

        MetricsSnapshot {
            requests_allowed,
            requests_blocked,
            blocked_standard: self.blocked_standard.load(Ordering::Relaxed),
            blocked_malicious: self.blocked_malicious.load(Ordering::Relaxed),
            threats_neutralized: self.threats_neutralized.load(Ordering::Relaxed),
            redis_errors,
            fail_open_events,
            active_clients: self.active_clients.len() as u64,
            banned_clients,
            protection_rate,
            system_health_score,
            threat_level: ThreatLevel::from_signals(banned_clients, protection_rate),
            latency: self.percentiles(),
        }
    }
}

impl MetricsSnapshot {
    /// Render the snapshot in the Prometheus text exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(2048);

        let counters: [(&str, &str, u64); 7] = [
            (
                "atlas_requests_allowed_total",
                "Requests admitted by the rate limiter",
                self.requests_allowed,
            ),
            (
                "atlas_requests_blocked_total",
                "Requests rejected by the rate limiter",
                self.requests_blocked,
            ),
            (
                "atlas_blocked_standard_total",
                "Rejections from ordinary quota exhaustion",
                self.blocked_standard,
            ),
            (
                "atlas_blocked_malicious_total",
                "Rejections attributed to abusive clients",
                self.blocked_malicious,
            ),
            (
                "atlas_threats_neutralized_total",
                "Clients escalated to a temporary ban",
                self.threats_neutralized,
            ),
            (
                "atlas_redis_errors_total",
                "Store errors observed during decisions",
                self.redis_errors,
            ),
            (
                "atlas_fail_open_events_total",
                "Requests admitted because the store was unavailable",
                self.fail_open_events,
            ),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        let gauges: [(&str, &str, f64); 5] = [
            (
                "atlas_active_clients",
                "Distinct principals seen since startup",
                self.active_clients as f64,
            ),
            (
                "atlas_banned_clients",
                "Principals currently banned",
                self.banned_clients as f64,
            ),
            (
                "atlas_system_health_score",
                "Share of decisions that reached a store verdict (0-100)",
                self.system_health_score,
            ),
            (
                "atlas_protection_rate",
                "Share of decided requests that were denied (0-100)",
                self.protection_rate,
            ),
            (
                "atlas_threat_level",
                "Threat level (0=LOW 1=MEDIUM 2=HIGH 3=CRITICAL)",
                f64::from(self.threat_level.as_gauge()),
            ),
        ];

        for (name, help, value) in gauges {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} gauge", name);
            let _ = writeln!(out, "{} {}", name, value);
        }

        let _ = writeln!(
            out,
            "# HELP atlas_response_time_ms Middleware decision latency in milliseconds"
        );
        let _ = writeln!(out, "# TYPE atlas_response_time_ms summary");
        let _ = writeln!(
            out,
            "atlas_response_time_ms{{quantile=\"0.5\"}} {}",
            self.latency.p50
        );
        let _ = writeln!(
            out,
            "atlas_response_time_ms{{quantile=\"0.95\"}} {}",
            self.latency.p95
        );
        let _ = writeln!(
            out,
            "atlas_response_time_ms{{quantile=\"0.99\"}} {}",
            self.latency.p99
        );

        out
    }
}

/// Per-principal rate limit on the scrape endpoint: 50 requests per 10 s.
/// Keeps metric enumeration from becoming its own denial-of-service
/// vector, without a store round trip.
pub struct ScrapeGuard {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl ScrapeGuard {
    pub fn new() -> Self {
        let quota = Quota::with_period(Duration::from_millis(200))
            .unwrap()
            .allow_burst(NonZeroU32::new(50).unwrap());

        Self {
            limiter: RateLimiter::keyed(quota),
        }
    }

    pub fn check(&self, principal: &Principal) -> bool {
        self.limiter
            .check_key(&principal.as_str().to_string())
            .is_ok()
    }
}

impl Default for ScrapeGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(
    State(state): State<ShieldState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    uri: Uri,
    headers: HeaderMap,
) -> impl IntoResponse {
    let ctx = crate::identity::RequestContext {
        headers: &headers,
        query: uri.query(),
        subject: None,
        peer: connect_info.map(|ConnectInfo(addr)| addr.ip()),
    };
    let principal = state.identifier.identify(&ctx);

    if !state.scrape_guard.check(&principal) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "metrics scrape rate limit exceeded\n",
        )
            .into_response();
    }

    let snapshot = state.metrics.snapshot(state.abuse.banned_clients());
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(snapshot.to_prometheus()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
