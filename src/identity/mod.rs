//! Client identification.
//!
//! Derives a stable, spoof-resistant principal for every request. Three
//! strategies are tried in order of trustworthiness:
//!
//! 1. **API key** from the `X-API-Key` header or `api_key` query parameter,
//!    hashed so raw keys never leave the process
//! 2. **Authenticated user** id placed in request extensions by an upstream
//!    auth layer
//! 3. **Client IP**, resolved according to the configured proxy-trust policy
//!
//! Identification never fails; a request with no usable source degrades to
//! the shared `ip:unknown` principal.

use crate::config::TrustProxy;
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as _;
use std::net::IpAddr;

/// Canonical identity of a traffic source, in `<kind>:<value>` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

/// The identification source a principal was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrincipalKind {
    ApiKey,
    User,
    Ip,
}

impl Principal {
    /// Principal for a presented API key. Only the first 16 hex characters
    /// of the SHA-256 digest are kept; the raw key is never stored.
    pub fn api_key(raw: &str) -> Self {
        let digest = Sha256::digest(raw.as_bytes());
        let mut hex = String::with_capacity(16);
        for byte in &digest[..8] {
            let _ = write!(hex, "{:02x}", byte);
        }
        Principal(format!("apikey:{}", hex))
    }

    /// Principal for an authenticated user id
    pub fn user(id: &str) -> Self {
        Principal(format!("user:{}", id))
    }

    /// Principal for a client address
    pub fn ip(addr: &str) -> Self {
        Principal(format!("ip:{}", addr))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> PrincipalKind {
        if self.0.starts_with("apikey:") {
            PrincipalKind::ApiKey
        } else if self.0.starts_with("user:") {
            PrincipalKind::User
        } else {
            PrincipalKind::Ip
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authenticated subject injected into request extensions by an upstream
/// auth layer
#[derive(Debug, Clone)]
pub struct AuthSubject {
    pub id: String,
}

/// The request material identification works from
pub struct RequestContext<'a> {
    pub headers: &'a HeaderMap,
    pub query: Option<&'a str>,
    pub subject: Option<&'a AuthSubject>,
    pub peer: Option<IpAddr>,
}

/// A single identification strategy in the precedence chain
pub trait IdentifyStrategy: Send + Sync {
    fn try_identify(&self, ctx: &RequestContext<'_>) -> Option<Principal>;
}

/// API key strategy: `X-API-Key` header, then `api_key` query parameter
pub struct ApiKeyStrategy;

impl IdentifyStrategy for ApiKeyStrategy {
    fn try_identify(&self, ctx: &RequestContext<'_>) -> Option<Principal> {
        let from_header = ctx
            .headers
            .get("X-API-Key")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let key = from_header.or_else(|| {
            ctx.query
                .and_then(|q| query_param(q, "api_key"))
                .filter(|v| !v.is_empty())
        })?;

        Some(Principal::api_key(key))
    }
}

/// Authenticated user strategy
pub struct UserStrategy;

impl IdentifyStrategy for UserStrategy {
    fn try_identify(&self, ctx: &RequestContext<'_>) -> Option<Principal> {
        let subject = ctx.subject?;
        if subject.id.is_empty() {
            return None;
        }
        Some(Principal::user(&subject.id))
    }
}

/// Client address strategy, honoring the proxy-trust policy.
///
/// With trust disabled, forwarded headers are never consulted; only the
/// connection peer address counts. This keeps the principal unforgeable by
/// clients sending their own `X-Forwarded-For`.
pub struct IpStrategy {
    trust: TrustProxy,
}

impl IpStrategy {
    pub fn new(trust: TrustProxy) -> Self {
        Self { trust }
    }

    fn resolve(&self, ctx: &RequestContext<'_>) -> Option<String> {
        match self.trust {
            TrustProxy::Disabled => ctx.peer.map(normalize_addr),
            TrustProxy::All | TrustProxy::Hops(_) => self
                .forwarded_client(ctx.headers)
                .or_else(|| ctx.peer.map(normalize_addr)),
        }
    }

    /// Resolve the client address from forwarded headers. Only called when
    /// proxy trust is enabled.
    fn forwarded_client(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(forwarded) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
            let hops: Vec<&str> = forwarded.split(',').map(str::trim).collect();
            if !hops.is_empty() {
                let index = match self.trust {
                    // Leftmost entry: the original client as reported by
                    // the first proxy.
                    TrustProxy::All => 0,
                    // The rightmost N entries were appended by trusted
                    // proxies; the client is just before them.
                    TrustProxy::Hops(n) => hops.len().saturating_sub(n as usize + 1),
                    TrustProxy::Disabled => return None,
                };
                if let Some(addr) = hops.get(index).and_then(|h| parse_addr(h)) {
                    return Some(addr);
                }
            }
        }

        headers
            .get("X-Real-IP")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_addr)
    }
}

impl IdentifyStrategy for IpStrategy {
    fn try_identify(&self, ctx: &RequestContext<'_>) -> Option<Principal> {
        let addr = self.resolve(ctx).unwrap_or_else(|| "unknown".to_string());
        Some(Principal::ip(&addr))
    }
}

/// Parse and normalize a textual address; None when unparseable
fn parse_addr(raw: &str) -> Option<String> {
    raw.trim().parse::<IpAddr>().ok().map(normalize_addr)
}

/// Normalize an address to text, stripping the IPv4-mapped-IPv6 prefix
fn normalize_addr(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
    }
}

/// Extract a query parameter value without allocating
fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Ordered identification chain; the first strategy that produces a
/// principal wins.
pub struct ClientIdentifier {
    strategies: Vec<Box<dyn IdentifyStrategy>>,
}

impl ClientIdentifier {
    pub fn new(trust: TrustProxy) -> Self {
        Self {
            strategies: vec![
                Box::new(ApiKeyStrategy),
                Box::new(UserStrategy),
                Box::new(IpStrategy::new(trust)),
            ],
        }
    }

    /// Derive the principal for a request. Never fails: the IP strategy at
    /// the end of the chain always produces a value.
    pub fn identify(&self, ctx: &RequestContext<'_>) -> Principal {
        self.strategies
            .iter()
            .find_map(|s| s.try_identify(ctx))
            .unwrap_or_else(|| Principal::ip("unknown"))
    }
}
