//! Distributed token-bucket rate limiting.
//!
//! The refill-and-consume decision executes atomically inside the shared
//! store (one Lua round trip per request), so any number of stateless
//! replicas share one quota per principal. Refill is lazy, computed from
//! the store's own clock, and bucket TTLs adapt to how warm a principal
//! is.
//!
//! The middleware composes the full pipeline: identification, the ban
//! gate, the store verdict with fail-open degradation, violation
//! escalation, and response shaping.

pub mod lua;
pub mod middleware;
pub mod store;
pub mod types;

pub use middleware::{shield_middleware, with_rate_limit_headers, ShieldState};
pub use store::{AdmissionStore, TokenBucketStore};
pub use types::{BucketParams, Verdict};
