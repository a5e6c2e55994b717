//! Abuse mitigation: violation tracking and temporary bans.
//!
//! Denials are counted per principal in a sliding window; principals that
//! keep hammering a depleted bucket get banned outright. Banned principals
//! are rejected before the shared store is ever consulted, so a ban cannot
//! be waited out one refill tick at a time.
//!
//! Ban and violation state is process-local: a ban on one replica does not
//! propagate to its peers.

use crate::identity::Principal;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::interval;
use tracing::{debug, info};

/// How often the background sweep evicts expired records
const SWEEP_INTERVAL: Duration = Duration::from_secs(120);

/// Denial history for one principal
#[derive(Debug, Clone, Copy)]
struct ViolationRecord {
    count: u32,
    first_violation_ms: u64,
}

/// Process-wide ban index and violation tracker.
///
/// All mutation goes through this type; request handlers share it by
/// `Arc`. Entries are guarded per principal by the map shards, which is
/// the granularity the write-heavy attack path needs.
pub struct AbuseControl {
    violations: DashMap<Principal, ViolationRecord>,
    bans: DashMap<Principal, u64>,
    threshold: u32,
    window_ms: u64,
    ban_duration_ms: u64,
}

impl AbuseControl {
    pub fn new(threshold: u32, window_ms: u64, ban_duration_ms: u64) -> Self {
        Self {
            violations: DashMap::new(),
            bans: DashMap::new(),
            threshold,
            window_ms,
            ban_duration_ms,
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Check whether a principal is currently banned, returning the whole
    /// seconds left on the ban. Expired bans (and their violation history)
    /// are evicted lazily here, so a request arriving exactly at expiry is
    /// admitted.
    pub fn check_ban(&self, principal: &Principal) -> Option<u64> {
        let expires_at_ms = *self.bans.get(principal)?;
        let now = Self::now_ms();

        if now >= expires_at_ms {
            self.bans.remove(principal);
            self.violations.remove(principal);
            debug!(client_id = %principal, "ban expired, evicted");
            return None;
        }

        Some((expires_at_ms - now).div_ceil(1000))
    }

    /// Record a denial for a principal. Returns true when this violation
    /// crossed the threshold and installed a ban.
    pub fn track_violation(&self, principal: &Principal) -> bool {
        let now = Self::now_ms();

        let count = {
            let mut record =
                self.violations
                    .entry(principal.clone())
                    .or_insert(ViolationRecord {
                        count: 0,
                        first_violation_ms: now,
                    });

            if now.saturating_sub(record.first_violation_ms) >= self.window_ms {
                // Window elapsed: this denial opens a fresh one
                record.count = 1;
                record.first_violation_ms = now;
            } else {
                record.count += 1;
            }
            record.count
        };

        if count >= self.threshold {
            self.bans
                .insert(principal.clone(), now + self.ban_duration_ms);
            info!(
                client_id = %principal,
                violations = count,
                ban_duration_ms = self.ban_duration_ms,
                "violation threshold crossed, ban installed"
            );
            return true;
        }

        false
    }

    /// Number of live bans
    pub fn banned_clients(&self) -> u64 {
        let now = Self::now_ms();
        self.bans.iter().filter(|e| *e.value() > now).count() as u64
    }

    /// Seconds a fresh ban lasts, for response hints
    pub fn ban_duration_secs(&self) -> u64 {
        self.ban_duration_ms.div_ceil(1000)
    }

    /// Denials within the window that trigger a ban
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Drop expired bans and violation records that aged out of twice the
    /// window. The same per-entry locking as the foreground writers
    /// applies.
    pub fn sweep(&self) {
        let now = Self::now_ms();
        self.bans.retain(|_, expires_at_ms| *expires_at_ms > now);
        self.violations
            .retain(|_, record| now.saturating_sub(record.first_violation_ms) < 2 * self.window_ms);
    }

    /// Spawn the periodic background sweep
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                control.sweep();
            }
        })
    }

    #[cfg(test)]
    fn violation_count(&self, principal: &Principal) -> Option<u32> {
        self.violations.get(principal).map(|r| r.count)
    }
}
