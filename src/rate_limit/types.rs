use crate::config::ShieldConfig;
use crate::error::{Result, ShieldError};
use serde::{Deserialize, Serialize};

/// Token-bucket parameters, validated at construction so per-request code
/// never sees a degenerate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketParams {
    /// Maximum tokens a bucket can hold
    pub capacity: u32,
    /// Tokens refilled per second
    pub refill_rate: u32,
    /// Tokens consumed per request
    pub cost: u32,
    /// Store key prefix (`shield:` by default)
    pub key_prefix: String,
}

impl BucketParams {
    pub fn new(capacity: u32, refill_rate: u32, cost: u32, key_prefix: String) -> Result<Self> {
        if capacity == 0 || refill_rate == 0 || cost == 0 {
            return Err(ShieldError::Config(
                "capacity, refill_rate and cost must all be > 0".to_string(),
            ));
        }
        if capacity < cost {
            return Err(ShieldError::Config(format!(
                "capacity ({}) must be >= cost ({})",
                capacity, cost
            )));
        }

        Ok(Self {
            capacity,
            refill_rate,
            cost,
            key_prefix,
        })
    }

    pub fn from_config(config: &ShieldConfig) -> Result<Self> {
        Self::new(
            config.capacity,
            config.refill_rate,
            config.cost,
            config.key_prefix.clone(),
        )
    }

    /// The store key for a principal's bucket
    pub fn bucket_key(&self, principal: &str) -> String {
        format!("{}{}", self.key_prefix, principal)
    }
}

/// Outcome of one atomic refill-and-consume round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Whole tokens left in the bucket after the decision
    pub remaining: i64,
    /// Epoch seconds at which the next token becomes available
    pub reset: u64,
}

impl Verdict {
    /// Build a verdict from the script's `[allowed, remaining, reset]` reply
    pub fn from_script_reply(values: &[i64]) -> Result<Self> {
        if values.len() != 3 {
            return Err(ShieldError::Script(format!(
                "expected 3 reply values, got {}",
                values.len()
            )));
        }

        Ok(Self {
            allowed: values[0] == 1,
            remaining: values[1].max(0),
            reset: values[2].max(0) as u64,
        })
    }
}
