use crate::error::{Result, ShieldError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main shield configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShieldConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Maximum tokens a bucket can hold
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Tokens refilled per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: u32,
    /// Tokens consumed per request
    #[serde(default = "default_cost")]
    pub cost: u32,
    /// Prefix for bucket keys in the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Store connection URL (redis:// or rediss:// for TLS)
    pub store_url: String,
    /// Per-command store timeout in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Proxy trust policy for client address resolution
    #[serde(default)]
    pub trust_proxy: TrustProxy,
    /// Denials within the violation window before a ban
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,
    /// Sliding window for violation counting, in milliseconds
    #[serde(default = "default_violation_window_ms")]
    pub violation_window_ms: u64,
    /// Ban duration in milliseconds
    #[serde(default = "default_ban_duration_ms")]
    pub ban_duration_ms: u64,
    /// Number of latency samples kept for percentile reporting
    #[serde(default = "default_latency_history_size")]
    pub latency_history_size: usize,
    /// Deployment environment (controls log formatting)
    #[serde(default)]
    pub environment: Environment,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Proxy trust policy.
///
/// Controls whether forwarded-for headers are honored when resolving the
/// client address. With `Disabled`, headers are ignored entirely and the
/// direct peer address is used, so clients cannot spoof their identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustProxy {
    /// Ignore forwarded headers, use the connection peer address
    #[default]
    Disabled,
    /// Trust N proxy hops in front of the server
    Hops(u32),
    /// Trust any forwarded header value
    All,
}

impl FromStr for TrustProxy {
    type Err = ShieldError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "false" => Ok(TrustProxy::Disabled),
            "true" => Ok(TrustProxy::All),
            other => match other.parse::<u32>() {
                Ok(n) if n > 0 => Ok(TrustProxy::Hops(n)),
                _ => Err(ShieldError::Config(format!(
                    "trust_proxy must be 'true', 'false' or a positive integer, got '{}'",
                    s
                ))),
            },
        }
    }
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = ShieldError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            other => Err(ShieldError::Config(format!(
                "environment must be 'development' or 'production', got '{}'",
                other
            ))),
        }
    }
}

fn default_capacity() -> u32 {
    100
}

fn default_refill_rate() -> u32 {
    1
}

fn default_cost() -> u32 {
    1
}

fn default_key_prefix() -> String {
    "shield:".to_string()
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_ban_threshold() -> u32 {
    10
}

fn default_violation_window_ms() -> u64 {
    60_000
}

fn default_ban_duration_ms() -> u64 {
    600_000
}

fn default_latency_history_size() -> usize {
    1000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ShieldConfig {
    /// Load configuration from environment variables.
    ///
    /// `REDIS_URL` is required; every other option falls back to its
    /// documented default. Malformed values are configuration errors, not
    /// silent fallbacks.
    pub fn from_env() -> Result<Self> {
        let store_url = std::env::var("REDIS_URL")
            .map_err(|_| ShieldError::Config("REDIS_URL must be set".to_string()))?;

        let config = Self {
            server: ServerConfig {
                host: env_or("SHIELD_HOST", default_host())?,
                port: env_or("SHIELD_PORT", default_port())?,
            },
            capacity: env_or("SHIELD_CAPACITY", default_capacity())?,
            refill_rate: env_or("SHIELD_REFILL_RATE", default_refill_rate())?,
            cost: env_or("SHIELD_COST", default_cost())?,
            key_prefix: env_or("SHIELD_KEY_PREFIX", default_key_prefix())?,
            store_url,
            store_timeout_ms: env_or("SHIELD_STORE_TIMEOUT_MS", default_store_timeout_ms())?,
            trust_proxy: env_or("SHIELD_TRUST_PROXY", TrustProxy::Disabled)?,
            ban_threshold: env_or("SHIELD_BAN_THRESHOLD", default_ban_threshold())?,
            violation_window_ms: env_or(
                "SHIELD_VIOLATION_WINDOW_MS",
                default_violation_window_ms(),
            )?,
            ban_duration_ms: env_or("SHIELD_BAN_DURATION_MS", default_ban_duration_ms())?,
            latency_history_size: env_or(
                "SHIELD_LATENCY_HISTORY_SIZE",
                default_latency_history_size(),
            )?,
            environment: env_or("SHIELD_ENVIRONMENT", Environment::Development)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration. All violations here are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.store_url.is_empty() {
            return Err(ShieldError::Config("store_url cannot be empty".to_string()));
        }
        if self.capacity == 0 {
            return Err(ShieldError::Config("capacity must be > 0".to_string()));
        }
        if self.refill_rate == 0 {
            return Err(ShieldError::Config("refill_rate must be > 0".to_string()));
        }
        if self.cost == 0 {
            return Err(ShieldError::Config("cost must be > 0".to_string()));
        }
        if self.capacity < self.cost {
            return Err(ShieldError::Config(format!(
                "capacity ({}) must be >= cost ({})",
                self.capacity, self.cost
            )));
        }
        if self.store_timeout_ms == 0 {
            return Err(ShieldError::Config(
                "store_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.ban_threshold == 0 {
            return Err(ShieldError::Config("ban_threshold must be > 0".to_string()));
        }
        if self.violation_window_ms == 0 {
            return Err(ShieldError::Config(
                "violation_window_ms must be > 0".to_string(),
            ));
        }
        if self.ban_duration_ms == 0 {
            return Err(ShieldError::Config(
                "ban_duration_ms must be > 0".to_string(),
            ));
        }
        if self.latency_history_size == 0 {
            return Err(ShieldError::Config(
                "latency_history_size must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Store command timeout as a Duration
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Create a default configuration for testing
    pub fn for_testing(store_url: &str) -> Self {
        Self {
            server: ServerConfig::default(),
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            cost: default_cost(),
            key_prefix: default_key_prefix(),
            store_url: store_url.to_string(),
            store_timeout_ms: default_store_timeout_ms(),
            trust_proxy: TrustProxy::Disabled,
            ban_threshold: default_ban_threshold(),
            violation_window_ms: default_violation_window_ms(),
            ban_duration_ms: default_ban_duration_ms(),
            latency_history_size: default_latency_history_size(),
            environment: Environment::Development,
        }
    }
}

/// Read an environment variable, parsing it into `T`, or fall back to
/// `default` when unset. Set-but-unparsable is an error.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ShieldError::Config(format!("invalid {}: {}", name, e))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_proxy_parsing() {
        assert_eq!("false".parse::<TrustProxy>().unwrap(), TrustProxy::Disabled);
        assert_eq!("true".parse::<TrustProxy>().unwrap(), TrustProxy::All);
        assert_eq!("2".parse::<TrustProxy>().unwrap(), TrustProxy::Hops(2));
    }

    #[test]
    fn test_trust_proxy_rejects_invalid_values() {
        assert!("0".parse::<TrustProxy>().is_err());
        assert!("-1".parse::<TrustProxy>().is_err());
        assert!("yes".parse::<TrustProxy>().is_err());
        assert!("".parse::<TrustProxy>().is_err());
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!(
            "production".parse::<Environment>().unwrap(),
            Environment::Production
        );
        assert_eq!(
            "Development".parse::<Environment>().unwrap(),
            Environment::Development
        );
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = ShieldConfig::for_testing("redis://127.0.0.1:6379");
        config.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_capacity_below_cost() {
        let mut config = ShieldConfig::for_testing("redis://127.0.0.1:6379");
        config.capacity = 2;
        config.cost = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_refill() {
        let mut config = ShieldConfig::for_testing("redis://127.0.0.1:6379");
        config.refill_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ShieldConfig::for_testing("redis://127.0.0.1:6379");
        assert!(config.validate().is_ok());
        assert_eq!(config.capacity, 100);
        assert_eq!(config.refill_rate, 1);
        assert_eq!(config.cost, 1);
        assert_eq!(config.key_prefix, "shield:");
        assert_eq!(config.store_timeout_ms, 2000);
        assert_eq!(config.ban_threshold, 10);
        assert_eq!(config.violation_window_ms, 60_000);
        assert_eq!(config.ban_duration_ms, 600_000);
        assert_eq!(config.latency_history_size, 1000);
    }
}
