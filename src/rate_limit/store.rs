use super::lua::TOKEN_BUCKET_SCRIPT;
use super::types::{BucketParams, Verdict};
use crate::config::ShieldConfig;
use crate::error::{Result, ShieldError};
use crate::identity::Principal;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Script;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Abstract admission backend.
///
/// The production implementation talks to Redis; tests substitute scripted
/// stand-ins at this seam to exercise denial, ban escalation and fail-open
/// paths without a live store.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Execute the atomic refill-and-consume decision for one principal
    async fn check_and_consume(&self, principal: &Principal) -> Result<Verdict>;

    /// Cheap liveness probe of the backend
    async fn ping(&self) -> Result<()>;
}

/// Redis-backed token-bucket store.
///
/// The decision script is content-addressed by its SHA1: `redis::Script`
/// sends `EVALSHA` and transparently re-registers the body and retries on
/// a NOSCRIPT reply, so a store restart costs one extra round trip.
///
/// The connection is established lazily. If the store is down at startup
/// the gateway still serves traffic (fail-open); each request retries the
/// connection within its own command timeout until one succeeds.
pub struct TokenBucketStore {
    client: redis::Client,
    manager: OnceCell<ConnectionManager>,
    script: Script,
    params: BucketParams,
    command_timeout: Duration,
}

impl TokenBucketStore {
    /// Create a store client. Fails only on a malformed URL; reachability
    /// is probed lazily.
    pub fn connect(config: &ShieldConfig) -> Result<Self> {
        let client = redis::Client::open(config.store_url.as_str())
            .map_err(|e| ShieldError::Config(format!("invalid store URL: {}", e)))?;

        Ok(Self {
            client,
            manager: OnceCell::new(),
            script: Script::new(TOKEN_BUCKET_SCRIPT),
            params: BucketParams::from_config(config)?,
            command_timeout: config.store_timeout(),
        })
    }

    /// Get the shared connection manager, establishing it on first use.
    /// Reconnection after drops is handled by the manager itself, backing
    /// off up to 10 s between attempts.
    async fn manager(&self) -> Result<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new()
                    .set_factor(1_000)
                    .set_max_delay(10_000)
                    .set_number_of_retries(60)
                    .set_connection_timeout(self.command_timeout)
                    .set_response_timeout(self.command_timeout);

                let manager =
                    ConnectionManager::new_with_config(self.client.clone(), config).await?;
                debug!("store connection established");
                Ok::<_, redis::RedisError>(manager)
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "store connection failed");
                ShieldError::Store(e)
            })?;

        Ok(manager.clone())
    }

    async fn invoke(&self, principal: &Principal) -> Result<Vec<i64>> {
        let mut conn = self.manager().await?;
        let key = self.params.bucket_key(principal.as_str());

        self.script
            .key(key)
            .arg(self.params.capacity)
            .arg(self.params.refill_rate)
            .arg(self.params.cost)
            .invoke_async(&mut conn)
            .await
            .map_err(ShieldError::Store)
    }
}

#[async_trait]
impl AdmissionStore for TokenBucketStore {
    async fn check_and_consume(&self, principal: &Principal) -> Result<Verdict> {
        let reply = timeout(self.command_timeout, self.invoke(principal))
            .await
            .map_err(|_| ShieldError::StoreTimeout(self.command_timeout.as_millis() as u64))??;

        Verdict::from_script_reply(&reply)
    }

    async fn ping(&self) -> Result<()> {
        let fut = async {
            let mut conn = self.manager().await?;
            redis::cmd("PING")
                .query_async::<()>(&mut conn)
                .await
                .map_err(ShieldError::Store)
        };

        timeout(self.command_timeout, fut)
            .await
            .map_err(|_| ShieldError::StoreTimeout(self.command_timeout.as_millis() as u64))?
    }
}
