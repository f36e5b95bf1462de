//! Redis-backed mutual exclusion for units of work on [`super::MongoStore`].

use redis::aio::ConnectionManager;
use std::time::Duration;

use super::{StoreError, StoreResult};
use crate::metrics::track_cache_operation;
use crate::utils::retry::{retry_async_with_config, RetryConfig};

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

#[derive(Clone)]
pub struct RedisLock {
    redis: ConnectionManager,
    ttl: Duration,
}

impl RedisLock {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    /// Acquires `lock:{key}`, polling with backoff while another holder owns it.
    pub async fn acquire(&self, key: &str) -> StoreResult<LockGuard> {
        let key = format!("lock:{}", key);
        let token = uuid::Uuid::new_v4().to_string();
        let ttl_ms = self.ttl.as_millis() as u64;

        retry_async_with_config(RetryConfig::lock_acquisition(), "lock_acquire", || {
            let mut conn = self.redis.clone();
            let key = key.clone();
            let token = token.clone();
            async move {
                let reply: Option<String> = track_cache_operation("lock_acquire", async {
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(&token)
                        .arg("NX")
                        .arg("PX")
                        .arg(ttl_ms)
                        .query_async(&mut conn)
                        .await
                        .map_err(StoreError::from)
                })
                .await?;

                match reply {
                    Some(_) => Ok(()),
                    None => Err(StoreError::Lock(format!("{} is held", key))),
                }
            }
        })
        .await?;

        Ok(LockGuard {
            redis: self.redis.clone(),
            key,
            token,
            released: false,
        })
    }
}

/// Held lock. Release explicitly with [`LockGuard::release`]; a guard dropped
/// without it releases in the background.
pub struct LockGuard {
    redis: ConnectionManager,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> StoreResult<()> {
        self.released = true;
        release(self.redis.clone(), &self.key, &self.token).await
    }
}

async fn release(mut redis: ConnectionManager, key: &str, token: &str) -> StoreResult<()> {
    track_cache_operation("lock_release", async {
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut redis)
            .await?;
        Ok(())
    })
    .await
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let redis = self.redis.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = release(redis, &key, &token).await {
                    tracing::warn!(error = %e, "Failed to release lock {}, it will expire", key);
                }
            });
        }
    }
}
