//! Redis-backed shared cache.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::{CacheError, SharedCache};

/// Abort flags as `{prefix}:abort:{job_id}` keys with an expiry, progress
/// via `PUBLISH`.
#[derive(Clone)]
pub struct RedisCache {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisCache {
    /// Connects to Redis.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CacheError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a cache from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
        }
    }

    fn abort_key(&self, job_id: Uuid) -> String {
        format!("{}:abort:{}", self.prefix, job_id)
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    async fn set_abort_flag(&self, job_id: Uuid, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        let secs = ttl.as_secs().max(1);
        redis::cmd("SET")
            .arg(self.abort_key(job_id))
            .arg("1")
            .arg("EX")
            .arg(secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn has_abort_flag(&self, job_id: Uuid) -> Result<bool, CacheError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(self.abort_key(job_id)).await?;
        Ok(exists)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError> {
        let mut conn = self.redis.clone();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Run with: REDIS_URL=redis://localhost:6379 cargo test -- --ignored
    async fn test_abort_flag_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let cache = RedisCache::connect(&url, "rowforge-test").await.unwrap();
        let job_id = Uuid::new_v4();

        assert!(!cache.has_abort_flag(job_id).await.unwrap());
        cache
            .set_abort_flag(job_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(cache.has_abort_flag(job_id).await.unwrap());
    }
}
