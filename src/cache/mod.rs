//! Shared low-latency cache.
//!
//! Holds the TTL-bounded abort flags that workers consult before starting a
//! row, and carries progress messages over pub/sub.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] ::redis::RedisError),
}

/// Channel on which progress for a job is published.
pub fn progress_channel(job_id: Uuid) -> String {
    format!("progress:{}", job_id)
}

/// Abort flags and pub/sub.
#[async_trait]
pub trait SharedCache: Send + Sync {
    /// Sets the abort flag for a job; it expires after `ttl`.
    async fn set_abort_flag(&self, job_id: Uuid, ttl: Duration) -> Result<(), CacheError>;

    /// Returns true while the abort flag for a job is set.
    async fn has_abort_flag(&self, job_id: Uuid) -> Result<bool, CacheError>;

    /// Publishes a message on a channel.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_channel() {
        let id = Uuid::nil();
        assert_eq!(
            progress_channel(id),
            "progress:00000000-0000-0000-0000-000000000000"
        );
    }
}
