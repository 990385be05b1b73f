//! In-process shared cache for tests and single-process runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use super::{CacheError, SharedCache};

/// A published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub channel: String,
    pub payload: String,
}

/// Cache holding abort flags in a map with deadlines and fanning published
/// messages out over a broadcast channel.
pub struct MemoryCache {
    flags: Mutex<HashMap<Uuid, Instant>>,
    messages: broadcast::Sender<PublishedMessage>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(1024);
        Self {
            flags: Mutex::new(HashMap::new()),
            messages,
        }
    }

    /// Subscribes to every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedMessage> {
        self.messages.subscribe()
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn set_abort_flag(&self, job_id: Uuid, ttl: Duration) -> Result<(), CacheError> {
        self.flags.lock().await.insert(job_id, Instant::now() + ttl);
        Ok(())
    }

    async fn has_abort_flag(&self, job_id: Uuid) -> Result<bool, CacheError> {
        let mut flags = self.flags.lock().await;
        match flags.get(&job_id) {
            Some(deadline) if *deadline > Instant::now() => Ok(true),
            Some(_) => {
                flags.remove(&job_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), CacheError> {
        // No subscribers is not an error.
        let _ = self.messages.send(PublishedMessage {
            channel: channel.to_string(),
            payload: message.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_abort_flag_expires() {
        let cache = MemoryCache::new();
        let job_id = Uuid::new_v4();

        assert!(!cache.has_abort_flag(job_id).await.unwrap());
        cache
            .set_abort_flag(job_id, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(cache.has_abort_flag(job_id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!cache.has_abort_flag(job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let cache = MemoryCache::new();
        let mut rx = cache.subscribe();

        cache.publish("progress:abc", "{\"n\":1}").await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "progress:abc");
        assert_eq!(msg.payload, "{\"n\":1}");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let cache = MemoryCache::new();
        assert!(cache.publish("progress:abc", "x").await.is_ok());
    }
}
