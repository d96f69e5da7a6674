//! Process-local fabric for tests and single-host swarms.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::{Fabric, Subscription};

/// Buffered messages per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 256;

struct StoredValue {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-memory key-value + pub/sub fabric.
///
/// Expiry is lazy: expired keys are dropped when touched. Channels are
/// created on first use from either side, so subscribing before the
/// first publish (or the reverse) both work.
#[derive(Default)]
pub struct MemoryFabric {
    values: DashMap<String, StoredValue>,
    hashes: DashMap<String, HashMap<String, Value>>,
    channels: DashMap<String, broadcast::Sender<Value>>,
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Fabric for MemoryFabric {
    async fn set_value(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.values.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        if let Some(entry) = self.values.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.values.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn delete_value(&self, key: &str) -> Result<bool> {
        Ok(self.values.remove(key).is_some())
    }

    async fn hash_set(&self, key: &str, field: &str, value: Value) -> Result<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Value>> {
        Ok(self.hashes.get(key).map(|h| h.clone()).unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        Ok(self
            .hashes
            .get_mut(key)
            .map(|mut h| h.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn publish(&self, channel: &str, payload: Value) -> Result<usize> {
        let sender = self.sender(channel);
        let delivered = sender.send(payload).unwrap_or(0);
        trace!(channel, delivered, "published");
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        Ok(Subscription::new(channel, self.sender(channel).subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn values_expire_lazily() {
        let fabric = MemoryFabric::new();
        fabric
            .set_value("k", json!(1), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(fabric.get_value("k").await.unwrap(), Some(json!(1)));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(fabric.get_value("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_fields_are_independent() {
        let fabric = MemoryFabric::new();
        fabric.hash_set("h", "a", json!("alpha")).await.unwrap();
        fabric.hash_set("h", "b", json!("beta")).await.unwrap();
        assert_eq!(fabric.hash_get("h", "a").await.unwrap(), Some(json!("alpha")));
        assert!(fabric.hash_delete("h", "a").await.unwrap());
        assert!(!fabric.hash_delete("h", "a").await.unwrap());
        let all = fabric.hash_get_all("h").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["b"], json!("beta"));
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let fabric = MemoryFabric::new();
        let mut first = fabric.subscribe("c").await.unwrap();
        let mut second = fabric.subscribe("c").await.unwrap();
        let delivered = fabric.publish("c", json!({"n": 1})).await.unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(first.next().await.unwrap(), json!({"n": 1}));
        assert_eq!(second.next().await.unwrap(), json!({"n": 1}));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let fabric = MemoryFabric::new();
        assert_eq!(fabric.publish("nobody", json!(0)).await.unwrap(), 0);
    }
}
