//! # Chorus Fabric
//!
//! The shared key-value + pub/sub medium every coordinator speaks over,
//! expressed as a port. The core only ever sees this trait; transports
//! and server-backed stores live behind it and are out of scope here.
//!
//! The crate ships [`MemoryFabric`], a process-local implementation used
//! by tests and single-host swarms. Each `subscribe` call returns its own
//! receiver, so pub/sub consumption never head-of-line-blocks key-value
//! traffic.

pub mod keys;
pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

pub use keys::{Keyspace, DASHBOARD_COMMANDS, PATTERN_CHANNEL, PATTERN_STORE};
pub use memory::MemoryFabric;

/// A live subscription to one channel.
///
/// Dropping the subscription unsubscribes. A slow consumer that lags the
/// channel buffer loses the overwritten messages and keeps going; the
/// protocol above is at-most-once, so lost messages are equivalent to
/// drops in transit.
pub struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<Value>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, receiver: broadcast::Receiver<Value>) -> Self {
        Self { channel: channel.into(), receiver }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<Value> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "subscription lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// The fabric port: plain keys with optional TTL, hashes, and pub/sub
/// channels. All values are JSON.
#[async_trait]
pub trait Fabric: Send + Sync {
    async fn set_value(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;
    async fn get_value(&self, key: &str) -> Result<Option<Value>>;
    async fn delete_value(&self, key: &str) -> Result<bool>;

    async fn hash_set(&self, key: &str, field: &str, value: Value) -> Result<()>;
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>>;
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Value>>;
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    /// Publish to a channel; returns the number of live subscribers.
    async fn publish(&self, channel: &str, payload: Value) -> Result<usize>;

    /// Open a dedicated receiver on a channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}
