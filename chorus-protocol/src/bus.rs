//! Message bus: channel wiring, deduplication, and handler dispatch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use chorus_cache::{CacheConfig, TtlCache};
use chorus_core::{now_ms, NodeId, Priority};
use chorus_fabric::{Fabric, Keyspace};

use crate::{Message, MessagePayload, MessageType};

/// Handler registered for one message type. Handlers run on the worker
/// pool; a failing handler never affects its siblings.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self.0)(message).await
    }
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// TTL stamped on outgoing messages without an explicit override.
    pub default_ttl: Duration,
    /// Upper bound for any outgoing TTL; also sizes the dedup horizon
    /// (five times this value).
    pub max_ttl: Duration,
    /// Concurrent handler invocations across all message types.
    pub worker_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(60),
            worker_limit: 8,
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BusStats {
    pub sent: u64,
    pub received: u64,
    pub dropped_stale: u64,
    pub deduplicated: u64,
    pub handler_failures: u64,
    pub decode_failures: u64,
}

struct Dispatcher {
    node_id: String,
    handlers: DashMap<MessageType, Vec<Arc<dyn MessageHandler>>>,
    dedup: TtlCache<String, ()>,
    workers: Arc<Semaphore>,
    received: AtomicU64,
    dropped_stale: AtomicU64,
    deduplicated: AtomicU64,
    handler_failures: Arc<AtomicU64>,
    decode_failures: AtomicU64,
}

impl Dispatcher {
    async fn dispatch(&self, raw: Value) {
        self.received.fetch_add(1, Ordering::Relaxed);

        let message = match Message::decode_value(raw) {
            Ok(message) => message,
            Err(error) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(%error, "dropping undecodable message");
                return;
            }
        };

        // Own broadcasts come back on the shared channel; skip them.
        if message.source.id == self.node_id {
            return;
        }

        // Stale messages are dropped silently per the delivery contract.
        if message.is_stale(now_ms()) {
            self.dropped_stale.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // At-most-once: a message id seen inside the horizon is a duplicate.
        if self.dedup.get(&message.id).is_some() {
            self.deduplicated.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.dedup.set(message.id.clone(), ());

        let handlers = self
            .handlers
            .get(&message.kind)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        if handlers.is_empty() {
            trace!(kind = ?message.kind, "no handler registered");
            return;
        }

        for handler in handlers {
            let Ok(permit) = Arc::clone(&self.workers).acquire_owned().await else {
                return;
            };
            let failures = Arc::clone(&self.handler_failures);
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(error) = handler.handle(message).await {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%error, "message handler failed");
                }
                drop(permit);
            });
        }
    }
}

/// The unified message bus for one coordinator.
///
/// Owns the broadcast and inbox subscriptions, the dedup cache, and the
/// handler registry. Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct MessageBus {
    node: NodeId,
    keys: Keyspace,
    fabric: Arc<dyn Fabric>,
    config: BusConfig,
    dispatcher: Arc<Dispatcher>,
    sent: Arc<AtomicU64>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MessageBus {
    pub fn new(node: NodeId, fabric: Arc<dyn Fabric>, keys: Keyspace, config: BusConfig) -> Self {
        let dedup = TtlCache::new(CacheConfig {
            default_ttl: config.max_ttl * 5,
            max_size: 100_000,
            cleanup_interval: None,
        });
        let dispatcher = Arc::new(Dispatcher {
            node_id: node.id.clone(),
            handlers: DashMap::new(),
            dedup,
            workers: Arc::new(Semaphore::new(config.worker_limit.max(1))),
            received: AtomicU64::new(0),
            dropped_stale: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            handler_failures: Arc::new(AtomicU64::new(0)),
            decode_failures: AtomicU64::new(0),
        });
        Self {
            node,
            keys,
            fabric,
            config,
            dispatcher,
            sent: Arc::new(AtomicU64::new(0)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Register a handler for one message type. Multiple handlers per
    /// type are allowed and run independently.
    pub fn register(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) {
        self.dispatcher.handlers.entry(kind).or_default().push(handler);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&self, kind: MessageType, handler: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.register(kind, Arc::new(FnHandler(handler)));
    }

    /// Subscribe the broadcast channel and this node's inbox, then start
    /// the receive loops. Idempotent per channel set.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        drop(tasks);

        self.dispatcher.dedup.start();

        let channels = [self.keys.broadcast(), self.keys.inbox(&self.node.id)];
        let mut spawned = Vec::new();
        for channel in channels {
            let mut subscription = self.fabric.subscribe(&channel).await?;
            let dispatcher = Arc::clone(&self.dispatcher);
            spawned.push(tokio::spawn(async move {
                while let Some(raw) = subscription.next().await {
                    dispatcher.dispatch(raw).await;
                }
            }));
        }

        self.tasks.lock().extend(spawned);
        debug!(node = %self.node.id, "message bus started");
        Ok(())
    }

    /// Stop receive loops and drop the dedup cache contents.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.dispatcher.dedup.close();
        debug!(node = %self.node.id, "message bus stopped");
    }

    /// Publish to the swarm-wide channel.
    pub async fn broadcast(&self, payload: MessagePayload, priority: Priority) -> Result<String> {
        let message = Message::broadcast(
            self.node.clone(),
            payload,
            priority,
            self.clamped_ttl_ms(None),
        );
        self.publish(self.keys.broadcast(), message).await
    }

    /// Publish to one peer's private inbox.
    pub async fn send(
        &self,
        target: &str,
        payload: MessagePayload,
        priority: Priority,
    ) -> Result<String> {
        let message = Message::to_target(
            self.node.clone(),
            target,
            payload,
            priority,
            self.clamped_ttl_ms(None),
        );
        self.publish(self.keys.inbox(target), message).await
    }

    /// Targeted send with an explicit TTL (clamped to the bus maximum).
    pub async fn send_with_ttl(
        &self,
        target: &str,
        payload: MessagePayload,
        priority: Priority,
        ttl: Duration,
    ) -> Result<String> {
        let message = Message::to_target(
            self.node.clone(),
            target,
            payload,
            priority,
            self.clamped_ttl_ms(Some(ttl)),
        );
        self.publish(self.keys.inbox(target), message).await
    }

    pub fn stats(&self) -> BusStats {
        let d = &self.dispatcher;
        BusStats {
            sent: self.sent.load(Ordering::Relaxed),
            received: d.received.load(Ordering::Relaxed),
            dropped_stale: d.dropped_stale.load(Ordering::Relaxed),
            deduplicated: d.deduplicated.load(Ordering::Relaxed),
            handler_failures: d.handler_failures.load(Ordering::Relaxed),
            decode_failures: d.decode_failures.load(Ordering::Relaxed),
        }
    }

    async fn publish(&self, channel: String, message: Message) -> Result<String> {
        let value = message.encode_value()?;
        self.fabric.publish(&channel, value).await?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        trace!(channel = %channel, id = %message.id, kind = ?message.kind, "message published");
        Ok(message.id)
    }

    fn clamped_ttl_ms(&self, ttl: Option<Duration>) -> u64 {
        ttl.unwrap_or(self.config.default_ttl)
            .min(self.config.max_ttl)
            .as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_fabric::MemoryFabric;
    use std::sync::atomic::AtomicUsize;

    fn bus(fabric: &Arc<MemoryFabric>, id: &str) -> MessageBus {
        MessageBus::new(
            NodeId::with_id(id, id),
            Arc::clone(fabric) as Arc<dyn Fabric>,
            Keyspace::new("swarm"),
            BusConfig::default(),
        )
    }

    fn lost_payload(node: &str) -> MessagePayload {
        MessagePayload::NodeLost(crate::NodeLostPayload {
            node_id: node.to_string(),
            last_seen: now_ms(),
            reason: "test".to_string(),
        })
    }

    #[tokio::test]
    async fn broadcast_reaches_other_nodes_not_self() {
        let fabric = Arc::new(MemoryFabric::new());
        let sender = bus(&fabric, "n1");
        let receiver = bus(&fabric, "n2");

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        receiver.register_fn(MessageType::SwarmNodeLost, move |_m| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let own_hits = Arc::new(AtomicUsize::new(0));
        let own_counter = Arc::clone(&own_hits);
        sender.register_fn(MessageType::SwarmNodeLost, move |_m| {
            let counter = Arc::clone(&own_counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        sender.start().await.unwrap();
        receiver.start().await.unwrap();
        sender.broadcast(lost_payload("n9"), Priority::Normal).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(own_hits.load(Ordering::SeqCst), 0);
        sender.stop();
        receiver.stop();
    }

    #[tokio::test]
    async fn targeted_send_lands_in_one_inbox() {
        let fabric = Arc::new(MemoryFabric::new());
        let sender = bus(&fabric, "n1");
        let target = bus(&fabric, "n2");
        let bystander = bus(&fabric, "n3");

        let hits = Arc::new(AtomicUsize::new(0));
        for (peer, expect) in [(&target, true), (&bystander, false)] {
            let counter = Arc::clone(&hits);
            peer.register_fn(MessageType::SwarmNodeLost, move |_m| {
                let counter = Arc::clone(&counter);
                let _ = expect;
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            peer.start().await.unwrap();
        }

        sender.send("n2", lost_payload("n9"), Priority::High).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicates_are_delivered_once() {
        let fabric = Arc::new(MemoryFabric::new());
        let sender = bus(&fabric, "n1");
        let receiver = bus(&fabric, "n2");

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        receiver.register_fn(MessageType::SwarmNodeLost, move |_m| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        receiver.start().await.unwrap();

        let message = Message::broadcast(
            sender.node().clone(),
            lost_payload("n9"),
            Priority::Normal,
            30_000,
        );
        let value = message.encode_value().unwrap();
        fabric.publish("swarm:broadcast", value.clone()).await.unwrap();
        fabric.publish("swarm:broadcast", value).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(receiver.stats().deduplicated, 1);
    }

    #[tokio::test]
    async fn stale_messages_are_dropped_silently() {
        let fabric = Arc::new(MemoryFabric::new());
        let sender = bus(&fabric, "n1");
        let receiver = bus(&fabric, "n2");

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        receiver.register_fn(MessageType::SwarmNodeLost, move |_m| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        receiver.start().await.unwrap();

        let mut message = Message::broadcast(
            sender.node().clone(),
            lost_payload("n9"),
            Priority::Normal,
            1_000,
        );
        message.timestamp -= 10_000;
        fabric
            .publish("swarm:broadcast", message.encode_value().unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(receiver.stats().dropped_stale, 1);
    }

    #[tokio::test]
    async fn failing_handler_does_not_affect_others() {
        let fabric = Arc::new(MemoryFabric::new());
        let sender = bus(&fabric, "n1");
        let receiver = bus(&fabric, "n2");

        receiver.register_fn(MessageType::SwarmNodeLost, |_m| async {
            anyhow::bail!("handler exploded")
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        receiver.register_fn(MessageType::SwarmNodeLost, move |_m| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        sender.start().await.unwrap();
        receiver.start().await.unwrap();

        sender.broadcast(lost_payload("n9"), Priority::Normal).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(receiver.stats().handler_failures, 1);
    }
}
