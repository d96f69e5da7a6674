//! Pattern storage, publication, and the collective-beauty view.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use chorus_cache::{CacheConfig, TtlCache};
use chorus_core::{EmergencePattern, Priority};
use chorus_fabric::{keys, Fabric, Keyspace};
use chorus_protocol::{MessageBus, MessagePayload, PatternPublishedPayload};

use crate::engine::{self, EngineParams};

#[derive(Debug, Clone)]
pub struct EmergenceConfig {
    pub iterations: usize,
    pub pattern_length: usize,
    /// Patterns older than this fall out of the store.
    pub retention: Duration,
}

impl Default for EmergenceConfig {
    fn default() -> Self {
        Self {
            iterations: 100,
            pattern_length: 50,
            retention: Duration::from_secs(4 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmergenceStats {
    pub generated: u64,
    pub absorbed: u64,
    pub local_patterns: usize,
    pub remote_patterns: usize,
    pub mean_local_harmony: f64,
}

/// Pattern generator and store for one coordinator.
pub struct EmergenceService {
    node_id: String,
    config: EmergenceConfig,
    fabric: Arc<dyn Fabric>,
    bus: MessageBus,
    /// Own patterns, keyed by pattern id.
    local: TtlCache<String, EmergencePattern>,
    /// Peer patterns, keyed by `<nodeId>/<patternId>`.
    remote: TtlCache<String, EmergencePattern>,
    generated: AtomicU64,
    absorbed: AtomicU64,
    seed_counter: AtomicU32,
}

impl EmergenceService {
    pub fn new(
        node_id: &str,
        config: EmergenceConfig,
        fabric: Arc<dyn Fabric>,
        bus: MessageBus,
    ) -> Self {
        let cache_config = CacheConfig {
            default_ttl: config.retention,
            max_size: 500,
            cleanup_interval: None,
        };
        // Seed the counter from the node id so coordinators started in
        // the same millisecond still explore different seeds.
        let seed_base = node_id
            .bytes()
            .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        Self {
            node_id: node_id.to_string(),
            config,
            fabric,
            bus,
            local: TtlCache::new(cache_config.clone()),
            remote: TtlCache::new(cache_config),
            generated: AtomicU64::new(0),
            absorbed: AtomicU64::new(0),
            seed_counter: AtomicU32::new(seed_base),
        }
    }

    /// Start the cache sweepers.
    pub fn start(&self) {
        self.local.start();
        self.remote.start();
    }

    pub fn stop(&self) {
        self.local.close();
        self.remote.close();
    }

    /// Evolve a pattern, store it, and publish it. With `seed = None` a
    /// rolling per-node seed is used.
    pub async fn generate(&self, seed: Option<u32>) -> Result<EmergencePattern> {
        let seed = seed.unwrap_or_else(|| self.seed_counter.fetch_add(1, Ordering::Relaxed));
        let params = EngineParams {
            pattern_length: self.config.pattern_length,
            iterations: self.config.iterations,
        };
        let pattern = engine::evolve(seed, &params);
        self.generated.fetch_add(1, Ordering::Relaxed);
        debug!(
            seed,
            harmony = pattern.harmony,
            beauty = pattern.final_state.beauty,
            "emergence pattern evolved"
        );

        self.local.set(pattern.id.clone(), pattern.clone());
        self.publish(&pattern).await;
        Ok(pattern)
    }

    /// Publication is best-effort: the engine keeps operating offline and
    /// the local cache still serves reads.
    async fn publish(&self, pattern: &EmergencePattern) {
        let field = Keyspace::pattern_field(&self.node_id, &pattern.id);
        match serde_json::to_value(pattern) {
            Ok(value) => {
                if let Err(error) = self.fabric.hash_set(keys::PATTERN_STORE, &field, value).await {
                    warn!(%error, "pattern store write failed, keeping pattern local");
                }
            }
            Err(error) => warn!(%error, "pattern serialization failed"),
        }

        let payload = MessagePayload::PatternPublished(PatternPublishedPayload {
            node_id: self.node_id.clone(),
            pattern: pattern.clone(),
        });
        match payload.to_value() {
            Ok(value) => {
                // The dedicated pattern channel mirrors the broadcast so
                // aesthetic-only consumers need not speak the full
                // protocol.
                if let Err(error) = self.fabric.publish(keys::PATTERN_CHANNEL, value).await {
                    warn!(%error, "pattern channel publish failed");
                }
            }
            Err(error) => warn!(%error, "pattern payload encoding failed"),
        }
        if let Err(error) = self.bus.broadcast(payload, Priority::Low).await {
            warn!(%error, "pattern publication failed, keeping pattern local");
        }
    }

    pub fn pattern(&self, id: &str) -> Option<EmergencePattern> {
        self.local.get(&id.to_string())
    }

    /// Record a pattern published by a peer. Out-of-range harmony is
    /// rejected rather than clamped; a peer reporting impossible scores
    /// is not a source we want feeding consensus.
    pub fn absorb_remote(&self, node_id: &str, pattern: EmergencePattern) -> bool {
        if !(0.0..=1.0).contains(&pattern.harmony) || !pattern.harmony.is_finite() {
            warn!(peer = node_id, harmony = pattern.harmony, "rejecting out-of-range remote pattern");
            return false;
        }
        let key = Keyspace::pattern_field(node_id, &pattern.id);
        self.remote.set(key, pattern);
        self.absorbed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Collective harmony of this node's own patterns: the engine
    /// re-runs over the summed seeds. Neutral 0.5 before any pattern
    /// exists.
    pub fn self_harmony(&self) -> f64 {
        let seeds: Vec<u32> = self.local.values().iter().map(|p| p.seed).collect();
        if seeds.is_empty() {
            return 0.5;
        }
        engine::collective(&seeds, self.config.pattern_length).harmony
    }

    /// Mean harmony of the known remote patterns of one peer.
    pub fn peer_harmony(&self, node_id: &str) -> Option<f64> {
        let prefix = format!("{}/", node_id);
        let harmonies: Vec<f64> = self
            .remote
            .entries()
            .into_iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, p)| p.harmony)
            .collect();
        if harmonies.is_empty() {
            None
        } else {
            Some(harmonies.iter().sum::<f64>() / harmonies.len() as f64)
        }
    }

    pub fn stats(&self) -> EmergenceStats {
        let local = self.local.values();
        let mean_local_harmony = if local.is_empty() {
            0.0
        } else {
            local.iter().map(|p| p.harmony).sum::<f64>() / local.len() as f64
        };
        EmergenceStats {
            generated: self.generated.load(Ordering::Relaxed),
            absorbed: self.absorbed.load(Ordering::Relaxed),
            local_patterns: local.len(),
            remote_patterns: self.remote.len(),
            mean_local_harmony,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::NodeId;
    use chorus_fabric::MemoryFabric;
    use chorus_protocol::BusConfig;

    fn service(fabric: &Arc<MemoryFabric>, id: &str) -> EmergenceService {
        let bus = MessageBus::new(
            NodeId::with_id(id, id),
            Arc::clone(fabric) as Arc<dyn Fabric>,
            Keyspace::new("swarm"),
            BusConfig::default(),
        );
        EmergenceService::new(id, EmergenceConfig::default(), Arc::clone(fabric) as Arc<dyn Fabric>, bus)
    }

    #[tokio::test]
    async fn generate_stores_and_writes_through() {
        let fabric = Arc::new(MemoryFabric::new());
        let service = service(&fabric, "n1");
        let pattern = service.generate(Some(42)).await.unwrap();
        assert!(service.pattern(&pattern.id).is_some());

        let stored = fabric.hash_get_all(keys::PATTERN_STORE).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored.contains_key(&format!("n1/{}", pattern.id)));
    }

    #[tokio::test]
    async fn self_harmony_uses_collective_seeds() {
        let fabric = Arc::new(MemoryFabric::new());
        let service = service(&fabric, "n1");
        assert!((service.self_harmony() - 0.5).abs() < 1e-12);
        service.generate(Some(10)).await.unwrap();
        service.generate(Some(20)).await.unwrap();
        let expected = engine::collective(&[10, 20], 50).harmony;
        assert!((service.self_harmony() - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn remote_patterns_feed_peer_harmony() {
        let fabric = Arc::new(MemoryFabric::new());
        let service = service(&fabric, "n1");
        assert!(service.peer_harmony("n2").is_none());

        let pattern = engine::evolve(5, &EngineParams::default());
        assert!(service.absorb_remote("n2", pattern.clone()));
        let harmony = service.peer_harmony("n2").unwrap();
        assert!((harmony - pattern.harmony).abs() < 1e-12);
    }

    #[tokio::test]
    async fn invalid_remote_patterns_are_rejected() {
        let fabric = Arc::new(MemoryFabric::new());
        let service = service(&fabric, "n1");
        let mut pattern = engine::evolve(5, &EngineParams::default());
        pattern.harmony = 3.0;
        assert!(!service.absorb_remote("n2", pattern));
        assert_eq!(service.stats().remote_patterns, 0);
    }
}
