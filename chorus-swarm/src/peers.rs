//! The peer cache and its read-only adapters.
//!
//! The cache is owned by the coordinator's discovery loop: only that
//! loop mutates entries. Consensus and replication take snapshots
//! through the [`PeerView`]/[`BeautySource`] adapters.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use chorus_consensus::{BeautySource, PeerView};
use chorus_core::{PeerRole, PeerStatus, SwarmNode};
use chorus_emergence::EmergenceService;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerCounts {
    pub active: usize,
    pub lost: usize,
    pub quarantined: usize,
}

/// Discovery-owned cache of everything known about the other
/// coordinators.
#[derive(Default)]
pub struct PeerCache {
    peers: DashMap<String, SwarmNode>,
}

impl PeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<SwarmNode> {
        self.peers.get(id).map(|p| p.clone())
    }

    pub fn snapshot(&self) -> Vec<SwarmNode> {
        self.peers.iter().map(|p| p.clone()).collect()
    }

    /// Insert or refresh a peer. Returns `true` when the peer is new.
    /// Stale updates (older than what we already hold) are dropped.
    pub fn upsert(&self, node: SwarmNode) -> bool {
        let id = node.node_id.id.clone();
        match self.peers.get_mut(&id) {
            Some(mut existing) => {
                if node.last_seen >= existing.last_seen {
                    let role = existing.role;
                    let status = if existing.status == PeerStatus::Quarantined {
                        PeerStatus::Quarantined
                    } else {
                        node.status
                    };
                    *existing = SwarmNode { role, status, ..node };
                }
                false
            }
            None => {
                self.peers.insert(id, node);
                true
            }
        }
    }

    /// Mark a peer lost. Returns `true` if it was previously active.
    pub fn mark_lost(&self, id: &str) -> bool {
        match self.peers.get_mut(id) {
            Some(mut peer) if peer.status == PeerStatus::Active => {
                peer.status = PeerStatus::Lost;
                true
            }
            _ => false,
        }
    }

    pub fn mark_quarantined(&self, id: &str) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            peer.status = PeerStatus::Quarantined;
        }
    }

    /// Return a quarantined peer to active duty. Returns `true` if the
    /// peer was quarantined.
    pub fn reinstate(&self, id: &str) -> bool {
        match self.peers.get_mut(id) {
            Some(mut peer) if peer.status == PeerStatus::Quarantined => {
                peer.status = PeerStatus::Active;
                true
            }
            _ => false,
        }
    }

    pub fn set_leader(&self, leader_id: &str) {
        for mut peer in self.peers.iter_mut() {
            peer.role = if peer.node_id.id == leader_id {
                PeerRole::Leader
            } else {
                PeerRole::Follower
            };
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.peers.remove(id).is_some()
    }

    pub fn counts(&self) -> PeerCounts {
        let mut counts = PeerCounts::default();
        for peer in self.peers.iter() {
            match peer.status {
                PeerStatus::Active => counts.active += 1,
                PeerStatus::Lost => counts.lost += 1,
                PeerStatus::Quarantined => counts.quarantined += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Read-only snapshot adapter handed to the consensus engine.
pub struct PeerCacheView(pub Arc<PeerCache>);

impl PeerView for PeerCacheView {
    fn known_peers(&self) -> Vec<SwarmNode> {
        self.0.snapshot()
    }
}

/// Beauty adapter: collective harmony from the emergence service.
pub struct EmergenceBeauty(pub Arc<EmergenceService>);

impl BeautySource for EmergenceBeauty {
    fn self_harmony(&self) -> f64 {
        self.0.self_harmony()
    }

    fn peer_harmony(&self, node_id: &str) -> Option<f64> {
        self.0.peer_harmony(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{now_ms, HealthState, LoadVector, Mood, NodeId, SoulState, Vitals};

    fn peer(id: &str, last_seen: i64) -> SwarmNode {
        SwarmNode {
            node_id: NodeId::with_id(id, id),
            vitals: Vitals {
                health: HealthState::Healthy,
                load: LoadVector::default(),
                connections: 0,
                uptime_ms: 0,
                last_consensus: None,
            },
            soul: SoulState {
                consciousness: 0.5,
                creativity: 0.5,
                harmony: 0.5,
                wisdom: 0.5,
                mood: Mood::Serene,
            },
            last_seen,
            role: PeerRole::Follower,
            status: PeerStatus::Active,
        }
    }

    #[test]
    fn upsert_reports_newness_and_keeps_latest() {
        let cache = PeerCache::new();
        let now = now_ms();
        assert!(cache.upsert(peer("n2", now)));
        assert!(!cache.upsert(peer("n2", now + 1000)));
        // A stale duplicate must not rewind the record.
        assert!(!cache.upsert(peer("n2", now - 5000)));
        assert_eq!(cache.get("n2").unwrap().last_seen, now + 1000);
    }

    #[test]
    fn quarantine_survives_fresh_heartbeats() {
        let cache = PeerCache::new();
        let now = now_ms();
        cache.upsert(peer("n2", now));
        cache.mark_quarantined("n2");
        cache.upsert(peer("n2", now + 1000));
        assert_eq!(cache.get("n2").unwrap().status, PeerStatus::Quarantined);
    }

    #[test]
    fn mark_lost_only_fires_once() {
        let cache = PeerCache::new();
        cache.upsert(peer("n2", now_ms()));
        assert!(cache.mark_lost("n2"));
        assert!(!cache.mark_lost("n2"));
        let counts = cache.counts();
        assert_eq!(counts.lost, 1);
        assert_eq!(counts.active, 0);
    }

    #[test]
    fn leader_role_is_exclusive() {
        let cache = PeerCache::new();
        let now = now_ms();
        cache.upsert(peer("n2", now));
        cache.upsert(peer("n3", now));
        cache.set_leader("n2");
        assert_eq!(cache.get("n2").unwrap().role, PeerRole::Leader);
        assert_eq!(cache.get("n3").unwrap().role, PeerRole::Follower);
        cache.set_leader("n3");
        assert_eq!(cache.get("n2").unwrap().role, PeerRole::Follower);
    }
}
