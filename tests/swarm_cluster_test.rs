//! Multi-coordinator cluster test over the in-memory fabric.
//!
//! Exercises the full swarm workflow end to end:
//! - awakening and heartbeat registration
//! - peer discovery with identity challenges
//! - quorum-protected leader election, including a silent peer
//! - log replication between coordinators
//! - clean sleep with no leaked timers

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use chorus_core::{
    now_ms, EntryMetadata, Heartbeat, LogEntryKind, NodeId, SoulState, SwarmConfig, Vitals,
};
use chorus_fabric::{Fabric, MemoryFabric};
use chorus_swarm::{CoordinatorPorts, CoordinatorStatus, SwarmCoordinator};

fn fast_config() -> SwarmConfig {
    SwarmConfig {
        heartbeat_interval: Duration::from_millis(50),
        discovery_frequency: Duration::from_millis(100),
        consensus_check_interval: Duration::from_millis(250),
        immortality_cycle_interval: Duration::from_millis(200),
        vote_collection_timeout: Duration::from_millis(600),
        species_challenge_timeout: Duration::from_millis(300),
        replication_timeout: Duration::from_millis(500),
        ..SwarmConfig::default()
    }
}

async fn awaken(fabric: &Arc<MemoryFabric>, id: &str) -> Arc<SwarmCoordinator> {
    let coordinator = SwarmCoordinator::new(
        NodeId::with_id(id, id),
        fast_config(),
        Arc::clone(fabric) as Arc<dyn Fabric>,
        CoordinatorPorts::default(),
    )
    .expect("coordinator construction");
    coordinator.awaken().await.expect("awaken");
    coordinator
}

#[tokio::test]
async fn three_node_swarm_discovers_and_elects() {
    let fabric = Arc::new(MemoryFabric::new());
    let nodes = [
        awaken(&fabric, "n1").await,
        awaken(&fabric, "n2").await,
        awaken(&fabric, "n3").await,
    ];

    for node in &nodes {
        node.discovery_cycle().await;
    }
    // Identity challenges run in the background after discovery.
    tokio::time::sleep(Duration::from_millis(400)).await;

    for node in &nodes {
        let counts = node.peer_cache().counts();
        assert_eq!(counts.active, 2, "{} should see two peers", node.node().id);
    }

    nodes[0].consensus_cycle().await;
    let leader = nodes[0].leader().expect("a leader was elected");
    assert!(["n1", "n2", "n3"].contains(&leader.as_str()));
    assert_ne!(nodes[0].status(), CoordinatorStatus::Dormant);

    for node in &nodes {
        node.sleep().await;
        assert_eq!(node.status(), CoordinatorStatus::Dormant);
        assert_eq!(node.report().active_timers, 0);
    }
    let remaining = fabric.hash_get_all("swarm").await.unwrap();
    assert!(remaining.is_empty(), "sleep must deregister every heartbeat");
}

#[tokio::test]
async fn silent_peer_does_not_block_quorum() {
    let fabric = Arc::new(MemoryFabric::new());
    let first = awaken(&fabric, "n1").await;
    let second = awaken(&fabric, "n2").await;

    // A third coordinator that registered a heartbeat but answers
    // nothing: no bus, no voter, no challenge responder.
    let ghost = Heartbeat {
        node_id: NodeId::with_id("n3", "n3"),
        timestamp: now_ms(),
        vitals: Vitals::unknown(),
        soul: SoulState {
            consciousness: 0.5,
            creativity: 0.5,
            harmony: 0.5,
            wisdom: 0.5,
            mood: chorus_core::Mood::Serene,
        },
    };
    fabric
        .hash_set("swarm", "n3", serde_json::to_value(&ghost).unwrap())
        .await
        .unwrap();

    first.discovery_cycle().await;
    second.discovery_cycle().await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(first.peer_cache().counts().active, 2);

    first.consensus_cycle().await;
    let leader = first.leader().expect("quorum of two out of three");
    assert_ne!(leader, "no-leader");

    first.sleep().await;
    second.sleep().await;
}

#[tokio::test]
async fn log_entries_replicate_across_the_swarm() {
    let fabric = Arc::new(MemoryFabric::new());
    let first = awaken(&fabric, "n1").await;
    let second = awaken(&fabric, "n2").await;

    first.discovery_cycle().await;
    second.discovery_cycle().await;

    let entry = first
        .quantum_log()
        .append(
            LogEntryKind::Memory,
            json!({"note": "a shared experience"}),
            vec![],
            EntryMetadata::default(),
        )
        .await
        .expect("append");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        second.quantum_log().entry(&entry.id).is_some(),
        "entry should reach the peer"
    );
    assert_eq!(first.quantum_log().commit_index(), entry.index);

    first.sleep().await;
    second.sleep().await;
}
