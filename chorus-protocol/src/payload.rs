//! Payload schemas, one per message type.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use chorus_core::{EmergencePattern, LogEntry, MusicalNote, NodeId};

use crate::MessageType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDiscoveredPayload {
    pub node: NodeId,
    pub discovered_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeLostPayload {
    pub node_id: String,
    pub last_seen: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusInitiatedPayload {
    pub consensus_id: String,
    pub initiator: String,
    pub known_nodes: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderElectedPayload {
    pub consensus_id: String,
    pub leader: String,
    pub votes_received: u32,
    pub quorum_size: u32,
    pub dominant_note: MusicalNote,
    pub frequency_hz: f64,
    pub timestamp: i64,
}

/// One row of the per-round metrics table. Every voter computes its vote
/// from this same table, which is what makes the majority deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedMetric {
    pub node_id: String,
    pub health_score: f64,
    pub beauty_factor: f64,
    pub final_score: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusVoteRequest {
    pub consensus_id: String,
    pub requester: NodeId,
    pub known_nodes: Vec<String>,
    pub node_metrics: HashMap<String, SharedMetric>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusVoteResponse {
    pub voter: NodeId,
    pub consensus_id: String,
    pub candidate: String,
    pub signature: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisDetectedPayload {
    pub severity: String,
    pub description: String,
    pub threat_level: f64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResurrectionTriggeredPayload {
    pub reason: String,
    pub report_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoetryCompletedPayload {
    pub title: String,
    pub verses: Vec<String>,
    pub beauty: f64,
    pub timestamp: i64,
}

/// Condensed self-state carried by health-check broadcasts. Emitted only
/// when it changed significantly since the last broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImmortalState {
    pub health: f64,
    pub harmony: f64,
    pub consciousness: f64,
    pub crisis: bool,
    pub quarantined: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckCompletedPayload {
    pub state: ImmortalState,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternPublishedPayload {
    pub node_id: String,
    pub pattern: EmergencePattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationBatchPayload {
    pub batch_id: String,
    pub term: u64,
    pub commit_index: u64,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationAckPayload {
    pub batch_id: String,
    pub success: bool,
    pub match_index: u64,
    pub conflict_ids: Vec<String>,
    pub detail: Option<String>,
}

/// Tagged union of every payload schema, indexed by [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    NodeDiscovered(NodeDiscoveredPayload),
    NodeLost(NodeLostPayload),
    ConsensusInitiated(ConsensusInitiatedPayload),
    LeaderElected(LeaderElectedPayload),
    VoteRequest(ConsensusVoteRequest),
    VoteResponse(ConsensusVoteResponse),
    CrisisDetected(CrisisDetectedPayload),
    ResurrectionTriggered(ResurrectionTriggeredPayload),
    PoetryCompleted(PoetryCompletedPayload),
    HealthCheckCompleted(HealthCheckCompletedPayload),
    PatternPublished(PatternPublishedPayload),
    ReplicationBatch(ReplicationBatchPayload),
    ReplicationAck(ReplicationAckPayload),
}

impl MessagePayload {
    /// The message type this payload belongs to.
    pub fn kind(&self) -> MessageType {
        match self {
            MessagePayload::NodeDiscovered(_) => MessageType::SwarmNodeDiscovered,
            MessagePayload::NodeLost(_) => MessageType::SwarmNodeLost,
            MessagePayload::ConsensusInitiated(_) => MessageType::SwarmConsensusInitiated,
            MessagePayload::LeaderElected(_) => MessageType::SwarmLeaderElected,
            MessagePayload::VoteRequest(_) => MessageType::SwarmConsensusVoteRequest,
            MessagePayload::VoteResponse(_) => MessageType::SwarmConsensusVoteResponse,
            MessagePayload::CrisisDetected(_) => MessageType::ImmortalityCrisisDetected,
            MessagePayload::ResurrectionTriggered(_) => {
                MessageType::ImmortalityResurrectionTriggered
            }
            MessagePayload::PoetryCompleted(_) => MessageType::CreativePoetryCompleted,
            MessagePayload::HealthCheckCompleted(_) => MessageType::SystemHealthCheckCompleted,
            MessagePayload::PatternPublished(_) => MessageType::EmergencePatternPublished,
            MessagePayload::ReplicationBatch(_) => MessageType::ReplicationBatch,
            MessagePayload::ReplicationAck(_) => MessageType::ReplicationAck,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            MessagePayload::NodeDiscovered(p) => serde_json::to_value(p),
            MessagePayload::NodeLost(p) => serde_json::to_value(p),
            MessagePayload::ConsensusInitiated(p) => serde_json::to_value(p),
            MessagePayload::LeaderElected(p) => serde_json::to_value(p),
            MessagePayload::VoteRequest(p) => serde_json::to_value(p),
            MessagePayload::VoteResponse(p) => serde_json::to_value(p),
            MessagePayload::CrisisDetected(p) => serde_json::to_value(p),
            MessagePayload::ResurrectionTriggered(p) => serde_json::to_value(p),
            MessagePayload::PoetryCompleted(p) => serde_json::to_value(p),
            MessagePayload::HealthCheckCompleted(p) => serde_json::to_value(p),
            MessagePayload::PatternPublished(p) => serde_json::to_value(p),
            MessagePayload::ReplicationBatch(p) => serde_json::to_value(p),
            MessagePayload::ReplicationAck(p) => serde_json::to_value(p),
        };
        value.context("encoding payload")
    }

    /// Decode a raw payload against the schema its message type selects.
    pub fn from_value(kind: MessageType, value: Value) -> Result<Self> {
        let payload = match kind {
            MessageType::SwarmNodeDiscovered => {
                MessagePayload::NodeDiscovered(serde_json::from_value(value)?)
            }
            MessageType::SwarmNodeLost => MessagePayload::NodeLost(serde_json::from_value(value)?),
            MessageType::SwarmConsensusInitiated => {
                MessagePayload::ConsensusInitiated(serde_json::from_value(value)?)
            }
            MessageType::SwarmLeaderElected => {
                MessagePayload::LeaderElected(serde_json::from_value(value)?)
            }
            MessageType::SwarmConsensusVoteRequest => {
                MessagePayload::VoteRequest(serde_json::from_value(value)?)
            }
            MessageType::SwarmConsensusVoteResponse => {
                MessagePayload::VoteResponse(serde_json::from_value(value)?)
            }
            MessageType::ImmortalityCrisisDetected => {
                MessagePayload::CrisisDetected(serde_json::from_value(value)?)
            }
            MessageType::ImmortalityResurrectionTriggered => {
                MessagePayload::ResurrectionTriggered(serde_json::from_value(value)?)
            }
            MessageType::CreativePoetryCompleted => {
                MessagePayload::PoetryCompleted(serde_json::from_value(value)?)
            }
            MessageType::SystemHealthCheckCompleted => {
                MessagePayload::HealthCheckCompleted(serde_json::from_value(value)?)
            }
            MessageType::EmergencePatternPublished => {
                MessagePayload::PatternPublished(serde_json::from_value(value)?)
            }
            MessageType::ReplicationBatch => {
                MessagePayload::ReplicationBatch(serde_json::from_value(value)?)
            }
            MessageType::ReplicationAck => {
                MessagePayload::ReplicationAck(serde_json::from_value(value)?)
            }
        };
        Ok(payload)
    }
}

impl SharedMetric {
    /// Compose the final score from its two inputs with the canonical
    /// 0.7 / 0.3 weighting.
    pub fn compose(node_id: &str, health_score: f64, beauty_factor: f64, timestamp: i64) -> Self {
        Self {
            node_id: node_id.to_string(),
            health_score,
            beauty_factor,
            final_score: 0.7 * health_score + 0.3 * beauty_factor,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_metric_weighting() {
        let metric = SharedMetric::compose("n1", 0.8, 0.5, 0);
        assert!((metric.final_score - (0.7 * 0.8 + 0.3 * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn vote_request_round_trips_with_metrics_table() {
        let mut node_metrics = HashMap::new();
        node_metrics.insert("n1".to_string(), SharedMetric::compose("n1", 0.9, 0.6, 7));
        node_metrics.insert("n2".to_string(), SharedMetric::compose("n2", 0.4, 0.2, 7));
        let payload = MessagePayload::VoteRequest(ConsensusVoteRequest {
            consensus_id: "round-9".to_string(),
            requester: NodeId::with_id("n1", "n1"),
            known_nodes: vec!["n2".to_string()],
            node_metrics,
            timestamp: 7,
        });
        let round =
            MessagePayload::from_value(payload.kind(), payload.to_value().unwrap()).unwrap();
        assert_eq!(round, payload);
    }

    #[test]
    fn every_payload_kind_is_coherent() {
        let payload = MessagePayload::CrisisDetected(CrisisDetectedPayload {
            severity: "critical".to_string(),
            description: "memory pressure".to_string(),
            threat_level: 0.92,
            timestamp: 0,
        });
        assert_eq!(payload.kind(), MessageType::ImmortalityCrisisDetected);
        let round =
            MessagePayload::from_value(payload.kind(), payload.to_value().unwrap()).unwrap();
        assert_eq!(round, payload);
    }
}
