//! # Chorus Unified Message Protocol
//!
//! Typed, prioritized, TTL-bounded messages over the fabric's pub/sub
//! channels. Every payload is a concrete schema selected by the message
//! type at decode time; nothing dynamically typed crosses the wire.
//!
//! Delivery contract:
//! - broadcasts go to the swarm-wide channel, targeted sends to the
//!   recipient's private inbox channel;
//! - receivers drop messages older than their TTL silently;
//! - delivery is at-most-once, deduplicated by message id for five times
//!   the maximum TTL;
//! - handlers are dispatched on a bounded worker pool so one slow
//!   handler cannot starve the receive loop.

pub mod bus;
pub mod payload;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use chorus_core::{now_ms, NodeId, Priority};

pub use bus::{BusConfig, BusStats, FnHandler, MessageBus, MessageHandler};
pub use payload::{
    ConsensusInitiatedPayload, ConsensusVoteRequest, ConsensusVoteResponse,
    CrisisDetectedPayload, HealthCheckCompletedPayload, ImmortalState, LeaderElectedPayload,
    MessagePayload, NodeDiscoveredPayload, NodeLostPayload, PatternPublishedPayload,
    PoetryCompletedPayload, ReplicationAckPayload, ReplicationBatchPayload,
    ResurrectionTriggeredPayload, SharedMetric,
};

/// Message types carried on the fabric. Extend this enum; never renumber
/// or rename existing variants, their wire names are load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    SwarmNodeDiscovered,
    SwarmNodeLost,
    SwarmConsensusInitiated,
    SwarmLeaderElected,
    SwarmConsensusVoteRequest,
    SwarmConsensusVoteResponse,
    ImmortalityCrisisDetected,
    ImmortalityResurrectionTriggered,
    CreativePoetryCompleted,
    SystemHealthCheckCompleted,
    EmergencePatternPublished,
    ReplicationBatch,
    ReplicationAck,
}

/// Wire reference to a message target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub id: String,
}

/// One protocol message. The `kind` is always derivable from the payload
/// variant; constructors keep the two coherent.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub kind: MessageType,
    pub source: NodeId,
    pub target: Option<TargetRef>,
    pub timestamp: i64,
    pub ttl_ms: u64,
    pub priority: Priority,
    pub payload: MessagePayload,
}

/// Raw wire shape; `payload` stays opaque until the type selects its
/// schema.
#[derive(Serialize, Deserialize)]
struct WireMessage {
    id: String,
    #[serde(rename = "type")]
    kind: MessageType,
    source: NodeId,
    #[serde(default)]
    target: Option<TargetRef>,
    timestamp: i64,
    ttl: u64,
    priority: Priority,
    payload: Value,
}

impl Message {
    /// Build a broadcast message.
    pub fn broadcast(source: NodeId, payload: MessagePayload, priority: Priority, ttl_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: payload.kind(),
            source,
            target: None,
            timestamp: now_ms(),
            ttl_ms,
            priority,
            payload,
        }
    }

    /// Build a targeted message.
    pub fn to_target(
        source: NodeId,
        target: &str,
        payload: MessagePayload,
        priority: Priority,
        ttl_ms: u64,
    ) -> Self {
        Self {
            target: Some(TargetRef { id: target.to_string() }),
            ..Self::broadcast(source, payload, priority, ttl_ms)
        }
    }

    /// Whether the message has outlived its TTL at `now` (epoch ms).
    pub fn is_stale(&self, now: i64) -> bool {
        now.saturating_sub(self.timestamp) > self.ttl_ms as i64
    }

    pub fn encode_value(&self) -> Result<Value> {
        let wire = WireMessage {
            id: self.id.clone(),
            kind: self.kind,
            source: self.source.clone(),
            target: self.target.clone(),
            timestamp: self.timestamp,
            ttl: self.ttl_ms,
            priority: self.priority,
            payload: self.payload.to_value()?,
        };
        serde_json::to_value(&wire).context("encoding message")
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(&self.encode_value()?).context("serializing message")
    }

    pub fn decode_value(value: Value) -> Result<Self> {
        let wire: WireMessage =
            serde_json::from_value(value).context("malformed message envelope")?;
        let payload = MessagePayload::from_value(wire.kind, wire.payload)?;
        if payload.kind() != wire.kind {
            bail!("payload schema does not match message type {:?}", wire.kind);
        }
        Ok(Self {
            id: wire.id,
            kind: wire.kind,
            source: wire.source,
            target: wire.target,
            timestamp: wire.timestamp,
            ttl_ms: wire.ttl,
            priority: wire.priority,
            payload,
        })
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Self::decode_value(serde_json::from_str(raw).context("parsing message JSON")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::now_ms;

    fn node(id: &str) -> NodeId {
        NodeId::with_id(id, "test")
    }

    #[test]
    fn message_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageType::SwarmConsensusVoteRequest).unwrap(),
            "\"SWARM_CONSENSUS_VOTE_REQUEST\""
        );
        assert_eq!(
            serde_json::to_string(&MessageType::EmergencePatternPublished).unwrap(),
            "\"EMERGENCE_PATTERN_PUBLISHED\""
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        let message = Message::to_target(
            node("n1"),
            "n2",
            MessagePayload::NodeLost(NodeLostPayload {
                node_id: "n3".to_string(),
                last_seen: now_ms() - 60_000,
                reason: "heartbeat stale".to_string(),
            }),
            Priority::High,
            30_000,
        );
        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn envelope_matches_the_canonical_wire_shape() {
        let message = Message::broadcast(
            node("n1"),
            MessagePayload::NodeLost(NodeLostPayload {
                node_id: "n2".to_string(),
                last_seen: 1_710_000_000_000,
                reason: "stale".to_string(),
            }),
            Priority::Critical,
            30_000,
        );
        let value = message.encode_value().unwrap();

        assert!(value["id"].is_string());
        assert_eq!(value["type"], "SWARM_NODE_LOST");
        assert_eq!(value["source"]["id"], "n1");
        assert!(value["source"]["birth"].is_string());
        assert!(value["source"]["personality"].is_object());
        assert!(value["source"]["capabilities"].is_array());
        assert!(value["target"].is_null());
        assert!(value["timestamp"].is_i64());
        assert_eq!(value["ttl"], 30_000);
        assert_eq!(value["priority"], "critical");
        assert!(value["payload"].is_object());
    }

    #[test]
    fn staleness_is_ttl_bounded() {
        let mut message = Message::broadcast(
            node("n1"),
            MessagePayload::NodeLost(NodeLostPayload {
                node_id: "n2".to_string(),
                last_seen: 0,
                reason: "test".to_string(),
            }),
            Priority::Normal,
            1_000,
        );
        assert!(!message.is_stale(message.timestamp + 500));
        message.timestamp -= 2_000;
        assert!(message.is_stale(now_ms()));
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let message = Message::broadcast(
            node("n1"),
            MessagePayload::NodeLost(NodeLostPayload {
                node_id: "n2".to_string(),
                last_seen: 0,
                reason: "test".to_string(),
            }),
            Priority::Normal,
            1_000,
        );
        let mut value = message.encode_value().unwrap();
        value["type"] = serde_json::json!("SWARM_CONSENSUS_VOTE_REQUEST");
        assert!(Message::decode_value(value).is_err());
    }
}
