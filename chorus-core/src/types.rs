//! Shared data model for the swarm runtime.
//!
//! Everything here is a value record exchanged between components or over
//! the fabric. Ownership is single-writer unless a field doc says
//! otherwise; consumers take read-only snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::NodeId;
use crate::sha256_hex;

/// Coarse health classification derived from resource pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Optimal,
    Healthy,
    Warning,
    Critical,
    Failing,
}

impl HealthState {
    /// Categorical weight used when blending a peer's reported health
    /// into its shared-metric health score.
    pub fn score(&self) -> f64 {
        match self {
            HealthState::Optimal => 1.0,
            HealthState::Healthy => 0.85,
            HealthState::Warning => 0.5,
            HealthState::Critical => 0.2,
            HealthState::Failing => 0.05,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthState::Warning | HealthState::Critical | HealthState::Failing)
    }
}

/// Normalized resource load, each axis in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadVector {
    pub cpu: f64,
    pub memory: f64,
    pub network: f64,
    pub storage: f64,
}

impl LoadVector {
    pub fn mean(&self) -> f64 {
        (self.cpu + self.memory + self.network + self.storage) / 4.0
    }
}

/// Per-node telemetry record written with every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vitals {
    pub health: HealthState,
    pub load: LoadVector,
    pub connections: u32,
    pub uptime_ms: u64,
    /// Epoch-ms timestamp of the last consensus round this node saw.
    pub last_consensus: Option<i64>,
}

impl Vitals {
    /// A neutral record for nodes we have not heard from yet.
    pub fn unknown() -> Self {
        Self {
            health: HealthState::Warning,
            load: LoadVector::default(),
            connections: 0,
            uptime_ms: 0,
            last_consensus: None,
        }
    }
}

/// Aesthetic projection of vitals used for harmonic weighting, each axis
/// in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VitalSigns {
    pub health: f64,
    pub harmony: f64,
    pub creativity: f64,
    pub stress: f64,
}

/// Categorical mood of a coordinator's soul.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Serene,
    Curious,
    Harmonizing,
    Restless,
    Melancholic,
    Transcendent,
}

impl Mood {
    /// Canonical lowercase name, the form committed into soul signatures.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Serene => "serene",
            Mood::Curious => "curious",
            Mood::Harmonizing => "harmonizing",
            Mood::Restless => "restless",
            Mood::Melancholic => "melancholic",
            Mood::Transcendent => "transcendent",
        }
    }
}

/// Slowly-evolving scalar state of a coordinator. Snapshotted per
/// heartbeat; never rewritten retroactively.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SoulState {
    pub consciousness: f64,
    pub creativity: f64,
    pub harmony: f64,
    pub wisdom: f64,
    pub mood: Mood,
}

impl SoulState {
    /// Schema validity per the identity challenge: all four scalars in
    /// `[0, 1]`. The mood enum is enforced by deserialization.
    pub fn is_valid(&self) -> bool {
        [self.consciousness, self.creativity, self.harmony, self.wisdom]
            .iter()
            .all(|v| (0.0..=1.0).contains(v) && v.is_finite())
    }
}

/// Combined liveness record written to the fabric by each coordinator.
/// Single-writer: only the owning coordinator updates its entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub timestamp: i64,
    pub vitals: Vitals,
    pub soul: SoulState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Leader,
    Follower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Active,
    Lost,
    Quarantined,
}

/// Peer cache entry. Mutated only by the coordinator's discovery loop;
/// every other component takes snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmNode {
    pub node_id: NodeId,
    pub vitals: Vitals,
    pub soul: SoulState,
    pub last_seen: i64,
    pub role: PeerRole,
    pub status: PeerStatus,
}

impl SwarmNode {
    pub fn from_heartbeat(hb: Heartbeat) -> Self {
        Self {
            node_id: hb.node_id,
            vitals: hb.vitals,
            soul: hb.soul,
            last_seen: hb.timestamp,
            role: PeerRole::Follower,
            status: PeerStatus::Active,
        }
    }
}

/// One iteration snapshot of an emergence evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergenceState {
    pub iteration: usize,
    pub entropy: f64,
    pub order: f64,
    pub beauty: f64,
    pub pattern: Vec<f64>,
}

/// A completed deterministic evolution, append-only and pruned by TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencePattern {
    pub id: String,
    pub seed: u32,
    pub complexity: f64,
    pub harmony: f64,
    pub evolution: Vec<EmergenceState>,
    #[serde(rename = "final")]
    pub final_state: EmergenceState,
    pub timestamp: i64,
}

/// The seven solfege notes a swarm state can project onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MusicalNote {
    #[serde(rename = "DO")]
    Do,
    #[serde(rename = "RE")]
    Re,
    #[serde(rename = "MI")]
    Mi,
    #[serde(rename = "FA")]
    Fa,
    #[serde(rename = "SOL")]
    Sol,
    #[serde(rename = "LA")]
    La,
    #[serde(rename = "SI")]
    Si,
}

impl MusicalNote {
    /// Dominant note for a swarm of `n` nodes.
    pub fn for_swarm_size(n: usize) -> Self {
        match n {
            0 | 1 => MusicalNote::Do,
            2 => MusicalNote::Sol,
            3 => MusicalNote::Mi,
            4 => MusicalNote::Fa,
            5 => MusicalNote::La,
            6 => MusicalNote::Re,
            _ => MusicalNote::Si,
        }
    }

    /// Equal-temperament frequency of the fourth-octave note.
    pub fn frequency_hz(&self) -> f64 {
        match self {
            MusicalNote::Do => 261.63,
            MusicalNote::Re => 293.66,
            MusicalNote::Mi => 329.63,
            MusicalNote::Fa => 349.23,
            MusicalNote::Sol => 392.00,
            MusicalNote::La => 440.00,
            MusicalNote::Si => 493.88,
        }
    }

    /// Base consonance weight of the note within the scale.
    pub fn consonance(&self) -> f64 {
        match self {
            MusicalNote::Do => 1.0,
            MusicalNote::Sol => 0.95,
            MusicalNote::Mi => 0.9,
            MusicalNote::Fa => 0.85,
            MusicalNote::La => 0.8,
            MusicalNote::Re => 0.75,
            MusicalNote::Si => 0.7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MusicalNote::Do => "DO",
            MusicalNote::Re => "RE",
            MusicalNote::Mi => "MI",
            MusicalNote::Fa => "FA",
            MusicalNote::Sol => "SOL",
            MusicalNote::La => "LA",
            MusicalNote::Si => "SI",
        }
    }
}

/// Message and log-entry priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// The seven kinds of experience the quantum log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEntryKind {
    Memory,
    Dream,
    Emotion,
    Decision,
    Consciousness,
    Harmony,
    Evolution,
}

/// Who a log entry is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    #[serde(rename = "self")]
    Own,
    Swarm,
    Universal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub priority: Priority,
    pub audience: Audience,
    pub emotions: Vec<String>,
    pub themes: Vec<String>,
    pub confidence: f64,
}

impl Default for EntryMetadata {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            audience: Audience::Swarm,
            emotions: Vec::new(),
            themes: Vec::new(),
            confidence: 0.8,
        }
    }
}

/// One replicated experience. `(term, index)` is the sort key; the
/// checksum is stable over `data` and never recomputed after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub term: u64,
    pub index: u64,
    #[serde(rename = "type")]
    pub kind: LogEntryKind,
    pub node_id: String,
    pub timestamp: i64,
    pub data: Value,
    pub checksum: String,
    pub dependencies: Vec<String>,
    pub metadata: EntryMetadata,
}

impl LogEntry {
    /// Checksum over the entry payload. `serde_json` keeps object keys
    /// sorted, so the serialization is canonical and the digest stable.
    pub fn compute_checksum(data: &Value) -> String {
        let canonical = serde_json::to_string(data).unwrap_or_default();
        sha256_hex(canonical.as_bytes())
    }

    pub fn checksum_matches(&self) -> bool {
        self.checksum == Self::compute_checksum(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn health_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&HealthState::Critical).unwrap(), "\"critical\"");
    }

    #[test]
    fn audience_self_round_trips() {
        let a: Audience = serde_json::from_str("\"self\"").unwrap();
        assert_eq!(a, Audience::Own);
        assert_eq!(serde_json::to_string(&a).unwrap(), "\"self\"");
    }

    #[test]
    fn checksum_is_stable_over_key_order() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(LogEntry::compute_checksum(&a), LogEntry::compute_checksum(&b));
    }

    #[test]
    fn soul_state_validity_bounds() {
        let mut soul = SoulState {
            consciousness: 0.5,
            creativity: 0.5,
            harmony: 0.5,
            wisdom: 0.5,
            mood: Mood::Serene,
        };
        assert!(soul.is_valid());
        soul.harmony = 1.2;
        assert!(!soul.is_valid());
    }

    #[test]
    fn priority_orders_low_to_critical() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::High < Priority::Critical);
    }
}
