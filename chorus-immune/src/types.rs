//! Threat and defense records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    NetworkAnomaly,
    ConsensusManipulation,
    ResourceAbuse,
    DataCorruption,
    IdentitySpoofing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatSeverity {
    /// Fixed cutoffs from a normalized threat level. Only meaningful for
    /// levels above the detection threshold.
    pub fn from_level(level: f64) -> Self {
        if level >= 0.9 {
            ThreatSeverity::Critical
        } else if level >= 0.8 {
            ThreatSeverity::High
        } else if level >= 0.7 {
            ThreatSeverity::Medium
        } else {
            ThreatSeverity::Low
        }
    }
}

/// One observable trait of an anomaly class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehavioralMarker {
    pub indicator: String,
    pub weight: f64,
}

/// A recognized anomaly class, accumulated over repeated sightings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatSignature {
    pub id: String,
    pub category: ThreatCategory,
    pub markers: Vec<BehavioralMarker>,
    pub severity: ThreatSeverity,
    pub first_seen: i64,
    pub last_seen: i64,
    pub occurrences: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedThreat {
    pub id: String,
    pub category: ThreatCategory,
    pub severity: ThreatSeverity,
    pub threat_level: f64,
    pub indicators: Vec<String>,
    /// Offending entity, when one can be named.
    pub source: Option<String>,
    pub detected_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseAction {
    Observation,
    Adaptation,
    Neutralization,
    Isolation,
}

impl ResponseAction {
    pub fn for_severity(severity: ThreatSeverity) -> Self {
        match severity {
            ThreatSeverity::Critical => ResponseAction::Isolation,
            ThreatSeverity::High => ResponseAction::Neutralization,
            ThreatSeverity::Medium => ResponseAction::Adaptation,
            ThreatSeverity::Low => ResponseAction::Observation,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImmuneResponse {
    pub id: String,
    pub threat_id: String,
    pub action: ResponseAction,
    pub success: bool,
    pub applied_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationRecord {
    pub threat_id: String,
    pub effectiveness_delta: f64,
    pub recorded_at: i64,
}

/// Remembered past encounter: which markers were seen and what worked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImmuneMemory {
    pub id: String,
    pub markers: Vec<BehavioralMarker>,
    pub response: ImmuneResponse,
    pub effectiveness: f64,
    pub adaptation_history: Vec<AdaptationRecord>,
}

/// An isolated entity. Readable, but excluded from consensus and
/// replication until released.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineZone {
    pub id: String,
    pub entity: String,
    pub reason: String,
    pub created_at: i64,
    pub release_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefenseKind {
    Preventive,
    Reactive,
    Adaptive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefenseAction {
    Block,
    Redirect,
    Transform,
    Analyze,
    Quarantine,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationCondition {
    Threshold { level: f64 },
    Pattern { marker: String },
    Frequency { count: u32, window_ms: u64 },
    Correlation { indicators: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefenseMechanism {
    pub kind: DefenseKind,
    pub action: DefenseAction,
}

/// A defense that tunes its own effectiveness as it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveDefense {
    pub id: String,
    pub name: String,
    pub condition: ActivationCondition,
    pub mechanism: DefenseMechanism,
    pub learning_rate: f64,
    pub effectiveness: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_cutoffs() {
        assert_eq!(ThreatSeverity::from_level(0.95), ThreatSeverity::Critical);
        assert_eq!(ThreatSeverity::from_level(0.85), ThreatSeverity::High);
        assert_eq!(ThreatSeverity::from_level(0.75), ThreatSeverity::Medium);
        assert_eq!(ThreatSeverity::from_level(0.65), ThreatSeverity::Low);
    }

    #[test]
    fn responses_match_severity() {
        assert_eq!(
            ResponseAction::for_severity(ThreatSeverity::Critical),
            ResponseAction::Isolation
        );
        assert_eq!(
            ResponseAction::for_severity(ThreatSeverity::Low),
            ResponseAction::Observation
        );
    }

    #[test]
    fn activation_condition_is_tagged_on_the_wire() {
        let condition = ActivationCondition::Threshold { level: 0.8 };
        let json = serde_json::to_string(&condition).unwrap();
        assert!(json.contains("\"kind\":\"threshold\""));
    }
}
