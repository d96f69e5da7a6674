//! Consensus round records and configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use chorus_core::MusicalNote;

/// Leader name reported when quorum was not reached.
pub const NO_LEADER: &str = "no-leader";

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Maximum wait for vote responses in one round.
    pub vote_collection_timeout: Duration,
    /// How long a finished round's result is served to repeated callers.
    pub cache_ttl: Duration,
    /// Approval-rate gate applied on top of quorum.
    pub consensus_threshold: f64,
    /// An elected candidate below this live health score is replaced by
    /// the best locally-scored node.
    pub min_leader_health: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            vote_collection_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(60),
            consensus_threshold: 0.51,
            min_leader_health: 0.5,
        }
    }
}

/// Phases of one consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Idle,
    CollectingMetrics,
    Voting,
    Tallying,
    Committed,
    ReadOnly,
}

/// Outcome of one round. Always well-formed: degraded states are
/// encoded in the fields, never surfaced as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub consensus_id: String,
    pub leader: String,
    pub is_leader_self: bool,
    pub total_nodes: u32,
    pub consensus_achieved: bool,
    pub quorum_achieved: bool,
    pub quorum_size: u32,
    pub votes_received: u32,
    pub approval_rate: f64,
    pub read_only_mode: bool,
    pub dominant_note: MusicalNote,
    pub frequency_hz: f64,
    pub harmonic_score: f64,
    pub chord_stability: f64,
    pub rationale: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsensusStats {
    pub rounds_run: u64,
    pub cache_hits: u64,
    pub votes_cast: u64,
    pub votes_verified: u64,
    pub votes_discarded: u64,
    pub read_only_rounds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_runtime_contract() {
        let config = ConsensusConfig::default();
        assert_eq!(config.vote_collection_timeout, Duration::from_secs(10));
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert!((config.consensus_threshold - 0.51).abs() < 1e-12);
    }
}
