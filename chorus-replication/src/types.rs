//! Replication bookkeeping records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationStatus {
    Pending,
    Replicating,
    Replicated,
    Failed,
    Conflicted,
}

/// Per-peer replication progress. One batch may be in flight per peer at
/// a time; the engine holds the state lock across the whole exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationState {
    pub peer: String,
    pub last_replicated_index: u64,
    pub next_index: u64,
    pub match_index: u64,
    pub status: ReplicationStatus,
    pub last_contact: i64,
    pub pending_entry_ids: Vec<String>,
    pub conflicts: Vec<LogConflict>,
}

impl ReplicationState {
    pub fn new(peer: &str) -> Self {
        Self {
            peer: peer.to_string(),
            last_replicated_index: 0,
            next_index: 1,
            match_index: 0,
            status: ReplicationStatus::Pending,
            last_contact: 0,
            pending_entry_ids: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    /// Same entry id, different checksum.
    Content,
    /// Same `(index, term)` slot, different entry id.
    Ordering,
    /// A declared dependency is unknown locally.
    Dependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    KeepLocal,
    Merge,
    RejectBoth,
}

impl ConflictKind {
    /// Policy and confidence fixed per conflict class.
    pub fn policy(&self) -> (ResolutionPolicy, f64) {
        match self {
            ConflictKind::Content => (ResolutionPolicy::KeepLocal, 0.7),
            ConflictKind::Ordering => (ResolutionPolicy::Merge, 0.5),
            ConflictKind::Dependency => (ResolutionPolicy::RejectBoth, 0.8),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConflict {
    pub id: String,
    pub kind: ConflictKind,
    pub local_entry_id: String,
    pub remote_entry_id: String,
    pub policy: ResolutionPolicy,
    pub confidence: f64,
    pub detected_at: i64,
    pub resolved: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policies_are_fixed_per_kind() {
        assert_eq!(ConflictKind::Content.policy(), (ResolutionPolicy::KeepLocal, 0.7));
        assert_eq!(ConflictKind::Ordering.policy(), (ResolutionPolicy::Merge, 0.5));
        assert_eq!(ConflictKind::Dependency.policy(), (ResolutionPolicy::RejectBoth, 0.8));
    }

    #[test]
    fn fresh_state_starts_pending() {
        let state = ReplicationState::new("n2");
        assert_eq!(state.status, ReplicationStatus::Pending);
        assert_eq!(state.next_index, 1);
        assert_eq!(state.match_index, 0);
    }
}
