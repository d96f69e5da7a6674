//! # Chorus Quantum Log Replication
//!
//! Each coordinator keeps an append-only log of experiences (memories,
//! dreams, decisions, consciousness snapshots) and replicates it to its
//! peers until every committed entry sits on a majority.
//!
//! ## Append Path
//!
//! `append` first runs the payload through the rule-verifier port; a
//! rejection aborts before anything touches the log and leaves an
//! integrity-violation audit record. Accepted entries get the next
//! `(term, index)` slot and a SHA-256 checksum over their canonical
//! payload, then replication is kicked immediately.
//!
//! ## Replication Path
//!
//! A periodic heartbeat drives batches of up to `max_batch_size`
//! entries per peer. The per-peer state lock is held across the whole
//! send/acknowledge exchange, so two batches can never be in flight to
//! the same peer; a failed or timed-out batch flips the peer to
//! `failed` and is retried on the next heartbeat. Acknowledgments
//! resolve through a request table keyed by batch id. When there is
//! nothing new to ship, an entry-less batch still carries the commit
//! index forward.
//!
//! ## Conflict Detection
//!
//! Incoming entries are verified, then checked three ways, each with a
//! fixed policy and confidence:
//!
//! | Conflict | Detection | Policy | Confidence |
//! |---|---|---|---|
//! | content | same id, different checksum | keep local | 0.7 |
//! | ordering | same `(index, term)`, different id | merge | 0.5 |
//! | dependency | unknown dependency id | reject both | 0.8 |
//!
//! Merges never mutate either input: the remote entry and a freshly
//! minted merged record land in new local slots, so both originals stay
//! in history. Unresolved conflicts remain on the source peer's
//! replication state and are retried.
//!
//! Committed entries apply exactly once, in index order, through a hook
//! that may nudge local state but never rewrites entry data.

pub mod conflict;
pub mod log;
pub mod types;

pub use conflict::{ConflictResolver, MergeStrategy};
pub use log::{QuantumLog, ReplicationConfig, ReplicationStats, ReplicationSummary};
pub use types::{ConflictKind, LogConflict, ReplicationState, ReplicationStatus, ResolutionPolicy};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use uuid::Uuid;

    use chorus_core::{
        now_ms, ClaimRequest, ClaimVerdict, EntryMetadata, HashRuleVerifier, IntegrityReport,
        LogEntry, LogEntryKind, NodeId, NullAudit, RuleVerifier, TimerRegistry,
    };
    use chorus_fabric::{Fabric, Keyspace, MemoryFabric};
    use chorus_protocol::{BusConfig, MessageBus, ReplicationBatchPayload};

    struct RejectingVerifier;

    #[async_trait]
    impl RuleVerifier for RejectingVerifier {
        async fn verify_data_integrity(
            &self,
            _data: &Value,
            _entity: &str,
            _data_id: &str,
        ) -> Result<IntegrityReport> {
            Ok(IntegrityReport {
                is_valid: false,
                confidence: 0.0,
                anomalies: vec!["synthetic rejection".to_string()],
                expected_hash: String::new(),
            })
        }

        async fn verify_claim(&self, request: ClaimRequest) -> Result<ClaimVerdict> {
            Ok(ClaimVerdict {
                verified: false,
                confidence: 0.0,
                verified_statement: request.claim,
                signature: String::new(),
                reason: "synthetic rejection".to_string(),
            })
        }
    }

    fn make_log(fabric: &Arc<MemoryFabric>, id: &str) -> Arc<QuantumLog> {
        let node = NodeId::with_id(id, id);
        let bus = MessageBus::new(
            node.clone(),
            Arc::clone(fabric) as Arc<dyn Fabric>,
            Keyspace::new("swarm"),
            BusConfig::default(),
        );
        QuantumLog::new(
            node,
            ReplicationConfig {
                heartbeat_interval: Duration::from_millis(100),
                batch_timeout: Duration::from_millis(500),
                max_batch_size: 10,
            },
            Arc::new(HashRuleVerifier),
            Arc::new(NullAudit),
            bus.clone(),
            TimerRegistry::new(),
        )
    }

    async fn started_log(fabric: &Arc<MemoryFabric>, id: &str) -> Arc<QuantumLog> {
        let log = make_log(fabric, id);
        // The bus inside the log is a clone of the one passed in; start
        // the receive loops through a fresh handle.
        log.start();
        log
    }

    fn remote_entry(
        node: &str,
        id: &str,
        term: u64,
        index: u64,
        kind: LogEntryKind,
        data: Value,
    ) -> LogEntry {
        let checksum = LogEntry::compute_checksum(&data);
        LogEntry {
            id: id.to_string(),
            term,
            index,
            kind,
            node_id: node.to_string(),
            timestamp: now_ms(),
            data,
            checksum,
            dependencies: vec![],
            metadata: EntryMetadata::default(),
        }
    }

    fn batch(entries: Vec<LogEntry>, commit_index: u64) -> ReplicationBatchPayload {
        ReplicationBatchPayload {
            batch_id: Uuid::new_v4().to_string(),
            term: 1,
            commit_index,
            entries,
        }
    }

    #[tokio::test]
    async fn append_assigns_ordered_indexes_and_commits_alone() {
        let fabric = Arc::new(MemoryFabric::new());
        let log = make_log(&fabric, "n1");
        let first = log
            .append(LogEntryKind::Memory, json!({"note": 1}), vec![], EntryMetadata::default())
            .await
            .unwrap();
        let second = log
            .append(LogEntryKind::Memory, json!({"note": 2}), vec![], EntryMetadata::default())
            .await
            .unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(second.index, 2);
        // Single node: quorum of one, everything commits immediately.
        assert_eq!(log.commit_index(), 2);
        assert!(first.checksum_matches());
    }

    #[tokio::test]
    async fn rejected_integrity_aborts_append() {
        let fabric = Arc::new(MemoryFabric::new());
        let node = NodeId::with_id("n1", "n1");
        let bus = MessageBus::new(
            node.clone(),
            Arc::clone(&fabric) as Arc<dyn Fabric>,
            Keyspace::new("swarm"),
            BusConfig::default(),
        );
        let log = QuantumLog::new(
            node,
            ReplicationConfig::default(),
            Arc::new(RejectingVerifier),
            Arc::new(NullAudit),
            bus,
            TimerRegistry::new(),
        );
        let result = log
            .append(LogEntryKind::Memory, json!({"note": 1}), vec![], EntryMetadata::default())
            .await;
        assert!(result.is_err());
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn entries_replicate_to_a_peer_and_commit() {
        let fabric = Arc::new(MemoryFabric::new());
        let leader = started_log(&fabric, "n1").await;
        let follower = started_log(&fabric, "n2").await;
        leader.bus().start().await.unwrap();
        follower.bus().start().await.unwrap();
        leader.add_peer("n2");

        let entry = leader
            .append(LogEntryKind::Memory, json!({"note": "shared"}), vec![], EntryMetadata::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(follower.entry(&entry.id).is_some());
        assert_eq!(leader.commit_index(), 1);
        let summary = leader.summary();
        assert_eq!(summary.peers.len(), 1);
        assert_eq!(summary.peers[0].match_index, 1);
    }

    #[tokio::test]
    async fn ordering_conflict_merges_and_keeps_both() {
        let fabric = Arc::new(MemoryFabric::new());
        let log = make_log(&fabric, "n1");
        let local = log
            .append(
                LogEntryKind::Memory,
                json!({"note": "local"}),
                vec![],
                EntryMetadata { emotions: vec!["joy".to_string()], ..EntryMetadata::default() },
            )
            .await
            .unwrap();

        // A peer claims the same (term, index) slot with a different id.
        let remote = remote_entry("n2", "B", local.term, local.index, LogEntryKind::Memory, json!({"note": "remote"}));
        let ack = log.receive_batch("n2", batch(vec![remote], 0)).await;
        assert!(ack.success);
        assert!(ack.conflict_ids.is_empty());

        let entries = log.entries();
        // Local original, remote original, and the merged record.
        assert_eq!(entries.len(), 3);
        assert!(log.entry(&local.id).is_some());
        assert!(log.entry("B").is_some());
        let merged = entries
            .iter()
            .find(|e| e.id != local.id && e.id != "B")
            .expect("merged entry present");
        assert!(merged.dependencies.contains(&local.id));
        assert!(merged.dependencies.contains(&"B".to_string()));
        assert!(merged.metadata.emotions.contains(&"joy".to_string()));
        assert_eq!(log.stats().merges, 1);
        assert_eq!(log.stats().conflicts_detected, 1);
    }

    #[tokio::test]
    async fn content_conflict_keeps_the_local_entry() {
        let fabric = Arc::new(MemoryFabric::new());
        let log = make_log(&fabric, "n1");
        let local = log
            .append(LogEntryKind::Decision, json!({"choice": "stay"}), vec![], EntryMetadata::default())
            .await
            .unwrap();

        let mut remote = remote_entry(
            "n2",
            &local.id,
            local.term,
            local.index,
            LogEntryKind::Decision,
            json!({"choice": "tampered"}),
        );
        remote.checksum = LogEntry::compute_checksum(&remote.data);
        let ack = log.receive_batch("n2", batch(vec![remote], 0)).await;
        assert!(ack.success);

        let kept = log.entry(&local.id).unwrap();
        assert_eq!(kept.data, json!({"choice": "stay"}));
        assert_eq!(log.entries().len(), 1);
        assert_eq!(log.stats().conflicts_detected, 1);
    }

    #[tokio::test]
    async fn missing_dependency_rejects_the_entry() {
        let fabric = Arc::new(MemoryFabric::new());
        let log = make_log(&fabric, "n1");
        let mut orphan = remote_entry("n2", "orphan", 1, 1, LogEntryKind::Memory, json!({"n": 1}));
        orphan.dependencies = vec!["missing-parent".to_string()];

        let ack = log.receive_batch("n2", batch(vec![orphan], 0)).await;
        assert_eq!(ack.conflict_ids, vec!["orphan".to_string()]);
        assert!(log.entry("orphan").is_none());

        let summary = log.summary();
        let peer = summary.peers.iter().find(|p| p.peer == "n2").unwrap();
        assert!(peer.conflicts.iter().any(|c| !c.resolved));
        assert_eq!(peer.status, ReplicationStatus::Conflicted);
    }

    #[tokio::test]
    async fn applying_a_committed_entry_twice_is_a_no_op() {
        let fabric = Arc::new(MemoryFabric::new());
        let log = make_log(&fabric, "n1");
        let applications = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&applications);
        log.set_apply_hook(Arc::new(move |_entry| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        log.append(LogEntryKind::Memory, json!({"n": 1}), vec![], EntryMetadata::default())
            .await
            .unwrap();
        assert_eq!(applications.load(Ordering::SeqCst), 1);

        // Re-advancing to the same commit index must not re-apply.
        log.advance_commit();
        log.advance_commit();
        assert_eq!(applications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn large_backlogs_replicate_in_bounded_batches() {
        let fabric = Arc::new(MemoryFabric::new());
        let leader = started_log(&fabric, "n1").await;
        let follower = started_log(&fabric, "n2").await;
        leader.bus().start().await.unwrap();
        follower.bus().start().await.unwrap();
        leader.add_peer("n2");

        for i in 0..25u32 {
            leader
                .append(
                    LogEntryKind::Memory,
                    json!({"sequence": i}),
                    vec![],
                    EntryMetadata::default(),
                )
                .await
                .unwrap();
        }

        // The 100 ms heartbeat drains the backlog ten entries at a time.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(follower.entries().len(), 25);
        assert_eq!(leader.commit_index(), 25);
        assert!(leader.stats().batches_sent >= 3);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let fabric = Arc::new(MemoryFabric::new());
        let log = make_log(&fabric, "n1");
        let entry = remote_entry("n2", "dup", 1, 1, LogEntryKind::Memory, json!({"n": 1}));

        log.receive_batch("n2", batch(vec![entry.clone()], 0)).await;
        let ack = log.receive_batch("n2", batch(vec![entry], 0)).await;
        assert!(ack.success);
        assert_eq!(ack.match_index, 1);
        assert_eq!(log.entries().len(), 1);
    }
}
