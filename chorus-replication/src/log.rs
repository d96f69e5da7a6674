//! The quantum log: append-ordered, authenticated, majority-committed.
//!
//! Appends verify integrity before anything touches the log. Replication
//! rides the message protocol with a request table keyed by batch id;
//! one batch per peer may be in flight at a time. Incoming entries go
//! through conflict detection, and the commit index advances to the
//! highest index present on a majority.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chorus_core::{
    now_ms, EntryMetadata, LogEntry, LogEntryKind, MutationAudit, NodeId, Priority, RuleVerifier,
    TimerRegistry,
};
use chorus_protocol::{
    MessageBus, MessagePayload, MessageType, ReplicationAckPayload, ReplicationBatchPayload,
};

use crate::conflict::ConflictResolver;
use crate::types::{ConflictKind, LogConflict, ReplicationState, ReplicationStatus};

const HEARTBEAT_TIMER_ID: &str = "replication-heartbeat";

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Period of the retry heartbeat that drives pending/failed peers.
    pub heartbeat_interval: Duration,
    /// Per-batch deadline covering send plus acknowledgment.
    pub batch_timeout: Duration,
    pub max_batch_size: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(5),
            max_batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicationStats {
    pub appends: u64,
    pub ingested: u64,
    pub batches_sent: u64,
    pub batches_acked: u64,
    pub batches_failed: u64,
    pub conflicts_detected: u64,
    pub merges: u64,
    pub entries_applied: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationSummary {
    pub entries: usize,
    pub term: u64,
    pub commit_index: u64,
    pub peers: Vec<ReplicationState>,
    pub stats: ReplicationStats,
}

#[derive(Default)]
struct LogStore {
    entries: Vec<LogEntry>,
    by_id: HashMap<String, usize>,
    slots: HashMap<(u64, u64), String>,
}

impl LogStore {
    fn push(&mut self, entry: LogEntry) {
        self.by_id.insert(entry.id.clone(), self.entries.len());
        self.slots.insert((entry.term, entry.index), entry.id.clone());
        self.entries.push(entry);
    }

    fn get(&self, id: &str) -> Option<&LogEntry> {
        self.by_id.get(id).map(|i| &self.entries[*i])
    }

    fn slot_occupant(&self, term: u64, index: u64) -> Option<&String> {
        self.slots.get(&(term, index))
    }

    fn max_index(&self) -> u64 {
        self.entries.iter().map(|e| e.index).max().unwrap_or(0)
    }
}

struct PeerSlot {
    state: tokio::sync::Mutex<ReplicationState>,
    match_index: AtomicU64,
}

enum Ingest {
    Accepted(u64),
    AlreadyPresent(u64),
    Rejected(String),
}

/// Per-coordinator replicated log of experiences.
pub struct QuantumLog {
    me: Weak<QuantumLog>,
    node: NodeId,
    config: ReplicationConfig,
    verifier: Arc<dyn RuleVerifier>,
    audit: Arc<dyn MutationAudit>,
    bus: MessageBus,
    timers: TimerRegistry,
    resolver: ConflictResolver,
    store: RwLock<LogStore>,
    term: AtomicU64,
    next_index: AtomicU64,
    commit_index: AtomicU64,
    peers: DashMap<String, Arc<PeerSlot>>,
    pending_acks: Arc<DashMap<String, oneshot::Sender<ReplicationAckPayload>>>,
    applied: Mutex<HashSet<String>>,
    apply_hook: RwLock<Option<Arc<dyn Fn(&LogEntry) + Send + Sync>>>,
    appends: AtomicU64,
    ingested: AtomicU64,
    batches_sent: AtomicU64,
    batches_acked: AtomicU64,
    batches_failed: AtomicU64,
    conflicts_detected: AtomicU64,
    merges: AtomicU64,
    entries_applied: AtomicU64,
}

impl QuantumLog {
    pub fn new(
        node: NodeId,
        config: ReplicationConfig,
        verifier: Arc<dyn RuleVerifier>,
        audit: Arc<dyn MutationAudit>,
        bus: MessageBus,
        timers: TimerRegistry,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node,
            config,
            verifier,
            audit,
            bus,
            timers,
            resolver: ConflictResolver::new(),
            store: RwLock::new(LogStore::default()),
            term: AtomicU64::new(1),
            next_index: AtomicU64::new(1),
            commit_index: AtomicU64::new(0),
            peers: DashMap::new(),
            pending_acks: Arc::new(DashMap::new()),
            applied: Mutex::new(HashSet::new()),
            apply_hook: RwLock::new(None),
            appends: AtomicU64::new(0),
            ingested: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            batches_acked: AtomicU64::new(0),
            batches_failed: AtomicU64::new(0),
            conflicts_detected: AtomicU64::new(0),
            merges: AtomicU64::new(0),
            entries_applied: AtomicU64::new(0),
        })
    }

    /// Register bus handlers and the replication heartbeat.
    pub fn start(&self) {
        let Some(log) = self.me.upgrade() else {
            return;
        };
        self.bus.register_fn(MessageType::ReplicationBatch, move |message| {
            let log = Arc::clone(&log);
            async move {
                if let MessagePayload::ReplicationBatch(batch) = message.payload {
                    let source = message.source.id.clone();
                    let ack = log.receive_batch(&source, batch).await;
                    log.bus
                        .send(&source, MessagePayload::ReplicationAck(ack), Priority::High)
                        .await?;
                }
                Ok(())
            }
        });

        let pending = Arc::clone(&self.pending_acks);
        self.bus.register_fn(MessageType::ReplicationAck, move |message| {
            let pending = Arc::clone(&pending);
            async move {
                if let MessagePayload::ReplicationAck(ack) = message.payload {
                    if let Some((_, sender)) = pending.remove(&ack.batch_id) {
                        let _ = sender.send(ack);
                    }
                }
                Ok(())
            }
        });

        let Some(log) = self.me.upgrade() else {
            return;
        };
        self.timers.set_interval(
            Some(HEARTBEAT_TIMER_ID),
            self.config.heartbeat_interval,
            move || {
                let log = Arc::clone(&log);
                async move {
                    log.replicate_all();
                }
            },
        );
        info!(node = %self.node.id, "quantum log replication started");
    }

    pub fn stop(&self) {
        self.timers.clear(HEARTBEAT_TIMER_ID);
        self.pending_acks.clear();
    }

    /// The bus this log replicates over.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Hook invoked once per committed entry, in index order. Side
    /// effects must never mutate entry data.
    pub fn set_apply_hook(&self, hook: Arc<dyn Fn(&LogEntry) + Send + Sync>) {
        *self.apply_hook.write() = Some(hook);
    }

    pub fn add_peer(&self, peer_id: &str) {
        if peer_id == self.node.id {
            return;
        }
        self.peers.entry(peer_id.to_string()).or_insert_with(|| {
            Arc::new(PeerSlot {
                state: tokio::sync::Mutex::new(ReplicationState::new(peer_id)),
                match_index: AtomicU64::new(0),
            })
        });
    }

    pub fn remove_peer(&self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    /// Append a new experience. Integrity verification gates the append;
    /// a rejection leaves the log untouched and records the violation.
    pub async fn append(
        &self,
        kind: LogEntryKind,
        data: Value,
        dependencies: Vec<String>,
        metadata: EntryMetadata,
    ) -> Result<LogEntry> {
        let id = Uuid::new_v4().to_string();
        let report = self
            .verifier
            .verify_data_integrity(&data, &self.node.id, &id)
            .await?;
        if !report.is_valid {
            if let Err(error) = self
                .audit
                .log_integrity_violation("log-entry", &id, json!({ "anomalies": report.anomalies }))
                .await
            {
                warn!(%error, "integrity-violation audit failed");
            }
            bail!("integrity verification rejected log entry {id}");
        }

        let checksum = LogEntry::compute_checksum(&data);
        let entry = {
            let mut store = self.store.write();
            let entry = LogEntry {
                id,
                term: self.term.load(Ordering::SeqCst),
                index: self.next_index.fetch_add(1, Ordering::SeqCst),
                kind,
                node_id: self.node.id.clone(),
                timestamp: now_ms(),
                data,
                checksum,
                dependencies,
                metadata,
            };
            store.push(entry.clone());
            entry
        };

        self.appends.fetch_add(1, Ordering::Relaxed);
        if let Err(error) = self
            .audit
            .log_create("log-entry", &entry.id, json!({ "kind": entry.kind, "index": entry.index }))
            .await
        {
            debug!(%error, "append audit failed");
        }

        self.advance_commit();
        self.replicate_all();
        Ok(entry)
    }

    /// Kick a batch toward every peer that is not already mid-batch.
    pub fn replicate_all(&self) {
        let Some(log) = self.me.upgrade() else {
            return;
        };
        for entry in self.peers.iter() {
            let log = Arc::clone(&log);
            let peer = entry.key().clone();
            tokio::spawn(async move {
                log.replicate_to_peer(&peer).await;
            });
        }
    }

    /// Send one batch to a peer. The state lock is held across the whole
    /// exchange, so two batches can never be in flight to the same peer.
    async fn replicate_to_peer(&self, peer: &str) {
        let Some(slot) = self.peers.get(peer).map(|s| Arc::clone(&s)) else {
            return;
        };
        let Ok(mut state) = slot.state.try_lock() else {
            // A batch is already in flight.
            return;
        };

        let batch: Vec<LogEntry> = {
            let store = self.store.read();
            let mut pending: Vec<LogEntry> = store
                .entries
                .iter()
                .filter(|e| e.index >= state.next_index)
                .cloned()
                .collect();
            pending.sort_by_key(|e| e.index);
            pending.truncate(self.config.max_batch_size);
            pending
        };
        if batch.is_empty() {
            if state.status != ReplicationStatus::Conflicted {
                state.status = ReplicationStatus::Replicated;
            }
            // Nothing new to ship, but peers still need to learn the
            // commit index; an empty batch is the commit heartbeat.
            if self.commit_index.load(Ordering::SeqCst) > 0 {
                self.send_commit_heartbeat(&mut state, peer).await;
            }
            return;
        }

        state.status = ReplicationStatus::Replicating;
        state.pending_entry_ids = batch.iter().map(|e| e.id.clone()).collect();

        let batch_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending_acks.insert(batch_id.clone(), sender);

        let payload = MessagePayload::ReplicationBatch(ReplicationBatchPayload {
            batch_id: batch_id.clone(),
            term: self.term.load(Ordering::SeqCst),
            commit_index: self.commit_index.load(Ordering::SeqCst),
            entries: batch.clone(),
        });
        self.batches_sent.fetch_add(1, Ordering::Relaxed);

        let send = self
            .bus
            .send_with_ttl(peer, payload, Priority::High, self.config.batch_timeout)
            .await;
        if let Err(error) = send {
            warn!(peer, %error, "replication batch send failed");
            self.pending_acks.remove(&batch_id);
            self.fail_batch(&mut state);
            return;
        }

        match tokio::time::timeout(self.config.batch_timeout, receiver).await {
            Ok(Ok(ack)) if ack.success => {
                state.last_replicated_index = ack.match_index;
                state.match_index = ack.match_index;
                state.next_index = ack.match_index + 1;
                state.status = if ack.conflict_ids.is_empty() {
                    ReplicationStatus::Replicated
                } else {
                    ReplicationStatus::Conflicted
                };
                state.last_contact = now_ms();
                state.pending_entry_ids.clear();
                slot.match_index.store(ack.match_index, Ordering::SeqCst);
                self.batches_acked.fetch_add(1, Ordering::Relaxed);
                debug!(peer, match_index = ack.match_index, "replication batch acknowledged");
                drop(state);
                self.advance_commit();
            }
            Ok(Ok(ack)) => {
                warn!(peer, detail = ?ack.detail, "replication batch rejected");
                self.fail_batch(&mut state);
            }
            _ => {
                // Timed out or the ack channel dropped; retried by the
                // next heartbeat.
                self.pending_acks.remove(&batch_id);
                self.fail_batch(&mut state);
            }
        }
    }

    fn fail_batch(&self, state: &mut ReplicationState) {
        state.status = ReplicationStatus::Failed;
        state.pending_entry_ids.clear();
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Entry-less batch that only carries the commit index. The ack's
    /// match index is ignored; only contact time is refreshed.
    async fn send_commit_heartbeat(&self, state: &mut ReplicationState, peer: &str) {
        let batch_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending_acks.insert(batch_id.clone(), sender);

        let payload = MessagePayload::ReplicationBatch(ReplicationBatchPayload {
            batch_id: batch_id.clone(),
            term: self.term.load(Ordering::SeqCst),
            commit_index: self.commit_index.load(Ordering::SeqCst),
            entries: Vec::new(),
        });
        if self
            .bus
            .send_with_ttl(peer, payload, Priority::Normal, self.config.batch_timeout)
            .await
            .is_err()
        {
            self.pending_acks.remove(&batch_id);
            return;
        }
        match tokio::time::timeout(self.config.batch_timeout, receiver).await {
            Ok(Ok(_ack)) => {
                state.last_contact = now_ms();
            }
            _ => {
                self.pending_acks.remove(&batch_id);
            }
        }
    }

    /// Ingest a batch from a peer and build the acknowledgment.
    pub async fn receive_batch(
        &self,
        source: &str,
        batch: ReplicationBatchPayload,
    ) -> ReplicationAckPayload {
        let mut entries = batch.entries;
        entries.sort_by_key(|e| e.index);
        let batch_ids: HashSet<String> = entries.iter().map(|e| e.id.clone()).collect();

        let mut conflict_ids = Vec::new();
        let mut match_index = 0u64;
        let mut blocked = false;

        for entry in entries {
            match self.ingest_entry(source, entry, &batch_ids).await {
                Ingest::Accepted(i) | Ingest::AlreadyPresent(i) => {
                    if !blocked {
                        match_index = match_index.max(i);
                    }
                }
                Ingest::Rejected(id) => {
                    conflict_ids.push(id);
                    blocked = true;
                }
            }
        }

        // The sender's commit index caps what we may apply.
        let local_max = self.store.read().max_index();
        self.apply_committed(batch.commit_index.min(local_max));

        ReplicationAckPayload {
            batch_id: batch.batch_id,
            success: true,
            match_index,
            conflict_ids,
            detail: None,
        }
    }

    async fn ingest_entry(
        &self,
        source: &str,
        entry: LogEntry,
        batch_ids: &HashSet<String>,
    ) -> Ingest {
        // Integrity first; nothing unverified touches the log.
        let verified = match self
            .verifier
            .verify_data_integrity(&entry.data, &entry.node_id, &entry.id)
            .await
        {
            Ok(report) => report.is_valid && entry.checksum_matches(),
            Err(error) => {
                warn!(%error, entry = %entry.id, "integrity verification errored");
                false
            }
        };
        if !verified {
            if let Err(error) = self
                .audit
                .log_integrity_violation("log-entry", &entry.id, json!({ "source": source }))
                .await
            {
                warn!(%error, "integrity-violation audit failed");
            }
            return Ingest::Rejected(entry.id);
        }

        // Duplicate id: identical checksum is an idempotent re-delivery,
        // a differing checksum is a content conflict resolved by keeping
        // our committed entry.
        let duplicate = {
            let store = self.store.read();
            store.get(&entry.id).map(|local| (local.checksum.clone(), local.index, local.id.clone()))
        };
        if let Some((local_checksum, local_index, local_id)) = duplicate {
            if local_checksum == entry.checksum {
                return Ingest::AlreadyPresent(local_index);
            }
            let conflict = self.make_conflict(ConflictKind::Content, &local_id, &entry.id, true);
            self.push_conflict(source, conflict).await;
            return Ingest::Accepted(local_index);
        }

        // Unknown dependency: reject both sides of the exchange for this
        // entry; the sender retries once the dependency arrives.
        for dependency in &entry.dependencies {
            let known = self.store.read().get(dependency).is_some() || batch_ids.contains(dependency);
            if !known {
                let conflict = self.make_conflict(ConflictKind::Dependency, dependency, &entry.id, false);
                self.push_conflict(source, conflict).await;
                return Ingest::Rejected(entry.id);
            }
        }

        // Same (index, term), different id: ordering conflict, resolved
        // by merging. Both originals remain in history; the remote entry
        // and the merged record land in fresh local slots.
        let occupant = self
            .store
            .read()
            .slot_occupant(entry.term, entry.index)
            .cloned();
        if let Some(occupant_id) = occupant.filter(|id| *id != entry.id) {
            // Clone out of the read guard before taking the write lock.
            let local = self.store.read().get(&occupant_id).cloned();
            if let Some(local) = local {
                let merged = self.resolver.merge(&local, &entry);
                let conflict = self.make_conflict(ConflictKind::Ordering, &occupant_id, &entry.id, true);
                self.push_conflict(source, conflict).await;

                let accepted_index = entry.index;
                let mut store = self.store.write();
                let mut remote = entry;
                remote.index = self.next_index.fetch_add(1, Ordering::SeqCst);
                store.push(remote);

                match merged {
                    Ok(Some(mut merged)) => {
                        merged.index = self.next_index.fetch_add(1, Ordering::SeqCst);
                        store.push(merged);
                        self.merges.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(None) => {
                        debug!(kind = ?local.kind, "no merge strategy, keeping local entry");
                    }
                    Err(error) => {
                        warn!(%error, "merge failed, keeping local entry");
                    }
                }
                self.ingested.fetch_add(1, Ordering::Relaxed);
                return Ingest::Accepted(accepted_index);
            }
        }

        // Plain append.
        {
            let mut store = self.store.write();
            let index = entry.index;
            store.push(entry);
            self.ingested.fetch_add(1, Ordering::Relaxed);
            // Keep local allocation ahead of every index we have seen.
            let mut next = self.next_index.load(Ordering::SeqCst);
            while next <= index {
                match self.next_index.compare_exchange(
                    next,
                    index + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(current) => next = current,
                }
            }
            Ingest::Accepted(index)
        }
    }

    fn make_conflict(
        &self,
        kind: ConflictKind,
        local_id: &str,
        remote_id: &str,
        resolved: bool,
    ) -> LogConflict {
        self.conflicts_detected.fetch_add(1, Ordering::Relaxed);
        let (policy, confidence) = kind.policy();
        LogConflict {
            id: Uuid::new_v4().to_string(),
            kind,
            local_entry_id: local_id.to_string(),
            remote_entry_id: remote_id.to_string(),
            policy,
            confidence,
            detected_at: now_ms(),
            resolved,
        }
    }

    /// Conflicts are tracked on the replication state for the source
    /// peer; unresolved ones stay there until a later batch clears them.
    async fn push_conflict(&self, source: &str, conflict: LogConflict) {
        self.add_peer(source);
        // The map guard must not be held across the await below.
        let slot = self.peers.get(source).map(|s| Arc::clone(&s));
        if let Some(slot) = slot {
            let mut state = slot.state.lock().await;
            state.conflicts.push(conflict);
            if state.conflicts.iter().any(|c| !c.resolved) {
                state.status = ReplicationStatus::Conflicted;
            }
        }
    }

    /// Advance the commit index to the highest index present on a
    /// majority, then apply newly committed entries.
    pub fn advance_commit(&self) {
        let n = self.peers.len() + 1;
        let quorum = n / 2 + 1;
        let max_index = self.store.read().max_index();

        let mut commit = self.commit_index.load(Ordering::SeqCst);
        for index in (commit + 1)..=max_index {
            let replicas = 1 + self
                .peers
                .iter()
                .filter(|slot| slot.match_index.load(Ordering::SeqCst) >= index)
                .count();
            if replicas >= quorum {
                commit = index;
            } else {
                break;
            }
        }
        self.apply_committed(commit);
    }

    /// Raise the commit index (monotonic) and apply entries up to it, in
    /// index order, exactly once each.
    fn apply_committed(&self, target: u64) {
        let previous = self.commit_index.load(Ordering::SeqCst);
        if target <= previous {
            return;
        }
        self.commit_index.store(target, Ordering::SeqCst);

        let mut committed: Vec<LogEntry> = {
            let store = self.store.read();
            store
                .entries
                .iter()
                .filter(|e| e.index <= target)
                .cloned()
                .collect()
        };
        committed.sort_by_key(|e| e.index);

        let hook = self.apply_hook.read().clone();
        for entry in committed {
            let fresh = self.applied.lock().insert(entry.id.clone());
            if !fresh {
                continue;
            }
            self.entries_applied.fetch_add(1, Ordering::Relaxed);
            if let Some(hook) = &hook {
                hook(&entry);
            }
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        let mut entries = self.store.read().entries.clone();
        entries.sort_by_key(|e| (e.term, e.index));
        entries
    }

    pub fn entry(&self, id: &str) -> Option<LogEntry> {
        self.store.read().get(id).cloned()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    pub fn current_term(&self) -> u64 {
        self.term.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            appends: self.appends.load(Ordering::Relaxed),
            ingested: self.ingested.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_acked: self.batches_acked.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            conflicts_detected: self.conflicts_detected.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            entries_applied: self.entries_applied.load(Ordering::Relaxed),
        }
    }

    pub fn summary(&self) -> ReplicationSummary {
        let peers = self
            .peers
            .iter()
            .map(|slot| match slot.state.try_lock() {
                Ok(state) => state.clone(),
                Err(_) => {
                    // Batch in flight; report what the atomics know.
                    let mut state = ReplicationState::new(slot.key());
                    state.status = ReplicationStatus::Replicating;
                    state.match_index = slot.match_index.load(Ordering::SeqCst);
                    state
                }
            })
            .collect();
        ReplicationSummary {
            entries: self.store.read().entries.len(),
            term: self.current_term(),
            commit_index: self.commit_index(),
            peers,
            stats: self.stats(),
        }
    }
}
