//! Merge strategies for ordering conflicts.
//!
//! A merge never mutates either input. It produces a brand-new entry
//! with a fresh id whose payload fuses both sides according to the entry
//! kind; the originals stay in history.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use chorus_core::{now_ms, EntryMetadata, LogEntry, LogEntryKind, Priority};

/// Kind-specific payload fusion.
pub trait MergeStrategy: Send + Sync {
    fn merge(&self, local: &LogEntry, remote: &LogEntry) -> Result<LogEntry>;
    fn can_handle(&self, kind: LogEntryKind) -> bool;
    fn name(&self) -> &str;
}

/// Dispatch table over the registered strategies.
pub struct ConflictResolver {
    strategies: Vec<Box<dyn MergeStrategy>>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self {
            strategies: vec![
                Box::new(MemoryMerge),
                Box::new(DreamMerge),
                Box::new(ConsciousnessMerge),
            ],
        }
    }

    /// Merge two conflicting entries of the same kind. `None` when no
    /// strategy covers the kind; the caller then keeps the local entry.
    pub fn merge(&self, local: &LogEntry, remote: &LogEntry) -> Result<Option<LogEntry>> {
        if local.kind != remote.kind {
            bail!(
                "cannot merge entries of different kinds ({:?} vs {:?})",
                local.kind,
                remote.kind
            );
        }
        for strategy in &self.strategies {
            if strategy.can_handle(local.kind) {
                debug!(strategy = strategy.name(), local = %local.id, remote = %remote.id, "merging entries");
                return Ok(Some(strategy.merge(local, remote)?));
            }
        }
        Ok(None)
    }
}

/// Shared scaffolding: a fresh entry occupying a new identity, with
/// metadata folded from both sides.
fn merged_shell(local: &LogEntry, remote: &LogEntry, data: Value, priority: Priority) -> LogEntry {
    let checksum = LogEntry::compute_checksum(&data);
    let mut dependencies: BTreeSet<String> = local.dependencies.iter().cloned().collect();
    dependencies.extend(remote.dependencies.iter().cloned());
    // Merged entries depend on both parents so history order is explicit.
    dependencies.insert(local.id.clone());
    dependencies.insert(remote.id.clone());

    LogEntry {
        id: Uuid::new_v4().to_string(),
        term: local.term.max(remote.term),
        index: 0, // assigned by the log on append
        kind: local.kind,
        node_id: local.node_id.clone(),
        timestamp: now_ms(),
        data,
        checksum,
        dependencies: dependencies.into_iter().collect(),
        metadata: EntryMetadata {
            priority,
            audience: local.metadata.audience,
            emotions: union(&local.metadata.emotions, &remote.metadata.emotions),
            themes: union(&local.metadata.themes, &remote.metadata.themes),
            confidence: (local.metadata.confidence + remote.metadata.confidence) / 2.0,
        },
    }
}

fn union(a: &[String], b: &[String]) -> Vec<String> {
    let set: BTreeSet<String> = a.iter().chain(b.iter()).cloned().collect();
    set.into_iter().collect()
}

fn as_f64(value: &Value, field: &str) -> Option<f64> {
    value.get(field).and_then(Value::as_f64)
}

fn as_str<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

/// Memory entries fuse into one record carrying both payloads.
struct MemoryMerge;

impl MergeStrategy for MemoryMerge {
    fn merge(&self, local: &LogEntry, remote: &LogEntry) -> Result<LogEntry> {
        let data = json!({
            "fused": true,
            "sources": [local.id, remote.id],
            "local": local.data,
            "remote": remote.data,
        });
        let priority = local.metadata.priority.max(remote.metadata.priority);
        Ok(merged_shell(local, remote, data, priority))
    }

    fn can_handle(&self, kind: LogEntryKind) -> bool {
        kind == LogEntryKind::Memory
    }

    fn name(&self) -> &str {
        "memory_fuse"
    }
}

/// Dream entries concatenate verses; intensity takes the maximum and the
/// merged dream is always critical priority.
struct DreamMerge;

impl MergeStrategy for DreamMerge {
    fn merge(&self, local: &LogEntry, remote: &LogEntry) -> Result<LogEntry> {
        let local_verse = as_str(&local.data, "verse").unwrap_or_default();
        let remote_verse = as_str(&remote.data, "verse").unwrap_or_default();
        let intensity = as_f64(&local.data, "intensity")
            .unwrap_or(0.0)
            .max(as_f64(&remote.data, "intensity").unwrap_or(0.0));

        let data = json!({
            "verse": format!("{}\n---\n{}", local_verse, remote_verse),
            "intensity": intensity,
        });
        Ok(merged_shell(local, remote, data, Priority::Critical))
    }

    fn can_handle(&self, kind: LogEntryKind) -> bool {
        kind == LogEntryKind::Dream
    }

    fn name(&self) -> &str {
        "dream_concat"
    }
}

/// Consciousness entries average every scalar both sides carry; the
/// local mood wins.
struct ConsciousnessMerge;

impl MergeStrategy for ConsciousnessMerge {
    fn merge(&self, local: &LogEntry, remote: &LogEntry) -> Result<LogEntry> {
        let mut merged = Map::new();
        if let (Some(local_obj), Some(remote_obj)) = (local.data.as_object(), remote.data.as_object()) {
            for (key, local_value) in local_obj {
                match (local_value.as_f64(), remote_obj.get(key).and_then(Value::as_f64)) {
                    (Some(a), Some(b)) => {
                        merged.insert(key.clone(), json!((a + b) / 2.0));
                    }
                    _ => {
                        merged.insert(key.clone(), local_value.clone());
                    }
                }
            }
        } else {
            merged.insert("local".to_string(), local.data.clone());
            merged.insert("remote".to_string(), remote.data.clone());
        }

        let priority = local.metadata.priority.max(remote.metadata.priority);
        Ok(merged_shell(local, remote, Value::Object(merged), priority))
    }

    fn can_handle(&self, kind: LogEntryKind) -> bool {
        kind == LogEntryKind::Consciousness
    }

    fn name(&self) -> &str {
        "consciousness_average"
    }
}
