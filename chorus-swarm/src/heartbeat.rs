//! Vitals publishing and the combined heartbeat.
//!
//! Two records go out per beat: the expiring `<prefix>:vitals:<nodeId>`
//! key and the richer heartbeat hash entry used for discovery. Both are
//! staged in a small write-behind buffer and flushed together, so one
//! beat costs one round of fabric writes instead of two.
//!
//! Per-node heartbeat timestamps are monotonic: a beat never carries a
//! timestamp at or below its predecessor's.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use chorus_core::{now_ms, DigitalSoul, Heartbeat, NodeId, TimerRegistry, VitalsSource};
use chorus_fabric::{Fabric, Keyspace};

const BEAT_TIMER_ID: &str = "heartbeat";

/// Buffered fabric write.
enum WriteOp {
    Set { key: String, value: Value, ttl: Duration },
    HashSet { key: String, field: String, value: Value },
}

/// Write-behind staging area. Flushes when the op count reaches the
/// threshold; the owning service also flushes at the end of every beat.
struct WriteBuffer {
    ops: Mutex<Vec<WriteOp>>,
    flush_threshold: usize,
}

impl WriteBuffer {
    fn new(flush_threshold: usize) -> Self {
        Self { ops: Mutex::new(Vec::new()), flush_threshold }
    }

    /// Stage an op; returns whether the threshold was reached.
    fn push(&self, op: WriteOp) -> bool {
        let mut ops = self.ops.lock();
        ops.push(op);
        ops.len() >= self.flush_threshold
    }

    async fn flush(&self, fabric: &Arc<dyn Fabric>) -> Result<()> {
        let ops: Vec<WriteOp> = std::mem::take(&mut *self.ops.lock());
        for op in ops {
            match op {
                WriteOp::Set { key, value, ttl } => {
                    fabric.set_value(&key, value, Some(ttl)).await?;
                }
                WriteOp::HashSet { key, field, value } => {
                    fabric.hash_set(&key, &field, value).await?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HeartbeatStats {
    pub beats: u64,
    pub write_failures: u64,
    pub last_timestamp: i64,
}

/// Periodic writer of this coordinator's vitals and heartbeat.
pub struct HeartbeatService {
    me: Weak<HeartbeatService>,
    node: NodeId,
    keys: Keyspace,
    fabric: Arc<dyn Fabric>,
    vitals: Arc<VitalsSource>,
    soul: Arc<DigitalSoul>,
    timers: TimerRegistry,
    interval: Duration,
    buffer: WriteBuffer,
    last_timestamp: AtomicI64,
    beats: AtomicU64,
    write_failures: AtomicU64,
}

impl HeartbeatService {
    pub fn new(
        node: NodeId,
        keys: Keyspace,
        fabric: Arc<dyn Fabric>,
        vitals: Arc<VitalsSource>,
        soul: Arc<DigitalSoul>,
        timers: TimerRegistry,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node,
            keys,
            fabric,
            vitals,
            soul,
            timers,
            interval,
            buffer: WriteBuffer::new(4),
            last_timestamp: AtomicI64::new(0),
            beats: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        })
    }

    /// Register the beat timer. The first beat is written immediately so
    /// the coordinator is discoverable before the first full period.
    pub async fn start(&self) {
        self.beat().await;
        let Some(service) = self.me.upgrade() else {
            return;
        };
        self.timers.set_interval(Some(BEAT_TIMER_ID), self.interval, move || {
            let service = Arc::clone(&service);
            async move {
                service.beat().await;
            }
        });
    }

    /// One beat: tick the soul, snapshot vitals, stage both writes, and
    /// flush.
    pub async fn beat(&self) {
        self.soul.tick();
        let timestamp = self.monotonic_timestamp();
        let vitals = self.vitals.snapshot();
        let soul = self.soul.state();

        let heartbeat = Heartbeat {
            node_id: self.node.clone(),
            timestamp,
            vitals: vitals.clone(),
            soul,
        };

        let encoded = match serde_json::to_value(&heartbeat) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "heartbeat serialization failed");
                return;
            }
        };

        self.buffer.push(WriteOp::Set {
            key: self.keys.vitals(&self.node.id),
            value: json!({ "vitals": vitals, "timestamp": timestamp }),
            ttl: self.interval * 3,
        });
        self.buffer.push(WriteOp::HashSet {
            key: self.keys.heartbeat_hash(),
            field: self.node.id.clone(),
            value: encoded,
        });

        // Every beat flushes the staged pair; the size threshold covers
        // callers staging extra writes between beats.
        if let Err(error) = self.buffer.flush(&self.fabric).await {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            warn!(%error, "heartbeat flush failed, retrying next beat");
            return;
        }

        self.beats.fetch_add(1, Ordering::Relaxed);
        debug!(node = %self.node.id, timestamp, "heartbeat written");
    }

    /// Remove this coordinator's presence from the fabric.
    pub async fn deregister(&self) {
        self.timers.clear(BEAT_TIMER_ID);
        if let Err(error) = self.fabric.delete_value(&self.keys.vitals(&self.node.id)).await {
            warn!(%error, "vitals deregistration failed");
        }
        if let Err(error) = self
            .fabric
            .hash_delete(&self.keys.heartbeat_hash(), &self.node.id)
            .await
        {
            warn!(%error, "heartbeat deregistration failed");
        }
    }

    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            beats: self.beats.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            last_timestamp: self.last_timestamp.load(Ordering::Relaxed),
        }
    }

    fn monotonic_timestamp(&self) -> i64 {
        let now = now_ms();
        let previous = self.last_timestamp.fetch_max(now, Ordering::SeqCst);
        if previous >= now {
            // Clock went backwards or two beats landed in one
            // millisecond; stay strictly monotonic.
            self.last_timestamp.fetch_add(1, Ordering::SeqCst);
            previous + 1
        } else {
            now
        }
    }
}
