//! Named, cancellable timers.
//!
//! Every periodic worker in the swarm registers here under a stable id,
//! so shutdown can prove no task leaked: after `clear_all`, the stats
//! must report zero active handles.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    Interval,
    Oneshot,
}

struct TimerEntry {
    kind: TimerKind,
    handle: JoinHandle<()>,
    created_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerStats {
    pub active_timers: usize,
    pub active_intervals: usize,
    pub active_oneshots: usize,
    pub total_created: u64,
    pub total_cleared: u64,
}

/// Registry of live timer handles, keyed by caller-chosen or generated id.
#[derive(Clone)]
pub struct TimerRegistry {
    timers: Arc<DashMap<String, TimerEntry>>,
    created: Arc<AtomicU64>,
    cleared: Arc<AtomicU64>,
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            created: Arc::new(AtomicU64::new(0)),
            cleared: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn a periodic task. Replaces any live timer with the same id.
    pub fn set_interval<F, Fut>(&self, id: Option<&str>, period: Duration, mut task: F) -> String
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let id = self.resolve_id(id);
        self.clear(&id);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it so callers get a
            // full period before the first run.
            interval.tick().await;
            loop {
                interval.tick().await;
                task().await;
            }
        });

        self.insert(id.clone(), TimerKind::Interval, handle);
        id
    }

    /// Spawn a one-shot task. The entry removes itself after firing.
    pub fn set_timeout<F, Fut>(&self, id: Option<&str>, delay: Duration, task: F) -> String
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let id = self.resolve_id(id);
        self.clear(&id);

        let timers = Arc::clone(&self.timers);
        let cleared = Arc::clone(&self.cleared);
        let own_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task().await;
            if timers.remove(&own_id).is_some() {
                cleared.fetch_add(1, Ordering::Relaxed);
            }
        });

        self.insert(id.clone(), TimerKind::Oneshot, handle);
        id
    }

    /// Abort a timer by id. Returns whether a live handle was stopped.
    pub fn clear(&self, id: &str) -> bool {
        match self.timers.remove(id) {
            Some((_, entry)) => {
                entry.handle.abort();
                self.cleared.fetch_add(1, Ordering::Relaxed);
                debug!(timer = id, "timer cleared");
                true
            }
            None => false,
        }
    }

    /// Stop every live timer. Called at coordinator sleep and on
    /// termination signals.
    pub fn clear_all(&self) {
        let ids: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for id in &ids {
            self.clear(id);
        }
        if !ids.is_empty() {
            debug!(count = ids.len(), "all timers cleared");
        }
    }

    pub fn stats(&self) -> TimerStats {
        self.reap_finished();
        let mut intervals = 0;
        let mut oneshots = 0;
        for entry in self.timers.iter() {
            match entry.kind {
                TimerKind::Interval => intervals += 1,
                TimerKind::Oneshot => oneshots += 1,
            }
        }
        TimerStats {
            active_timers: intervals + oneshots,
            active_intervals: intervals,
            active_oneshots: oneshots,
            total_created: self.created.load(Ordering::Relaxed),
            total_cleared: self.cleared.load(Ordering::Relaxed),
        }
    }

    /// Ids of every live timer, oldest first. The leak audit surface.
    pub fn list_active(&self) -> Vec<String> {
        self.reap_finished();
        let mut entries: Vec<(String, Instant)> = self
            .timers
            .iter()
            .map(|e| (e.key().clone(), e.created_at))
            .collect();
        entries.sort_by_key(|(_, created)| *created);
        entries.into_iter().map(|(id, _)| id).collect()
    }

    fn insert(&self, id: String, kind: TimerKind, handle: JoinHandle<()>) {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.timers.insert(
            id,
            TimerEntry { kind, handle, created_at: Instant::now() },
        );
    }

    fn resolve_id(&self, id: Option<&str>) -> String {
        match id {
            Some(id) => id.to_string(),
            None => format!("timer-{}", Uuid::new_v4().simple()),
        }
    }

    /// Drop entries whose task already finished (panicked one-shots and
    /// the like) so the audit never counts dead handles.
    fn reap_finished(&self) {
        let dead: Vec<String> = self
            .timers
            .iter()
            .filter(|e| e.handle.is_finished())
            .map(|e| e.key().clone())
            .collect();
        for id in dead {
            if self.timers.remove(&id).is_some() {
                self.cleared.fetch_add(1, Ordering::Relaxed);
                warn!(timer = %id, "reaped finished timer handle");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn interval_fires_repeatedly() {
        let registry = TimerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        registry.set_interval(Some("beat"), Duration::from_millis(10), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(hits.load(Ordering::Relaxed) >= 3);
        assert!(registry.clear("beat"));
    }

    #[tokio::test]
    async fn oneshot_removes_itself() {
        let registry = TimerRegistry::new();
        registry.set_timeout(Some("once"), Duration::from_millis(5), || async {});
        assert_eq!(registry.stats().active_timers, 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(registry.stats().active_timers, 0);
    }

    #[tokio::test]
    async fn clear_all_leaves_no_handles() {
        let registry = TimerRegistry::new();
        for i in 0..5 {
            registry.set_interval(
                Some(&format!("t{i}")),
                Duration::from_millis(50),
                || async {},
            );
        }
        assert_eq!(registry.stats().active_timers, 5);
        registry.clear_all();
        assert_eq!(registry.stats().active_timers, 0);
        assert!(registry.list_active().is_empty());
    }

    #[tokio::test]
    async fn same_id_replaces_previous_timer() {
        let registry = TimerRegistry::new();
        registry.set_interval(Some("dup"), Duration::from_millis(50), || async {});
        registry.set_interval(Some("dup"), Duration::from_millis(50), || async {});
        assert_eq!(registry.stats().active_timers, 1);
    }
}
