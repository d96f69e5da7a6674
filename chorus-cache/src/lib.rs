//! # Chorus TTL Cache
//!
//! Per-key expiry with a size cap, eviction callbacks, and a background
//! sweeper. Every cache in the swarm is owned by exactly one component
//! and registered for cleanup at coordinator shutdown; nothing here may
//! grow without bound.
//!
//! Guarantees:
//! - `get` never returns an expired entry; the expiry callback fires
//!   exactly once per expired key.
//! - When the size cap is reached, the oldest-created entry is evicted
//!   and the eviction callback fires.
//! - The sweeper interval never exceeds a tenth of the default TTL, nor
//!   60 seconds.
//! - Callback panics are caught and logged; they never abort the sweeper.

use std::collections::HashMap;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Expiry applied when `set` is called without an explicit TTL.
    pub default_ttl: Duration,
    /// Size cap; reaching it evicts the oldest-created entry.
    pub max_size: usize,
    /// Sweep period override. When `None` the sweeper runs at a tenth of
    /// the default TTL, capped at 60 s.
    pub cleanup_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_size: 1000,
            cleanup_interval: None,
        }
    }
}

impl CacheConfig {
    fn sweep_interval(&self) -> Duration {
        let derived = self.cleanup_interval.unwrap_or(self.default_ttl / 10);
        derived.min(self.default_ttl / 10).min(MAX_SWEEP_INTERVAL).max(Duration::from_millis(10))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expires: u64,
    pub evictions: u64,
    pub inserts: u64,
    pub size: usize,
    pub hit_rate: f64,
}

/// Expiry bookkeeping for a single entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub age: Duration,
    pub remaining: Duration,
    pub ttl: Duration,
}

struct Entry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    ttl: Duration,
}

type Callback<K, V> = Arc<dyn Fn(&K, &V) + Send + Sync>;

struct Shared<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    config: CacheConfig,
    on_expire: Option<Callback<K, V>>,
    on_evict: Option<Callback<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expires: AtomicU64,
    evictions: AtomicU64,
    inserts: AtomicU64,
}

/// TTL cache with a size cap and background sweeping.
pub struct TtlCache<K, V> {
    shared: Arc<Shared<K, V>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self::with_callbacks(config, None, None)
    }

    /// Build a cache with expiry/eviction callbacks. Callbacks run inline
    /// on the mutating path (or on the sweeper task) and must be cheap.
    pub fn with_callbacks(
        config: CacheConfig,
        on_expire: Option<Callback<K, V>>,
        on_evict: Option<Callback<K, V>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                config,
                on_expire,
                on_evict,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                expires: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                inserts: AtomicU64::new(0),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the background sweeper. Idempotent.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let period = shared.config.sweep_interval();
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let reaped = shared.reap_expired();
                if reaped > 0 {
                    debug!(reaped, "cache sweep reaped expired entries");
                }
            }
        }));
    }

    /// Insert with the default TTL.
    pub fn set(&self, key: K, value: V) {
        let ttl = self.shared.config.default_ttl;
        self.set_with_ttl(key, value, ttl);
    }

    /// Insert with an explicit TTL, evicting the oldest-created entry if
    /// the cap is reached.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let shared = &self.shared;
        let now = Instant::now();
        let mut entries = shared.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= shared.config.max_size {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone())
            {
                if let Some(evicted) = entries.remove(&oldest) {
                    shared.evictions.fetch_add(1, Ordering::Relaxed);
                    shared.fire(&shared.on_evict, &oldest, &evicted.value);
                }
            }
        }

        shared.inserts.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key,
            Entry {
                value,
                created_at: now,
                expires_at: now + ttl,
                ttl,
            },
        );
    }

    /// Fetch a live value. An expired key counts as a miss and fires the
    /// expiry callback exactly once.
    pub fn get(&self, key: &K) -> Option<V> {
        let shared = &self.shared;
        let mut entries = shared.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            Some(_) => {
                shared.misses.fetch_add(1, Ordering::Relaxed);
                if let Some(entry) = entries.remove(key) {
                    shared.expires.fetch_add(1, Ordering::Relaxed);
                    shared.fire(&shared.on_expire, key, &entry.value);
                }
                None
            }
            None => {
                shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let entries = self.shared.entries.lock();
        entries
            .get(key)
            .is_some_and(|e| e.expires_at > Instant::now())
    }

    /// Remove without firing callbacks.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.shared.entries.lock().remove(key).map(|e| e.value)
    }

    /// Reset an entry's expiry from now. `ttl = None` reuses the entry's
    /// previous TTL.
    pub fn refresh(&self, key: &K, ttl: Option<Duration>) -> bool {
        let mut entries = self.shared.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                let ttl = ttl.unwrap_or(entry.ttl);
                entry.ttl = ttl;
                entry.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }

    pub fn keys(&self) -> Vec<K> {
        self.shared.reap_expired();
        self.shared.entries.lock().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.shared.reap_expired();
        self.shared
            .entries
            .lock()
            .values()
            .map(|e| e.value.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.shared.reap_expired();
        self.shared
            .entries
            .lock()
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.reap_expired();
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry_info(&self, key: &K) -> Option<EntryInfo> {
        let entries = self.shared.entries.lock();
        let now = Instant::now();
        entries.get(key).and_then(|e| {
            if e.expires_at <= now {
                return None;
            }
            Some(EntryInfo {
                age: now - e.created_at,
                remaining: e.expires_at - now,
                ttl: e.ttl,
            })
        })
    }

    /// Keys whose expiry falls inside the next `within` window.
    pub fn expiring_entries(&self, within: Duration) -> Vec<K> {
        let entries = self.shared.entries.lock();
        let now = Instant::now();
        let horizon = now + within;
        entries
            .iter()
            .filter(|(_, e)| e.expires_at > now && e.expires_at <= horizon)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Push back the expiry of every entry due within `within`. Returns
    /// how many entries were extended.
    pub fn extend_expiring(&self, within: Duration, extension: Duration) -> usize {
        let mut entries = self.shared.entries.lock();
        let now = Instant::now();
        let horizon = now + within;
        let mut extended = 0;
        for entry in entries.values_mut() {
            if entry.expires_at > now && entry.expires_at <= horizon {
                entry.expires_at += extension;
                extended += 1;
            }
        }
        extended
    }

    pub fn clear(&self) {
        self.shared.entries.lock().clear();
    }

    /// Stop the sweeper and drop all entries. The cache remains usable
    /// but no longer sweeps.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
        self.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let shared = &self.shared;
        let hits = shared.hits.load(Ordering::Relaxed);
        let misses = shared.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            expires: shared.expires.load(Ordering::Relaxed),
            evictions: shared.evictions.load(Ordering::Relaxed),
            inserts: shared.inserts.load(Ordering::Relaxed),
            size: shared.entries.lock().len(),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }

    pub fn reset_stats(&self) {
        let shared = &self.shared;
        shared.hits.store(0, Ordering::Relaxed);
        shared.misses.store(0, Ordering::Relaxed);
        shared.expires.store(0, Ordering::Relaxed);
        shared.evictions.store(0, Ordering::Relaxed);
        shared.inserts.store(0, Ordering::Relaxed);
    }
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Remove every expired entry, firing the expiry callback once each.
    fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let dead: Vec<K> = entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &dead {
            if let Some(entry) = entries.remove(key) {
                self.expires.fetch_add(1, Ordering::Relaxed);
                self.fire(&self.on_expire, key, &entry.value);
            }
        }
        dead.len()
    }

    fn fire(&self, callback: &Option<Callback<K, V>>, key: &K, value: &V) {
        if let Some(cb) = callback {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| cb(key, value)));
            if result.is_err() {
                warn!("cache callback panicked; continuing");
            }
        }
    }
}

impl<K, V> Drop for TtlCache<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}
