//! The continuous immune loop.
//!
//! Every sweep derives a threat level from the vitals, matches detected
//! threats against immune memory, and applies (or replays) a response
//! behind a circuit breaker. A tripped breaker skips responses but never
//! stops the scanner.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chorus_cache::{CacheConfig, TtlCache};
use chorus_core::{
    now_ms, BreakerConfig, BreakerError, CircuitBreaker, ImmunePort, ImmuneReadout, LoadVector,
    TimerRegistry, VitalsSource,
};

use crate::types::{
    ActivationCondition, AdaptationRecord, AdaptiveDefense, BehavioralMarker, DefenseAction,
    DefenseKind, DefenseMechanism, DetectedThreat, ImmuneMemory, ImmuneResponse, QuarantineZone,
    ResponseAction, ThreatCategory, ThreatSeverity, ThreatSignature,
};

const SCAN_TIMER_ID: &str = "immune-scan";

#[derive(Debug, Clone)]
pub struct ImmuneConfig {
    pub scan_interval: Duration,
    /// Threat levels above this emit a detected threat.
    pub detection_threshold: f64,
    /// Marker similarity at or above this replays the remembered
    /// response.
    pub memory_similarity_threshold: f64,
    /// Auto-release time for quarantined entities.
    pub quarantine_duration: Duration,
    pub max_quarantine_zones: usize,
    pub max_signatures: usize,
    pub max_adaptations: usize,
    pub max_memories: usize,
}

impl Default for ImmuneConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(15),
            detection_threshold: 0.6,
            memory_similarity_threshold: 0.8,
            quarantine_duration: Duration::from_secs(300),
            max_quarantine_zones: 5,
            max_signatures: 20,
            max_adaptations: 3,
            max_memories: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImmuneStats {
    pub scans: u64,
    pub threats_detected: u64,
    pub responses_applied: u64,
    pub responses_replayed: u64,
    pub responses_skipped: u64,
}

pub struct ImmuneSystem {
    me: Weak<ImmuneSystem>,
    vitals: Arc<VitalsSource>,
    config: ImmuneConfig,
    timers: TimerRegistry,
    breaker: Arc<CircuitBreaker>,
    memories: RwLock<Vec<ImmuneMemory>>,
    signatures: RwLock<Vec<ThreatSignature>>,
    defenses: RwLock<Vec<AdaptiveDefense>>,
    /// Quarantine zones; the cache TTL is the auto-release time, the
    /// size cap is the active-zone limit.
    quarantine: TtlCache<String, QuarantineZone>,
    /// Recently active threats, pruned by TTL.
    active: TtlCache<String, DetectedThreat>,
    last_level: Mutex<f64>,
    scans: AtomicU64,
    threats_detected: AtomicU64,
    responses_applied: AtomicU64,
    responses_replayed: AtomicU64,
    responses_skipped: AtomicU64,
}

impl ImmuneSystem {
    pub fn new(
        vitals: Arc<VitalsSource>,
        timers: TimerRegistry,
        config: ImmuneConfig,
    ) -> Arc<Self> {
        let quarantine = TtlCache::new(CacheConfig {
            default_ttl: config.quarantine_duration,
            max_size: config.max_quarantine_zones,
            cleanup_interval: None,
        });
        let active = TtlCache::new(CacheConfig {
            default_ttl: Duration::from_secs(600),
            max_size: 100,
            cleanup_interval: None,
        });
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            vitals,
            config,
            timers,
            breaker: Arc::new(CircuitBreaker::new(
                "immune-response",
                BreakerConfig {
                    failure_threshold: 3,
                    success_threshold: 2,
                    recovery_timeout: Duration::from_secs(60),
                    monitoring_window: Duration::from_secs(120),
                    timeout: Duration::from_secs(5),
                },
            )),
            memories: RwLock::new(Vec::new()),
            signatures: RwLock::new(Vec::new()),
            defenses: RwLock::new(Self::base_defenses()),
            quarantine,
            active,
            last_level: Mutex::new(0.0),
            scans: AtomicU64::new(0),
            threats_detected: AtomicU64::new(0),
            responses_applied: AtomicU64::new(0),
            responses_replayed: AtomicU64::new(0),
            responses_skipped: AtomicU64::new(0),
        })
    }

    /// The defenses every coordinator is born with.
    fn base_defenses() -> Vec<AdaptiveDefense> {
        vec![
            AdaptiveDefense {
                id: Uuid::new_v4().to_string(),
                name: "byzantine-isolation".to_string(),
                condition: ActivationCondition::Threshold { level: 0.8 },
                mechanism: DefenseMechanism {
                    kind: DefenseKind::Reactive,
                    action: DefenseAction::Quarantine,
                },
                learning_rate: 0.1,
                effectiveness: 0.75,
            },
            AdaptiveDefense {
                id: Uuid::new_v4().to_string(),
                name: "network-rate-limiting".to_string(),
                condition: ActivationCondition::Frequency { count: 50, window_ms: 10_000 },
                mechanism: DefenseMechanism {
                    kind: DefenseKind::Preventive,
                    action: DefenseAction::Block,
                },
                learning_rate: 0.05,
                effectiveness: 0.7,
            },
            AdaptiveDefense {
                id: Uuid::new_v4().to_string(),
                name: "data-integrity-verification".to_string(),
                condition: ActivationCondition::Pattern { marker: "checksum-mismatch".to_string() },
                mechanism: DefenseMechanism {
                    kind: DefenseKind::Adaptive,
                    action: DefenseAction::Analyze,
                },
                learning_rate: 0.15,
                effectiveness: 0.8,
            },
        ]
    }

    /// Register the scan timer and start cache sweepers.
    pub fn start(&self) {
        let Some(system) = self.me.upgrade() else {
            return;
        };
        self.quarantine.start();
        self.active.start();
        self.timers.set_interval(Some(SCAN_TIMER_ID), self.config.scan_interval, move || {
            let system = Arc::clone(&system);
            async move {
                system.scan_cycle().await;
            }
        });
        info!(interval = ?self.config.scan_interval, "immune system scanning");
    }

    pub fn shutdown(&self) {
        self.timers.clear(SCAN_TIMER_ID);
        self.quarantine.close();
        self.active.close();
    }

    /// One sweep. All errors are absorbed at this boundary.
    pub async fn scan_cycle(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let vitals = self.vitals.snapshot();
        let level = Self::threat_level(&vitals.load);
        *self.last_level.lock() = level;

        if level <= self.config.detection_threshold {
            return;
        }

        let threat = DetectedThreat {
            id: Uuid::new_v4().to_string(),
            category: ThreatCategory::ResourceAbuse,
            severity: ThreatSeverity::from_level(level),
            threat_level: level,
            indicators: vec![
                format!("cpu:{:.2}", vitals.load.cpu),
                format!("memory:{:.2}", vitals.load.memory),
                format!("load:{:.2}", vitals.load.network),
            ],
            source: None,
            detected_at: now_ms(),
        };
        self.handle_threat(threat).await;
    }

    /// `(cpu_load + memory_pressure + system_load) / 3`.
    pub fn threat_level(load: &LoadVector) -> f64 {
        (load.cpu + load.memory + load.network) / 3.0
    }

    /// Route a detected threat through memory matching and response
    /// selection. Public so the coordinator can inject threats observed
    /// elsewhere (failed challenges, integrity violations).
    pub async fn handle_threat(&self, threat: DetectedThreat) {
        self.threats_detected.fetch_add(1, Ordering::Relaxed);
        self.active.set(threat.id.clone(), threat.clone());
        self.record_signature(&threat);
        debug!(
            category = ?threat.category,
            severity = ?threat.severity,
            level = threat.threat_level,
            "threat detected"
        );

        // Memory match first: a close-enough past encounter replays the
        // response that worked before.
        if let Some(memory_id) = self.best_memory_match(&threat) {
            let action = {
                let memories = self.memories.read();
                memories
                    .iter()
                    .find(|m| m.id == memory_id)
                    .map(|m| m.response.action)
            };
            if let Some(action) = action {
                if self.apply_response(action, &threat).await {
                    self.responses_replayed.fetch_add(1, Ordering::Relaxed);
                    self.reinforce_memory(&memory_id, &threat);
                }
                return;
            }
        }

        let action = ResponseAction::for_severity(threat.severity);
        if self.apply_response(action, &threat).await {
            self.remember(&threat, action);
        }
    }

    /// Execute a response behind the breaker. Returns whether it ran.
    async fn apply_response(&self, action: ResponseAction, threat: &DetectedThreat) -> bool {
        let threat = threat.clone();
        let result = self
            .breaker
            .execute(|| async {
                match action {
                    ResponseAction::Observation => {
                        debug!(threat = %threat.id, "observing threat");
                    }
                    ResponseAction::Adaptation => {
                        self.adapt_defenses(&threat);
                    }
                    ResponseAction::Neutralization => {
                        self.adapt_defenses(&threat);
                        debug!(threat = %threat.id, "threat neutralized");
                    }
                    ResponseAction::Isolation => {
                        let entity = threat
                            .source
                            .clone()
                            .unwrap_or_else(|| "local:resources".to_string());
                        self.quarantine_entity(&entity, &format!("threat {}", threat.id));
                    }
                }
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                self.responses_applied.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(BreakerError::Open(_)) => {
                // The scan keeps running; only the response is skipped.
                self.responses_skipped.fetch_add(1, Ordering::Relaxed);
                warn!(threat = %threat.id, "response breaker open, skipping response");
                false
            }
            Err(error) => {
                warn!(threat = %threat.id, %error, "immune response failed");
                false
            }
        }
    }

    /// Nudge every defense whose condition the threat satisfies.
    fn adapt_defenses(&self, threat: &DetectedThreat) {
        let mut defenses = self.defenses.write();
        for defense in defenses.iter_mut() {
            let activated = match &defense.condition {
                ActivationCondition::Threshold { level } => threat.threat_level >= *level,
                ActivationCondition::Pattern { marker } => {
                    threat.indicators.iter().any(|i| i.contains(marker.as_str()))
                }
                ActivationCondition::Frequency { .. } => false,
                ActivationCondition::Correlation { indicators } => indicators
                    .iter()
                    .all(|needle| threat.indicators.iter().any(|i| i.contains(needle.as_str()))),
            };
            if activated {
                defense.effectiveness = (defense.effectiveness
                    + defense.learning_rate * (1.0 - defense.effectiveness))
                    .clamp(0.0, 1.0);
                debug!(defense = %defense.name, effectiveness = defense.effectiveness, "defense adapted");
            }
        }
    }

    fn record_signature(&self, threat: &DetectedThreat) {
        let mut signatures = self.signatures.write();
        if let Some(existing) = signatures.iter_mut().find(|s| {
            s.category == threat.category
                && s.markers.iter().map(|m| &m.indicator).eq(threat.indicators.iter())
        }) {
            existing.occurrences += 1;
            existing.last_seen = threat.detected_at;
            existing.severity = existing.severity.max(threat.severity);
            return;
        }

        signatures.push(ThreatSignature {
            id: Uuid::new_v4().to_string(),
            category: threat.category,
            markers: threat
                .indicators
                .iter()
                .map(|indicator| BehavioralMarker { indicator: indicator.clone(), weight: 1.0 })
                .collect(),
            severity: threat.severity,
            first_seen: threat.detected_at,
            last_seen: threat.detected_at,
            occurrences: 1,
        });

        // Cap: drop the coldest signature.
        while signatures.len() > self.config.max_signatures {
            if let Some(oldest) = signatures
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.last_seen)
                .map(|(i, _)| i)
            {
                signatures.remove(oldest);
            }
        }
    }

    fn best_memory_match(&self, threat: &DetectedThreat) -> Option<String> {
        let memories = self.memories.read();
        memories
            .iter()
            .map(|m| (Self::similarity(&m.markers, &threat.indicators), m))
            .filter(|(similarity, _)| *similarity >= self.config.memory_similarity_threshold)
            .max_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, m)| m.id.clone())
    }

    /// Weighted overlap between remembered markers and observed
    /// indicators. Indicator values carry magnitudes, so matching is on
    /// the `name:` prefix.
    fn similarity(markers: &[BehavioralMarker], indicators: &[String]) -> f64 {
        if markers.is_empty() || indicators.is_empty() {
            return 0.0;
        }
        let prefix = |s: &str| s.split(':').next().unwrap_or(s).to_string();
        let observed: Vec<String> = indicators.iter().map(|i| prefix(i)).collect();
        let total: f64 = markers.iter().map(|m| m.weight).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let shared: f64 = markers
            .iter()
            .filter(|m| observed.contains(&prefix(&m.indicator)))
            .map(|m| m.weight)
            .sum();
        shared / total
    }

    fn remember(&self, threat: &DetectedThreat, action: ResponseAction) {
        let mut memories = self.memories.write();
        memories.push(ImmuneMemory {
            id: Uuid::new_v4().to_string(),
            markers: threat
                .indicators
                .iter()
                .map(|indicator| BehavioralMarker { indicator: indicator.clone(), weight: 1.0 })
                .collect(),
            response: ImmuneResponse {
                id: Uuid::new_v4().to_string(),
                threat_id: threat.id.clone(),
                action,
                success: true,
                applied_at: now_ms(),
            },
            effectiveness: 0.5,
            adaptation_history: Vec::new(),
        });
        while memories.len() > self.config.max_memories {
            memories.remove(0);
        }
    }

    fn reinforce_memory(&self, memory_id: &str, threat: &DetectedThreat) {
        let mut memories = self.memories.write();
        if let Some(memory) = memories.iter_mut().find(|m| m.id == memory_id) {
            let delta = 0.1 * (1.0 - memory.effectiveness);
            memory.effectiveness = (memory.effectiveness + delta).clamp(0.0, 1.0);
            memory.adaptation_history.push(AdaptationRecord {
                threat_id: threat.id.clone(),
                effectiveness_delta: delta,
                recorded_at: now_ms(),
            });
            while memory.adaptation_history.len() > self.config.max_adaptations {
                memory.adaptation_history.remove(0);
            }
        }
    }

    /// Isolate an entity. The cache TTL releases it automatically.
    pub fn quarantine_entity(&self, entity: &str, reason: &str) {
        let now = now_ms();
        let zone = QuarantineZone {
            id: Uuid::new_v4().to_string(),
            entity: entity.to_string(),
            reason: reason.to_string(),
            created_at: now,
            release_at: now + self.config.quarantine_duration.as_millis() as i64,
        };
        warn!(entity, reason, release_at = zone.release_at, "entity quarantined");
        self.quarantine.set(entity.to_string(), zone);
    }

    pub fn is_quarantined(&self, entity: &str) -> bool {
        self.quarantine.contains(&entity.to_string())
    }

    pub fn quarantined_zones(&self) -> Vec<QuarantineZone> {
        self.quarantine.values()
    }

    pub fn release(&self, entity: &str) -> bool {
        self.quarantine.remove(&entity.to_string()).is_some()
    }

    pub fn stats(&self) -> ImmuneStats {
        ImmuneStats {
            scans: self.scans.load(Ordering::Relaxed),
            threats_detected: self.threats_detected.load(Ordering::Relaxed),
            responses_applied: self.responses_applied.load(Ordering::Relaxed),
            responses_replayed: self.responses_replayed.load(Ordering::Relaxed),
            responses_skipped: self.responses_skipped.load(Ordering::Relaxed),
        }
    }

    pub fn summary(&self) -> ImmuneReadout {
        let defenses = self.defenses.read();
        let mean_effectiveness = if defenses.is_empty() {
            0.0
        } else {
            defenses.iter().map(|d| d.effectiveness).sum::<f64>() / defenses.len() as f64
        };
        ImmuneReadout {
            active_threats: self.active.len(),
            quarantined_entities: self.quarantine.len(),
            signatures_known: self.signatures.read().len(),
            mean_defense_effectiveness: mean_effectiveness,
            threat_level: *self.last_level.lock(),
        }
    }
}

#[async_trait]
impl ImmunePort for ImmuneSystem {
    async fn start(&self) -> Result<()> {
        ImmuneSystem::start(self);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    async fn readout(&self) -> Result<ImmuneReadout> {
        Ok(self.summary())
    }
}
