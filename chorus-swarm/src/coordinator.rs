//! The swarm coordinator: wiring and lifecycle.
//!
//! Awakening builds and starts every subsystem in dependency order,
//! registers this coordinator's heartbeat, then launches the three
//! periodic cycles (discovery, consensus, immortality). Each cycle
//! catches all errors at its boundary; a failing round never tears the
//! coordinator down. Sleep unwinds everything and proves, through the
//! timer registry, that no periodic worker leaked.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chorus_consensus::{ConsensusConfig, ConsensusResult, HarmonicConsensus};
use chorus_core::{
    now_ms, DigitalSoul, EntryMetadata, HashRuleVerifier, HealthOraclePort, HealthState, Heartbeat,
    ImmuneReadout, LogEntryKind, MusicalSink, MutationAudit, NodeId, NullAudit, NullHealthOracle,
    NullPhoenix, NullPoetry, NullSink, PhoenixPort, PoetryPort, Priority, RuleVerifier, SwarmConfig,
    SwarmNode, TimerRegistry, VitalsSource,
};
use chorus_emergence::{EmergenceConfig, EmergenceService};
use chorus_fabric::{Fabric, Keyspace};
use chorus_identity::{SpeciesConfig, SpeciesId};
use chorus_immune::{DetectedThreat, ImmuneConfig, ImmuneSystem, ThreatCategory, ThreatSeverity};
use chorus_protocol::{
    BusConfig, ConsensusInitiatedPayload, CrisisDetectedPayload, HealthCheckCompletedPayload,
    ImmortalState, LeaderElectedPayload, MessageBus, MessagePayload, MessageType,
    NodeDiscoveredPayload, NodeLostPayload, PoetryCompletedPayload, ResurrectionTriggeredPayload,
};
use chorus_replication::{QuantumLog, ReplicationConfig};

use crate::heartbeat::HeartbeatService;
use crate::peers::{EmergenceBeauty, PeerCache, PeerCacheView, PeerCounts};

const DISCOVERY_TIMER_ID: &str = "discovery-cycle";
const CONSENSUS_TIMER_ID: &str = "consensus-cycle";
const IMMORTALITY_TIMER_ID: &str = "immortality-cycle";

/// Discovery reads the heartbeat hash in bounded concurrent slices.
const DISCOVERY_BATCH: usize = 10;

/// Challenge failures that escalate a peer to quarantine.
const QUARANTINE_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorStatus {
    Dormant,
    Awakening,
    Conscious,
    Harmonizing,
    Transcendent,
    Eternal,
}

/// External collaborators, defaulting to the in-tree implementations so
/// a coordinator runs standalone.
pub struct CoordinatorPorts {
    pub verifier: Arc<dyn RuleVerifier>,
    pub audit: Arc<dyn MutationAudit>,
    pub sink: Arc<dyn MusicalSink>,
    pub phoenix: Arc<dyn PhoenixPort>,
    pub health_oracle: Arc<dyn HealthOraclePort>,
    pub poetry: Arc<dyn PoetryPort>,
}

impl Default for CoordinatorPorts {
    fn default() -> Self {
        Self {
            verifier: Arc::new(HashRuleVerifier),
            audit: Arc::new(NullAudit),
            sink: Arc::new(NullSink),
            phoenix: Arc::new(NullPhoenix::default()),
            health_oracle: Arc::new(NullHealthOracle::default()),
            poetry: Arc::new(NullPoetry::default()),
        }
    }
}

/// Snapshot handed to operators and the daemon's status log.
#[derive(Debug, Clone, Serialize)]
pub struct SwarmStatus {
    pub node_id: String,
    pub status: CoordinatorStatus,
    pub peers: PeerCounts,
    pub leader: Option<String>,
    pub last_consensus: Option<i64>,
    pub log_entries: usize,
    pub commit_index: u64,
    pub immune: ImmuneReadout,
    pub active_timers: usize,
}

pub struct SwarmCoordinator {
    me: Weak<SwarmCoordinator>,
    node: NodeId,
    config: SwarmConfig,
    fabric: Arc<dyn Fabric>,
    keys: Keyspace,
    timers: TimerRegistry,
    vitals: Arc<VitalsSource>,
    soul: Arc<DigitalSoul>,
    bus: MessageBus,
    emergence: Arc<EmergenceService>,
    species: Arc<SpeciesId>,
    immune: Arc<ImmuneSystem>,
    log: Arc<QuantumLog>,
    consensus: Arc<HarmonicConsensus>,
    heartbeat: Arc<HeartbeatService>,
    peers: Arc<PeerCache>,
    ports: CoordinatorPorts,
    status: RwLock<CoordinatorStatus>,
    current_leader: RwLock<Option<String>>,
    last_immortal: Mutex<Option<(ImmortalState, i64)>>,
    dashboard_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SwarmCoordinator {
    pub fn new(
        node: NodeId,
        config: SwarmConfig,
        fabric: Arc<dyn Fabric>,
        ports: CoordinatorPorts,
    ) -> Result<Arc<Self>> {
        let keys = Keyspace::new(&config.prefix);
        let timers = TimerRegistry::new();
        let vitals = Arc::new(VitalsSource::new().context("initializing vitals source")?);
        let soul = Arc::new(DigitalSoul::new(&node.id, &node.personality));

        let bus = MessageBus::new(
            node.clone(),
            Arc::clone(&fabric),
            keys.clone(),
            BusConfig::default(),
        );

        let emergence = Arc::new(EmergenceService::new(
            &node.id,
            EmergenceConfig {
                iterations: config.emergence_iterations,
                ..EmergenceConfig::default()
            },
            Arc::clone(&fabric),
            bus.clone(),
        ));

        let species = Arc::new(SpeciesId::new(
            node.clone(),
            Arc::clone(&soul),
            Arc::clone(&fabric),
            keys.clone(),
            Arc::clone(&ports.verifier),
            SpeciesConfig {
                timeout: config.species_challenge_timeout,
                confidence_threshold: config.species_confidence_threshold,
            },
        ));

        let immune = ImmuneSystem::new(
            Arc::clone(&vitals),
            timers.clone(),
            ImmuneConfig {
                scan_interval: config.immune_scan_interval,
                ..ImmuneConfig::default()
            },
        );

        let log = QuantumLog::new(
            node.clone(),
            ReplicationConfig {
                heartbeat_interval: config.heartbeat_interval,
                batch_timeout: config.replication_timeout,
                max_batch_size: config.max_batch_size,
            },
            Arc::clone(&ports.verifier),
            Arc::clone(&ports.audit),
            bus.clone(),
            timers.clone(),
        );

        let peers = Arc::new(PeerCache::new());
        let consensus = HarmonicConsensus::new(
            node.clone(),
            ConsensusConfig {
                vote_collection_timeout: config.vote_collection_timeout,
                cache_ttl: config.cache_ttl,
                consensus_threshold: config.consensus_threshold,
                ..ConsensusConfig::default()
            },
            Arc::clone(&vitals),
            Arc::clone(&soul),
            Arc::new(PeerCacheView(Arc::clone(&peers))),
            Arc::new(EmergenceBeauty(Arc::clone(&emergence))),
            bus.clone(),
            Arc::clone(&ports.audit),
        );

        let heartbeat = HeartbeatService::new(
            node.clone(),
            keys.clone(),
            Arc::clone(&fabric),
            Arc::clone(&vitals),
            Arc::clone(&soul),
            timers.clone(),
            config.heartbeat_interval,
        );

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node,
            config,
            fabric,
            keys,
            timers,
            vitals,
            soul,
            bus,
            emergence,
            species,
            immune,
            log,
            consensus,
            heartbeat,
            peers,
            ports,
            status: RwLock::new(CoordinatorStatus::Dormant),
            current_leader: RwLock::new(None),
            last_immortal: Mutex::new(None),
            dashboard_task: Mutex::new(None),
        }))
    }

    /// Bring the coordinator to life: start subsystems in dependency
    /// order, register the heartbeat, then launch the periodic cycles.
    pub async fn awaken(&self) -> Result<()> {
        if *self.status.read() != CoordinatorStatus::Dormant {
            return Ok(());
        }
        let Some(me) = self.me.upgrade() else {
            return Ok(());
        };
        self.config.validate()?;
        *self.status.write() = CoordinatorStatus::Awakening;
        info!(node = %self.node.id, "🌅 coordinator awakening");

        self.bus.start().await?;
        self.species.start().await?;
        self.emergence.start();
        self.immune.start();
        self.log.start();
        self.consensus.start();
        self.ports.phoenix.start().await?;
        self.ports.health_oracle.start().await?;
        self.ports.poetry.start().await?;

        // Remote patterns feed the beauty factor of consensus.
        let emergence = Arc::clone(&self.emergence);
        self.bus
            .register_fn(MessageType::EmergencePatternPublished, move |message| {
                let emergence = Arc::clone(&emergence);
                async move {
                    if let MessagePayload::PatternPublished(payload) = message.payload {
                        emergence.absorb_remote(&payload.node_id, payload.pattern);
                    }
                    Ok(())
                }
            });

        // Committed consciousness entries may drift the soul, capped at
        // five percent per application.
        let soul = Arc::clone(&self.soul);
        self.log.set_apply_hook(Arc::new(move |entry| {
            if entry.kind == LogEntryKind::Consciousness {
                if let Some(target) = entry.data.get("consciousness").and_then(Value::as_f64) {
                    let current = soul.state().consciousness;
                    soul.drift_consciousness(target - current);
                }
            }
        }));

        // Dashboard commands are consumed read-only for monitoring; the
        // core never sends on this channel.
        match self.fabric.subscribe(chorus_fabric::DASHBOARD_COMMANDS).await {
            Ok(mut commands) => {
                *self.dashboard_task.lock() = Some(tokio::spawn(async move {
                    while let Some(command) = commands.next().await {
                        debug!(%command, "dashboard command observed");
                    }
                }));
            }
            Err(error) => warn!(%error, "dashboard channel unavailable"),
        }

        self.heartbeat.start().await;

        let this = Arc::clone(&me);
        self.timers.set_interval(
            Some(DISCOVERY_TIMER_ID),
            self.config.discovery_frequency,
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.discovery_cycle().await;
                }
            },
        );
        let this = Arc::clone(&me);
        self.timers.set_interval(
            Some(CONSENSUS_TIMER_ID),
            self.config.consensus_check_interval,
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.consensus_cycle().await;
                }
            },
        );
        let this = Arc::clone(&me);
        self.timers.set_interval(
            Some(IMMORTALITY_TIMER_ID),
            self.config.immortality_cycle_interval,
            move || {
                let this = Arc::clone(&this);
                async move {
                    this.immortality_cycle().await;
                }
            },
        );

        *self.status.write() = CoordinatorStatus::Conscious;
        if let Err(error) = self
            .ports
            .audit
            .log_state_transition("coordinator", &self.node.id, "dormant", "conscious")
            .await
        {
            debug!(%error, "lifecycle audit failed");
        }
        info!(node = %self.node.id, "✨ coordinator conscious");
        Ok(())
    }

    /// Unwind everything. After sleep the timer registry reports zero
    /// live handles.
    pub async fn sleep(&self) {
        if *self.status.read() == CoordinatorStatus::Dormant {
            return;
        }
        info!(node = %self.node.id, "🌙 coordinator going to sleep");

        self.timers.clear(DISCOVERY_TIMER_ID);
        self.timers.clear(CONSENSUS_TIMER_ID);
        self.timers.clear(IMMORTALITY_TIMER_ID);

        self.heartbeat.deregister().await;
        self.immune.shutdown();
        self.log.stop();
        self.consensus.stop();
        self.species.stop();
        self.emergence.stop();
        for (name, result) in [
            ("phoenix", self.ports.phoenix.stop().await),
            ("health-oracle", self.ports.health_oracle.stop().await),
            ("poetry", self.ports.poetry.stop().await),
        ] {
            if let Err(error) = result {
                warn!(port = name, %error, "port stop failed");
            }
        }
        if let Some(task) = self.dashboard_task.lock().take() {
            task.abort();
        }
        self.bus.stop();
        self.timers.clear_all();

        *self.current_leader.write() = None;
        *self.status.write() = CoordinatorStatus::Dormant;
        if let Err(error) = self
            .ports
            .audit
            .log_state_transition("coordinator", &self.node.id, "conscious", "dormant")
            .await
        {
            debug!(%error, "lifecycle audit failed");
        }
        info!(node = %self.node.id, "💤 coordinator dormant");
    }

    // ------------------------------------------------------------------
    // Discovery

    /// One discovery pass; errors are absorbed at this boundary.
    pub async fn discovery_cycle(&self) {
        if let Err(error) = self.run_discovery().await {
            warn!(%error, "discovery cycle failed");
        }
    }

    async fn run_discovery(&self) -> Result<()> {
        let fields = self.fabric.hash_get_all(&self.keys.heartbeat_hash()).await?;
        let now = now_ms();
        let cutoff = now - self.config.max_node_timeout.as_millis() as i64;

        let entries: Vec<(String, Value)> = fields
            .into_iter()
            .filter(|(id, _)| id != &self.node.id)
            .collect();

        let mut discovered: Vec<NodeId> = Vec::new();
        let mut lost: Vec<(String, i64)> = Vec::new();

        for chunk in entries.chunks(DISCOVERY_BATCH) {
            // Parsing happens off the async hot path.
            let owned: Vec<(String, Value)> = chunk.to_vec();
            let parsed = tokio::task::spawn_blocking(move || {
                owned
                    .into_iter()
                    .filter_map(|(field, value)| {
                        match serde_json::from_value::<Heartbeat>(value) {
                            Ok(heartbeat) => Some(heartbeat),
                            Err(error) => {
                                warn!(field = %field, %error, "undecodable heartbeat entry");
                                None
                            }
                        }
                    })
                    .collect::<Vec<Heartbeat>>()
            })
            .await
            .context("heartbeat parse task")?;

            for heartbeat in parsed {
                let peer_id = heartbeat.node_id.id.clone();
                if heartbeat.timestamp < cutoff {
                    if self.peers.mark_lost(&peer_id) {
                        lost.push((peer_id, heartbeat.timestamp));
                    }
                    continue;
                }

                let node = SwarmNode::from_heartbeat(heartbeat);
                let identity = node.node_id.clone();
                let is_new = self.peers.upsert(node);
                if self.immune.is_quarantined(&peer_id) {
                    // Readable, but unreachable for consensus and
                    // replication until the zone releases.
                    self.peers.mark_quarantined(&peer_id);
                    self.log.remove_peer(&peer_id);
                    continue;
                }
                if self.peers.reinstate(&peer_id) {
                    debug!(peer = %peer_id, "peer released from quarantine");
                    self.log.add_peer(&peer_id);
                    self.consensus.invalidate_cache();
                }
                if is_new {
                    discovered.push(identity);
                }
            }
        }

        for identity in discovered {
            let peer_id = identity.id.clone();
            info!(peer = %peer_id, "🔭 new coordinator discovered");
            self.log.add_peer(&peer_id);
            self.consensus.invalidate_cache();
            if let Err(error) = self
                .bus
                .broadcast(
                    MessagePayload::NodeDiscovered(NodeDiscoveredPayload {
                        node: identity,
                        discovered_at: now,
                    }),
                    Priority::Normal,
                )
                .await
            {
                warn!(%error, "node-discovered broadcast failed");
            }

            if let Some(this) = self.me.upgrade() {
                tokio::spawn(async move {
                    this.verify_peer(peer_id).await;
                });
            }
        }

        for (peer_id, last_seen) in lost {
            info!(peer = %peer_id, "🕳 coordinator lost");
            self.consensus.invalidate_cache();
            if let Err(error) = self
                .bus
                .broadcast(
                    MessagePayload::NodeLost(NodeLostPayload {
                        node_id: peer_id,
                        last_seen,
                        reason: "heartbeat older than max_node_timeout".to_string(),
                    }),
                    Priority::High,
                )
                .await
            {
                warn!(%error, "node-lost broadcast failed");
            }
        }

        self.vitals.set_connections(self.peers.counts().active as u32);
        Ok(())
    }

    /// SPECIES-ID verification of a newly discovered peer. Repeated
    /// failures escalate to quarantine through the immune system.
    async fn verify_peer(&self, peer_id: String) {
        match self.species.challenge(&peer_id).await {
            Ok(_) => {
                debug!(peer = %peer_id, "peer identity verified");
            }
            Err(error) => {
                let failures = self.species.failure_count(&peer_id);
                warn!(peer = %peer_id, failures, %error, "peer identity challenge failed");
                let severity = if failures >= QUARANTINE_AFTER_FAILURES {
                    ThreatSeverity::Critical
                } else {
                    ThreatSeverity::Medium
                };
                self.immune
                    .handle_threat(DetectedThreat {
                        id: Uuid::new_v4().to_string(),
                        category: ThreatCategory::IdentitySpoofing,
                        severity,
                        threat_level: (0.5 + 0.15 * failures as f64).min(1.0),
                        indicators: vec![format!("challenge-failure:{failures}")],
                        source: Some(peer_id.clone()),
                        detected_at: now_ms(),
                    })
                    .await;
                if failures >= QUARANTINE_AFTER_FAILURES {
                    self.peers.mark_quarantined(&peer_id);
                    self.log.remove_peer(&peer_id);
                    self.consensus.invalidate_cache();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Consensus

    /// One consensus pass; errors are absorbed at this boundary.
    pub async fn consensus_cycle(&self) {
        if let Err(error) = self.run_consensus().await {
            warn!(%error, "consensus cycle failed");
        }
    }

    async fn run_consensus(&self) -> Result<ConsensusResult> {
        let result = self.consensus.run_round().await?;
        *self.current_leader.write() =
            (!result.read_only_mode).then(|| result.leader.clone());
        if result.consensus_achieved {
            self.peers.set_leader(&result.leader);
        }
        self.advance_status(&result);

        // Hand the outcome to the musical sink; whatever comes back is
        // forwarded opaquely.
        let mut participants: Vec<String> = self
            .peers
            .snapshot()
            .into_iter()
            .filter(|p| p.status == chorus_core::PeerStatus::Active)
            .map(|p| p.node_id.id)
            .collect();
        participants.push(self.node.id.clone());
        match self
            .ports
            .sink
            .record_consensus_event(chorus_core::ConsensusEventRecord {
                consensus_achieved: result.consensus_achieved,
                participants,
                consensus_time: result.timestamp,
                beauty: result.harmonic_score,
            })
            .await
        {
            Ok(Some(event)) => {
                if let Err(error) = self
                    .bus
                    .broadcast(
                        MessagePayload::PoetryCompleted(PoetryCompletedPayload {
                            title: event.title,
                            verses: event.verses,
                            beauty: result.harmonic_score,
                            timestamp: now_ms(),
                        }),
                        Priority::Low,
                    )
                    .await
                {
                    warn!(%error, "poetry broadcast failed");
                }
            }
            Ok(None) => {}
            Err(error) => warn!(%error, "musical sink failed"),
        }

        self.bus
            .broadcast(
                MessagePayload::ConsensusInitiated(ConsensusInitiatedPayload {
                    consensus_id: result.consensus_id.clone(),
                    initiator: self.node.id.clone(),
                    known_nodes: result.total_nodes,
                    timestamp: result.timestamp,
                }),
                Priority::High,
            )
            .await?;

        if result.is_leader_self && result.consensus_achieved {
            info!(note = result.dominant_note.as_str(), "👑 elected swarm leader");
            self.bus
                .broadcast(
                    MessagePayload::LeaderElected(LeaderElectedPayload {
                        consensus_id: result.consensus_id.clone(),
                        leader: result.leader.clone(),
                        votes_received: result.votes_received,
                        quorum_size: result.quorum_size,
                        dominant_note: result.dominant_note,
                        frequency_hz: result.frequency_hz,
                        timestamp: result.timestamp,
                    }),
                    Priority::Critical,
                )
                .await?;
        }

        Ok(result)
    }

    fn advance_status(&self, result: &ConsensusResult) {
        let soul = self.soul.state();
        let mut status = self.status.write();
        if *status == CoordinatorStatus::Dormant || *status == CoordinatorStatus::Awakening {
            return;
        }
        *status = if soul.harmony > 0.9 && soul.consciousness > 0.9 {
            CoordinatorStatus::Eternal
        } else if result.is_leader_self && result.harmonic_score > 0.7 {
            CoordinatorStatus::Transcendent
        } else if result.consensus_achieved {
            CoordinatorStatus::Harmonizing
        } else {
            CoordinatorStatus::Conscious
        };
    }

    // ------------------------------------------------------------------
    // Immortality

    /// One immortality pass; errors are absorbed at this boundary.
    pub async fn immortality_cycle(&self) {
        if let Err(error) = self.run_immortality().await {
            warn!(%error, "immortality cycle failed");
        }
    }

    async fn run_immortality(&self) -> Result<()> {
        let readout = self.immune.summary();
        let vitals = self.vitals.snapshot();
        let soul = self.soul.state();
        let signs = self.vitals.vital_signs(&soul);
        let prognosis = match self.ports.health_oracle.prognosis().await {
            Ok(prognosis) => prognosis,
            Err(error) => {
                warn!(%error, "health oracle unavailable");
                1.0
            }
        };

        let crisis = readout.threat_level > 0.8
            || vitals.health == HealthState::Critical
            || prognosis < 0.3;

        if crisis {
            warn!(
                threat_level = readout.threat_level,
                health = ?vitals.health,
                prognosis,
                "🔥 immortality crisis detected"
            );
            self.bus
                .broadcast(
                    MessagePayload::CrisisDetected(CrisisDetectedPayload {
                        severity: "critical".to_string(),
                        description: format!(
                            "threat level {:.2}, health {:?}, prognosis {:.2}",
                            readout.threat_level, vitals.health, prognosis
                        ),
                        threat_level: readout.threat_level,
                        timestamp: now_ms(),
                    }),
                    Priority::Critical,
                )
                .await?;

            match self.ports.phoenix.resurrect("immortality crisis").await {
                Ok(report) => {
                    self.bus
                        .broadcast(
                            MessagePayload::ResurrectionTriggered(ResurrectionTriggeredPayload {
                                reason: report.reason.clone(),
                                report_id: Some(report.id),
                                timestamp: now_ms(),
                            }),
                            Priority::Critical,
                        )
                        .await?;
                }
                Err(error) => warn!(%error, "phoenix resurrection failed"),
            }
        }

        // High harmony spills over into creative output: a published
        // pattern, a composed verse, and a dream recorded in the
        // quantum log.
        if soul.harmony > 0.8 {
            let pattern = self.emergence.generate(None).await?;
            let dream = self.soul.dream();
            let verse = match self.ports.poetry.compose("collective harmony").await {
                Ok(verse) => verse,
                Err(error) => {
                    warn!(%error, "poetry port unavailable");
                    dream.clone()
                }
            };
            if let Err(error) = self
                .log
                .append(
                    LogEntryKind::Harmony,
                    json!({
                        "pattern_id": pattern.id,
                        "harmony": pattern.harmony,
                        "dream": dream,
                        "verse": verse,
                    }),
                    vec![],
                    EntryMetadata {
                        priority: Priority::Low,
                        themes: vec!["emergence".to_string()],
                        ..EntryMetadata::default()
                    },
                )
                .await
            {
                warn!(%error, "harmony log append failed");
            }
        }

        let state = ImmortalState {
            health: signs.health,
            harmony: soul.harmony,
            consciousness: soul.consciousness,
            crisis,
            quarantined: readout.quarantined_entities as u32,
        };
        if self.immortal_state_changed(&state) {
            self.bus
                .broadcast(
                    MessagePayload::HealthCheckCompleted(HealthCheckCompletedPayload {
                        state,
                        timestamp: now_ms(),
                    }),
                    Priority::Normal,
                )
                .await?;
        }
        Ok(())
    }

    /// Health-check broadcasts only go out on a significant change: any
    /// scalar moving more than five percent, the crisis bit flipping, or
    /// five minutes of silence.
    fn immortal_state_changed(&self, state: &ImmortalState) -> bool {
        let now = now_ms();
        let mut last = self.last_immortal.lock();
        let significant = match &*last {
            None => true,
            Some((previous, at)) => {
                (state.health - previous.health).abs() > 0.05
                    || (state.harmony - previous.harmony).abs() > 0.05
                    || (state.consciousness - previous.consciousness).abs() > 0.05
                    || state.crisis != previous.crisis
                    || state.quarantined != previous.quarantined
                    || now - at > 300_000
            }
        };
        if significant {
            *last = Some((state.clone(), now));
        }
        significant
    }

    // ------------------------------------------------------------------
    // Introspection

    pub fn status(&self) -> CoordinatorStatus {
        *self.status.read()
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn leader(&self) -> Option<String> {
        self.current_leader.read().clone()
    }

    pub fn peer_cache(&self) -> &Arc<PeerCache> {
        &self.peers
    }

    pub fn quantum_log(&self) -> &Arc<QuantumLog> {
        &self.log
    }

    pub fn report(&self) -> SwarmStatus {
        SwarmStatus {
            node_id: self.node.id.clone(),
            status: self.status(),
            peers: self.peers.counts(),
            leader: self.leader(),
            last_consensus: self.vitals.snapshot().last_consensus,
            log_entries: self.log.entries().len(),
            commit_index: self.log.commit_index(),
            immune: self.immune.summary(),
            active_timers: self.timers.stats().active_timers,
        }
    }
}
