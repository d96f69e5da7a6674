//! The harmonic consensus engine.
//!
//! One round: snapshot shared metrics for the whole known set, cast an
//! own vote, broadcast the metrics so every voter computes from exactly
//! the same inputs, collect signed responses inside a bounded window,
//! tally the verified ones against quorum, validate the winner's live
//! health, and project the outcome onto a chord.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chorus_core::{
    now_ms, sha256_hex, DigitalSoul, MutationAudit, NodeId, PeerStatus, Priority, SwarmNode,
    VitalsSource,
};
use chorus_protocol::{
    ConsensusVoteRequest, ConsensusVoteResponse, MessageBus, MessagePayload, MessageType,
    SharedMetric,
};

use crate::music;
use crate::types::{ConsensusConfig, ConsensusResult, ConsensusStats, RoundPhase, NO_LEADER};

/// Read-only view of the peer cache. The discovery loop owns the cache;
/// consensus only ever snapshots it.
pub trait PeerView: Send + Sync {
    fn known_peers(&self) -> Vec<SwarmNode>;
}

/// Aesthetic input from the emergence layer.
pub trait BeautySource: Send + Sync {
    /// Collective harmony of this coordinator's own patterns.
    fn self_harmony(&self) -> f64;
    /// Mean harmony of a peer's known remote patterns.
    fn peer_harmony(&self, node_id: &str) -> Option<f64>;
}

/// Deterministic vote signature: `sha256("vote:" voter ":" candidate ":" timestamp)`.
pub fn vote_signature(voter: &str, candidate: &str, timestamp: i64) -> String {
    sha256_hex(format!("vote:{voter}:{candidate}:{timestamp}").as_bytes())
}

/// A vote counts only if its signature recomputes exactly.
pub fn verify_vote(response: &ConsensusVoteResponse) -> bool {
    vote_signature(&response.voter.id, &response.candidate, response.timestamp)
        == response.signature
}

/// The shared-metric vote rule: highest final score, ties broken by
/// ascending node id. Every voter runs this over the same table.
pub fn best_candidate(metrics: &HashMap<String, SharedMetric>) -> Option<String> {
    metrics
        .values()
        .max_by(|a, b| {
            a.final_score
                .total_cmp(&b.final_score)
                .then_with(|| b.node_id.cmp(&a.node_id))
        })
        .map(|m| m.node_id.clone())
}

struct CachedRound {
    result: ConsensusResult,
    at: Instant,
    membership: String,
}

pub struct HarmonicConsensus {
    me: Weak<HarmonicConsensus>,
    node: NodeId,
    config: ConsensusConfig,
    vitals: Arc<VitalsSource>,
    soul: Arc<DigitalSoul>,
    peers: Arc<dyn PeerView>,
    beauty: Arc<dyn BeautySource>,
    bus: MessageBus,
    audit: Arc<dyn MutationAudit>,
    rounds: DashMap<String, mpsc::UnboundedSender<ConsensusVoteResponse>>,
    cache: Mutex<Option<CachedRound>>,
    phase: Mutex<RoundPhase>,
    rounds_run: AtomicU64,
    cache_hits: AtomicU64,
    votes_cast: AtomicU64,
    votes_verified: AtomicU64,
    votes_discarded: AtomicU64,
    read_only_rounds: AtomicU64,
}

impl HarmonicConsensus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: NodeId,
        config: ConsensusConfig,
        vitals: Arc<VitalsSource>,
        soul: Arc<DigitalSoul>,
        peers: Arc<dyn PeerView>,
        beauty: Arc<dyn BeautySource>,
        bus: MessageBus,
        audit: Arc<dyn MutationAudit>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node,
            config,
            vitals,
            soul,
            peers,
            beauty,
            bus,
            audit,
            rounds: DashMap::new(),
            cache: Mutex::new(None),
            phase: Mutex::new(RoundPhase::Idle),
            rounds_run: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            votes_cast: AtomicU64::new(0),
            votes_verified: AtomicU64::new(0),
            votes_discarded: AtomicU64::new(0),
            read_only_rounds: AtomicU64::new(0),
        })
    }

    /// Register the voter and the response router on the bus.
    pub fn start(&self) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        // Voter: compute the candidate from the request's own metrics
        // table, never from local state, and answer with a signed vote.
        self.bus
            .register_fn(MessageType::SwarmConsensusVoteRequest, move |message| {
                let engine = Arc::clone(&engine);
                async move {
                    if let MessagePayload::VoteRequest(request) = message.payload {
                        engine.answer_vote_request(request).await?;
                    }
                    Ok(())
                }
            });

        // Response router: resolve into the pending round, discard late
        // votes for rounds that already closed.
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        self.bus
            .register_fn(MessageType::SwarmConsensusVoteResponse, move |message| {
                let engine = Arc::clone(&engine);
                async move {
                    if let MessagePayload::VoteResponse(response) = message.payload {
                        match engine.rounds.get(&response.consensus_id) {
                            Some(round) => {
                                let _ = round.send(response);
                            }
                            None => {
                                debug!(
                                    voter = %response.voter.id,
                                    consensus = %response.consensus_id,
                                    "discarding vote for a closed round"
                                );
                            }
                        }
                    }
                    Ok(())
                }
            });
        info!(node = %self.node.id, "harmonic consensus engine started");
    }

    pub fn stop(&self) {
        self.rounds.clear();
    }

    async fn answer_vote_request(&self, request: ConsensusVoteRequest) -> Result<()> {
        let candidate = match best_candidate(&request.node_metrics) {
            Some(candidate) => candidate,
            None => request.requester.id.clone(),
        };
        let timestamp = now_ms();
        let response = ConsensusVoteResponse {
            voter: self.node.clone(),
            consensus_id: request.consensus_id.clone(),
            candidate: candidate.clone(),
            signature: vote_signature(&self.node.id, &candidate, timestamp),
            timestamp,
        };
        self.votes_cast.fetch_add(1, Ordering::Relaxed);
        debug!(candidate = %candidate, consensus = %request.consensus_id, "casting vote");
        self.bus
            .send(
                &request.requester.id,
                MessagePayload::VoteResponse(response),
                Priority::Critical,
            )
            .await?;
        Ok(())
    }

    /// Run one consensus round. Repeated callers inside the cache window
    /// get the previous result as long as membership is unchanged.
    pub async fn run_round(&self) -> Result<ConsensusResult> {
        let peers: Vec<SwarmNode> = self
            .peers
            .known_peers()
            .into_iter()
            .filter(|p| p.status == PeerStatus::Active)
            .collect();
        let mut known_ids: Vec<String> = peers.iter().map(|p| p.node_id.id.clone()).collect();
        known_ids.sort();
        let membership = sha256_hex(known_ids.join(",").as_bytes());

        if let Some(result) = self.cached(&membership) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(result);
        }

        *self.phase.lock() = RoundPhase::CollectingMetrics;
        self.rounds_run.fetch_add(1, Ordering::Relaxed);
        let consensus_id = Uuid::new_v4().to_string();
        let started = now_ms();

        // Shared metrics for the whole set, self included.
        let mut metrics: HashMap<String, SharedMetric> = HashMap::new();
        metrics.insert(
            self.node.id.clone(),
            SharedMetric::compose(
                &self.node.id,
                self.self_health_score(),
                self.beauty.self_harmony(),
                started,
            ),
        );
        for peer in &peers {
            let id = &peer.node_id.id;
            metrics.insert(
                id.clone(),
                SharedMetric::compose(
                    id,
                    Self::peer_health_score(peer),
                    self.beauty.peer_harmony(id).unwrap_or(0.0),
                    started,
                ),
            );
        }

        let total_nodes = peers.len() + 1;
        let quorum_size = total_nodes / 2 + 1;

        let own_candidate =
            best_candidate(&metrics).unwrap_or_else(|| self.node.id.clone());

        *self.phase.lock() = RoundPhase::Voting;
        let (sender, mut receiver) = mpsc::unbounded_channel();
        self.rounds.insert(consensus_id.clone(), sender);

        let request = ConsensusVoteRequest {
            consensus_id: consensus_id.clone(),
            requester: self.node.clone(),
            known_nodes: known_ids.clone(),
            node_metrics: metrics.clone(),
            timestamp: started,
        };
        if let Err(error) = self
            .bus
            .broadcast(MessagePayload::VoteRequest(request), Priority::Critical)
            .await
        {
            // A partitioned single node still completes its own round.
            warn!(%error, "vote request broadcast failed");
        }

        *self.phase.lock() = RoundPhase::Tallying;
        let mut votes: HashMap<String, String> = HashMap::new();
        votes.insert(self.node.id.clone(), own_candidate.clone());
        self.votes_cast.fetch_add(1, Ordering::Relaxed);

        let known: HashSet<&String> = known_ids.iter().collect();
        let deadline = tokio::time::Instant::now() + self.config.vote_collection_timeout;
        while votes.len() < total_nodes {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv()).await {
                Ok(Some(response)) => {
                    if !self.admit_vote(&response, &known, &metrics).await {
                        continue;
                    }
                    if votes.contains_key(&response.voter.id) {
                        continue;
                    }
                    votes.insert(response.voter.id.clone(), response.candidate.clone());
                    self.votes_verified.fetch_add(1, Ordering::Relaxed);
                }
                _ => break,
            }
        }
        self.rounds.remove(&consensus_id);

        let result =
            self.finalize(consensus_id, &peers, metrics, votes, total_nodes, quorum_size);
        self.vitals.mark_consensus(result.timestamp);
        *self.cache.lock() = Some(CachedRound {
            result: result.clone(),
            at: Instant::now(),
            membership,
        });
        Ok(result)
    }

    /// Verify one response; forged or out-of-set votes never reach the
    /// tally and leave an integrity-violation audit record.
    async fn admit_vote(
        &self,
        response: &ConsensusVoteResponse,
        known: &HashSet<&String>,
        metrics: &HashMap<String, SharedMetric>,
    ) -> bool {
        let voter = &response.voter.id;
        let valid = verify_vote(response)
            && known.contains(voter)
            && metrics.contains_key(&response.candidate);
        if !valid {
            self.votes_discarded.fetch_add(1, Ordering::Relaxed);
            warn!(voter = %voter, "discarding unverified vote");
            if let Err(error) = self
                .audit
                .log_integrity_violation(
                    "consensus-vote",
                    voter,
                    json!({
                        "consensus_id": response.consensus_id,
                        "candidate": response.candidate,
                        "reason": "signature or membership verification failed",
                    }),
                )
                .await
            {
                debug!(%error, "vote audit failed");
            }
            return false;
        }
        true
    }

    fn finalize(
        &self,
        consensus_id: String,
        peers: &[SwarmNode],
        metrics: HashMap<String, SharedMetric>,
        votes: HashMap<String, String>,
        total_nodes: usize,
        quorum_size: usize,
    ) -> ConsensusResult {
        let votes_received = votes.len();
        let quorum_achieved = votes_received >= quorum_size;
        let approval_rate = votes_received as f64 / total_nodes as f64;
        let consensus_achieved =
            quorum_achieved && approval_rate >= self.config.consensus_threshold;

        let soul = self.soul.state();
        let signs = self.vitals.vital_signs(&soul);
        let vitals = self.vitals.snapshot();
        let chord = music::project(total_nodes, &signs, &vitals);
        let timestamp = now_ms();

        if !quorum_achieved {
            // Read-only fallback: no leader-authoritative writes may
            // proceed until a later round reaches quorum.
            self.read_only_rounds.fetch_add(1, Ordering::Relaxed);
            *self.phase.lock() = RoundPhase::ReadOnly;
            info!(
                votes_received,
                quorum_size, "quorum not reached, entering read-only mode"
            );
            return ConsensusResult {
                consensus_id,
                leader: NO_LEADER.to_string(),
                is_leader_self: false,
                total_nodes: total_nodes as u32,
                consensus_achieved: false,
                quorum_achieved: false,
                quorum_size: quorum_size as u32,
                votes_received: votes_received as u32,
                approval_rate,
                read_only_mode: true,
                dominant_note: chord.note,
                frequency_hz: chord.frequency_hz,
                harmonic_score: 0.0,
                chord_stability: 0.0,
                rationale: format!(
                    "{votes_received} of {quorum_size} required votes; swarm degraded to read-only"
                ),
                timestamp,
            };
        }

        // Tally verified votes; ties break toward the ascending id.
        let mut tally: HashMap<&String, usize> = HashMap::new();
        for candidate in votes.values() {
            *tally.entry(candidate).or_insert(0) += 1;
        }
        let mut winner = tally
            .iter()
            .max_by(|(a_id, a_count), (b_id, b_count)| {
                a_count.cmp(b_count).then_with(|| b_id.cmp(a_id))
            })
            .map(|(id, _)| (*id).clone())
            .unwrap_or_else(|| self.node.id.clone());

        // The winner must still look alive; otherwise fall back to the
        // best locally-scored node.
        let mut rationale = format!(
            "elected by {} of {} verified votes",
            tally.get(&winner).copied().unwrap_or(0),
            votes_received
        );
        if winner != self.node.id {
            let live_health = peers
                .iter()
                .find(|p| p.node_id.id == winner)
                .map(Self::peer_health_score)
                .unwrap_or(0.0);
            if live_health < self.config.min_leader_health {
                let fallback_metrics: HashMap<String, SharedMetric> = metrics
                    .iter()
                    .filter(|(id, _)| **id != winner)
                    .map(|(id, m)| (id.clone(), m.clone()))
                    .collect();
                if let Some(fallback) = best_candidate(&fallback_metrics) {
                    rationale = format!(
                        "elected candidate {winner} failed live health validation ({live_health:.2}); \
                         fell back to best-scored node {fallback}"
                    );
                    winner = fallback;
                }
            }
        }

        let is_leader_self = winner == self.node.id;
        *self.phase.lock() = RoundPhase::Committed;
        info!(
            leader = %winner,
            votes_received,
            note = chord.note.as_str(),
            "consensus round committed"
        );

        ConsensusResult {
            consensus_id,
            leader: winner,
            is_leader_self,
            total_nodes: total_nodes as u32,
            consensus_achieved,
            quorum_achieved,
            quorum_size: quorum_size as u32,
            votes_received: votes_received as u32,
            approval_rate,
            read_only_mode: false,
            dominant_note: chord.note,
            frequency_hz: chord.frequency_hz,
            harmonic_score: chord.harmonic_score,
            chord_stability: chord.chord_stability,
            rationale,
            timestamp,
        }
    }

    /// `0.4·(1−cpu) + 0.3·(1−mem) + 0.1·conn + 0.1·latency + 0.1·errors`.
    fn self_health_score(&self) -> f64 {
        let vitals = self.vitals.snapshot();
        let latency = self.vitals.latency_ms();
        let errors = self.vitals.error_rate();
        0.4 * (1.0 - vitals.load.cpu)
            + 0.3 * (1.0 - vitals.load.memory)
            + 0.1 * (vitals.connections as f64 / 100.0).min(1.0)
            + 0.1 * (1.0 - latency / 1000.0).max(0.0)
            + 0.1 * (1.0 - (errors / 10.0).min(1.0))
    }

    /// Cached vitals blend for a peer: half load, half categorical
    /// health. Floors at 0.1 so missing data is never fabricated upward.
    fn peer_health_score(peer: &SwarmNode) -> f64 {
        let blend = 0.5 * (1.0 - peer.vitals.load.mean()) + 0.5 * peer.vitals.health.score();
        blend.max(0.1)
    }

    fn cached(&self, membership: &str) -> Option<ConsensusResult> {
        let cache = self.cache.lock();
        cache.as_ref().and_then(|cached| {
            let fresh = cached.at.elapsed() < self.config.cache_ttl;
            (fresh && cached.membership == membership).then(|| cached.result.clone())
        })
    }

    /// Drop the cached result; the next caller runs a fresh round.
    pub fn invalidate_cache(&self) {
        *self.cache.lock() = None;
    }

    pub fn phase(&self) -> RoundPhase {
        *self.phase.lock()
    }

    pub fn stats(&self) -> ConsensusStats {
        ConsensusStats {
            rounds_run: self.rounds_run.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            votes_cast: self.votes_cast.load(Ordering::Relaxed),
            votes_verified: self.votes_verified.load(Ordering::Relaxed),
            votes_discarded: self.votes_discarded.load(Ordering::Relaxed),
            read_only_rounds: self.read_only_rounds.load(Ordering::Relaxed),
        }
    }
}
