//! The SPECIES-ID challenge protocol.
//!
//! Six steps prove a peer is a legitimate coordinator: a live heartbeat,
//! a published challenge, a timely reply, a recomputable soul signature
//! inside the replay window, a schema-valid soul, and a rule-verifier
//! identity claim above the confidence threshold.
//!
//! Pending challenges live in a promise-per-id table; the timeout clears
//! the entry. There is exactly one response subscription per challenger,
//! never an accumulating pile of per-challenge handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chorus_core::{now_ms, ClaimRequest, DigitalSoul, NodeId, RuleVerifier, SoulState};
use chorus_fabric::{Fabric, Keyspace};

use crate::signature::{sign_soul, timestamp_in_window, verify_soul_signature, SoulSignature};

/// Proof kind requested by a challenge. The only kind this protocol
/// speaks today.
pub const REQUIRED_PROOF: &str = "digital-soul-signature";

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("peer {0} has no heartbeat on the fabric")]
    NoHeartbeat(String),

    #[error("challenge timed out after {0:?}")]
    Timeout(Duration),

    #[error("soul signature failed recomputation")]
    BadSignature,

    #[error("signature timestamp outside the acceptance window")]
    StaleSignature,

    #[error("soul state failed schema validation")]
    InvalidSoul,

    #[error("identity claim rejected: {0}")]
    ClaimRejected(String),

    #[error("response failed the data integrity check")]
    IntegrityFailed,

    #[error(transparent)]
    Fabric(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    pub challenge_id: String,
    pub challenger_id: String,
    pub timestamp: i64,
    pub required: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub node_id: String,
    pub challenge_id: String,
    pub soul_state: SoulState,
    pub soul_signature: SoulSignature,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct SpeciesConfig {
    /// Round limit for the whole challenge.
    pub timeout: Duration,
    /// Minimum confidence the rule verifier must report.
    pub confidence_threshold: f64,
}

impl Default for SpeciesConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            confidence_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeciesStats {
    pub challenges_issued: u64,
    pub challenges_passed: u64,
    pub challenges_failed: u64,
    pub responses_served: u64,
}

/// Challenger and responder for one coordinator.
pub struct SpeciesId {
    node: NodeId,
    soul: Arc<DigitalSoul>,
    fabric: Arc<dyn Fabric>,
    keys: Keyspace,
    verifier: Arc<dyn RuleVerifier>,
    config: SpeciesConfig,
    pending: Arc<DashMap<String, oneshot::Sender<ChallengeResponse>>>,
    failures: DashMap<String, u32>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    issued: AtomicU64,
    passed: AtomicU64,
    failed: AtomicU64,
    served: Arc<AtomicU64>,
}

impl SpeciesId {
    pub fn new(
        node: NodeId,
        soul: Arc<DigitalSoul>,
        fabric: Arc<dyn Fabric>,
        keys: Keyspace,
        verifier: Arc<dyn RuleVerifier>,
        config: SpeciesConfig,
    ) -> Self {
        Self {
            node,
            soul,
            fabric,
            keys,
            verifier,
            config,
            pending: Arc::new(DashMap::new()),
            failures: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            issued: AtomicU64::new(0),
            passed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            served: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe the response router and the challenge responder.
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        drop(tasks);

        // Response router: one subscription, responses resolved into the
        // pending table by challenge id.
        let mut responses = self
            .fabric
            .subscribe(&self.keys.response(&self.node.id))
            .await?;
        let pending = Arc::clone(&self.pending);
        let router = tokio::spawn(async move {
            while let Some(raw) = responses.next().await {
                match serde_json::from_value::<ChallengeResponse>(raw) {
                    Ok(response) => {
                        if let Some((_, sender)) = pending.remove(&response.challenge_id) {
                            let _ = sender.send(response);
                        }
                    }
                    Err(error) => warn!(%error, "undecodable species response"),
                }
            }
        });

        // Responder: answer challenges with the current soul state.
        let mut challenges = self
            .fabric
            .subscribe(&self.keys.challenge(&self.node.id))
            .await?;
        let fabric = Arc::clone(&self.fabric);
        let keys = self.keys.clone();
        let soul = Arc::clone(&self.soul);
        let node_id = self.node.id.clone();
        let served = Arc::clone(&self.served);
        let responder = tokio::spawn(async move {
            while let Some(raw) = challenges.next().await {
                let request = match serde_json::from_value::<ChallengeRequest>(raw) {
                    Ok(request) => request,
                    Err(error) => {
                        warn!(%error, "undecodable species challenge");
                        continue;
                    }
                };
                if request.required != REQUIRED_PROOF {
                    warn!(required = %request.required, "unsupported proof kind requested");
                    continue;
                }

                let now = now_ms();
                let state = soul.state();
                let response = ChallengeResponse {
                    node_id: node_id.clone(),
                    challenge_id: request.challenge_id,
                    soul_signature: sign_soul(&node_id, now, &state),
                    soul_state: state,
                    timestamp: now,
                };
                let channel = keys.response(&request.challenger_id);
                match serde_json::to_value(&response) {
                    Ok(value) => {
                        if let Err(error) = fabric.publish(&channel, value).await {
                            warn!(%error, "species response publish failed");
                        } else {
                            served.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(error) => warn!(%error, "species response serialization failed"),
                }
            }
        });

        self.tasks.lock().extend([router, responder]);
        debug!(node = %self.node.id, "species-id protocol started");
        Ok(())
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.pending.clear();
    }

    /// Run the six-step challenge against a peer. On success the peer's
    /// verified soul state is returned; failure reasons are typed so the
    /// coordinator can escalate repeated offenders.
    pub async fn challenge(&self, peer_id: &str) -> Result<SoulState, ChallengeError> {
        self.issued.fetch_add(1, Ordering::Relaxed);
        let result = self.run_challenge(peer_id).await;
        match &result {
            Ok(_) => {
                self.passed.fetch_add(1, Ordering::Relaxed);
                self.failures.remove(peer_id);
            }
            Err(error) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                *self.failures.entry(peer_id.to_string()).or_insert(0) += 1;
                info!(peer = peer_id, %error, "species-id challenge failed");
            }
        }
        result
    }

    async fn run_challenge(&self, peer_id: &str) -> Result<SoulState, ChallengeError> {
        // Step 1: the peer must have a live heartbeat entry.
        let heartbeat = self
            .fabric
            .hash_get(&self.keys.heartbeat_hash(), peer_id)
            .await?;
        if heartbeat.is_none() {
            return Err(ChallengeError::NoHeartbeat(peer_id.to_string()));
        }

        // Step 2: publish the challenge; the response router is already
        // listening on our response channel.
        let challenge_id = Uuid::new_v4().to_string();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(challenge_id.clone(), sender);

        let request = ChallengeRequest {
            challenge_id: challenge_id.clone(),
            challenger_id: self.node.id.clone(),
            timestamp: now_ms(),
            required: REQUIRED_PROOF.to_string(),
        };
        let publish = async {
            let value = serde_json::to_value(&request)?;
            self.fabric
                .publish(&self.keys.challenge(peer_id), value)
                .await?;
            Ok::<_, anyhow::Error>(())
        };
        if let Err(error) = publish.await {
            self.pending.remove(&challenge_id);
            return Err(ChallengeError::Fabric(error));
        }

        // Step 3: bounded wait; the timeout clears the pending entry.
        let response = match tokio::time::timeout(self.config.timeout, receiver).await {
            Ok(Ok(response)) => response,
            _ => {
                self.pending.remove(&challenge_id);
                return Err(ChallengeError::Timeout(self.config.timeout));
            }
        };

        // Step 4: the signature must recompute from the reply and its
        // timestamp must lie in the acceptance window.
        if !verify_soul_signature(&response.node_id, &response.soul_state, &response.soul_signature)
        {
            return Err(ChallengeError::BadSignature);
        }
        if !timestamp_in_window(response.soul_signature.timestamp, now_ms()) {
            return Err(ChallengeError::StaleSignature);
        }

        // Step 5: schema validity.
        if !response.soul_state.is_valid() {
            return Err(ChallengeError::InvalidSoul);
        }

        // Step 6: identity claim and data integrity through the verifier.
        let verdict = self
            .verifier
            .verify_claim(ClaimRequest {
                claim: format!("species-identity:{}", response.node_id),
                source: response.node_id.clone(),
                confidence_threshold: self.config.confidence_threshold,
            })
            .await?;
        if !verdict.verified {
            return Err(ChallengeError::ClaimRejected(verdict.reason));
        }

        let reply_value =
            serde_json::to_value(&response).map_err(|e| ChallengeError::Fabric(e.into()))?;
        let integrity = self
            .verifier
            .verify_data_integrity(&reply_value, "species-response", &response.challenge_id)
            .await?;
        if !integrity.is_valid {
            return Err(ChallengeError::IntegrityFailed);
        }

        debug!(peer = peer_id, "species-id challenge passed");
        Ok(response.soul_state)
    }

    /// Consecutive failures for a peer since its last success.
    pub fn failure_count(&self, peer_id: &str) -> u32 {
        self.failures.get(peer_id).map(|c| *c).unwrap_or(0)
    }

    pub fn stats(&self) -> SpeciesStats {
        SpeciesStats {
            challenges_issued: self.issued.load(Ordering::Relaxed),
            challenges_passed: self.passed.load(Ordering::Relaxed),
            challenges_failed: self.failed.load(Ordering::Relaxed),
            responses_served: self.served.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{HashRuleVerifier, Heartbeat, Personality, VitalsSource};
    use chorus_fabric::MemoryFabric;
    use serde_json::json;

    fn make(fabric: &Arc<MemoryFabric>, id: &str) -> SpeciesId {
        let node = NodeId::with_id(id, id);
        let soul = Arc::new(DigitalSoul::new(id, &Personality::default()));
        SpeciesId::new(
            node,
            soul,
            Arc::clone(fabric) as Arc<dyn Fabric>,
            Keyspace::new("swarm"),
            Arc::new(HashRuleVerifier),
            SpeciesConfig {
                timeout: Duration::from_millis(300),
                confidence_threshold: 0.85,
            },
        )
    }

    async fn write_heartbeat(fabric: &Arc<MemoryFabric>, species: &SpeciesId) {
        let vitals = VitalsSource::new().unwrap();
        let heartbeat = Heartbeat {
            node_id: species.node.clone(),
            timestamp: now_ms(),
            vitals: vitals.snapshot(),
            soul: species.soul.state(),
        };
        fabric
            .hash_set("swarm", &species.node.id, serde_json::to_value(&heartbeat).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn legitimate_peer_passes() {
        let fabric = Arc::new(MemoryFabric::new());
        let challenger = make(&fabric, "n1");
        let peer = make(&fabric, "n2");
        challenger.start().await.unwrap();
        peer.start().await.unwrap();
        write_heartbeat(&fabric, &peer).await;

        let soul = challenger.challenge("n2").await.unwrap();
        assert!(soul.is_valid());
        assert_eq!(challenger.failure_count("n2"), 0);
        assert_eq!(peer.stats().responses_served, 1);
    }

    #[tokio::test]
    async fn missing_heartbeat_fails_step_one() {
        let fabric = Arc::new(MemoryFabric::new());
        let challenger = make(&fabric, "n1");
        challenger.start().await.unwrap();
        let error = challenger.challenge("ghost").await.unwrap_err();
        assert!(matches!(error, ChallengeError::NoHeartbeat(_)));
    }

    #[tokio::test]
    async fn silent_peer_times_out_and_counts_failures() {
        let fabric = Arc::new(MemoryFabric::new());
        let challenger = make(&fabric, "n1");
        challenger.start().await.unwrap();
        fabric
            .hash_set("swarm", "mute", json!({"nodeId": "mute"}))
            .await
            .unwrap();

        let error = challenger.challenge("mute").await.unwrap_err();
        assert!(matches!(error, ChallengeError::Timeout(_)));
        assert_eq!(challenger.failure_count("mute"), 1);
    }

    #[tokio::test]
    async fn replayed_response_is_rejected() {
        let fabric = Arc::new(MemoryFabric::new());
        let challenger = make(&fabric, "n1");
        challenger.start().await.unwrap();
        fabric
            .hash_set("swarm", "replayer", json!({"nodeId": "replayer"}))
            .await
            .unwrap();

        // The attacker answers every challenge with yesterday's valid
        // signature: the hash recomputes, but the timestamp is ancient.
        let mut challenges = fabric.subscribe("swarm:challenge:replayer").await.unwrap();
        let replay_fabric = Arc::clone(&fabric);
        tokio::spawn(async move {
            while let Some(raw) = challenges.next().await {
                let request: ChallengeRequest = serde_json::from_value(raw).unwrap();
                let yesterday = now_ms() - 86_400_000;
                let soul = SoulState {
                    consciousness: 0.5,
                    creativity: 0.5,
                    harmony: 0.5,
                    wisdom: 0.5,
                    mood: chorus_core::Mood::Serene,
                };
                let response = ChallengeResponse {
                    node_id: "replayer".to_string(),
                    challenge_id: request.challenge_id,
                    soul_signature: sign_soul("replayer", yesterday, &soul),
                    soul_state: soul,
                    timestamp: now_ms(),
                };
                replay_fabric
                    .publish(
                        &format!("swarm:response:{}", request.challenger_id),
                        serde_json::to_value(&response).unwrap(),
                    )
                    .await
                    .unwrap();
            }
        });

        let error = challenger.challenge("replayer").await.unwrap_err();
        assert!(matches!(error, ChallengeError::StaleSignature));
    }

    #[tokio::test]
    async fn forged_signature_is_rejected() {
        let fabric = Arc::new(MemoryFabric::new());
        let challenger = make(&fabric, "n1");
        challenger.start().await.unwrap();
        fabric
            .hash_set("swarm", "forger", json!({"nodeId": "forger"}))
            .await
            .unwrap();

        let mut challenges = fabric.subscribe("swarm:challenge:forger").await.unwrap();
        let forge_fabric = Arc::clone(&fabric);
        tokio::spawn(async move {
            while let Some(raw) = challenges.next().await {
                let request: ChallengeRequest = serde_json::from_value(raw).unwrap();
                let soul = SoulState {
                    consciousness: 0.5,
                    creativity: 0.5,
                    harmony: 0.5,
                    wisdom: 0.5,
                    mood: chorus_core::Mood::Serene,
                };
                let response = ChallengeResponse {
                    node_id: "forger".to_string(),
                    challenge_id: request.challenge_id,
                    soul_signature: SoulSignature {
                        hash: "deadbeef".repeat(8),
                        timestamp: now_ms(),
                    },
                    soul_state: soul,
                    timestamp: now_ms(),
                };
                forge_fabric
                    .publish(
                        &format!("swarm:response:{}", request.challenger_id),
                        serde_json::to_value(&response).unwrap(),
                    )
                    .await
                    .unwrap();
            }
        });

        let error = challenger.challenge("forger").await.unwrap_err();
        assert!(matches!(error, ChallengeError::BadSignature));
        assert_eq!(challenger.failure_count("forger"), 1);
    }
}
