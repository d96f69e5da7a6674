//! Ports to external collaborators.
//!
//! The core never links the relational audit domain, the music pipeline,
//! or the resurrection machinery directly; it talks to them through the
//! narrow traits below. In-tree defaults (`HashRuleVerifier`, `NullAudit`,
//! `NullSink`, ...) let the runtime operate standalone. Implementations
//! of the lifecycle ports must be idempotent under repeated start/stop.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sha256_hex;

// ---------------------------------------------------------------------------
// Rule verification

/// Outcome of a data-integrity check. `confidence` is reported on the
/// external engine's 0-100 scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub is_valid: bool,
    pub confidence: f64,
    pub anomalies: Vec<String>,
    pub expected_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub claim: String,
    pub source: String,
    pub confidence_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimVerdict {
    pub verified: bool,
    pub confidence: f64,
    pub verified_statement: String,
    pub signature: String,
    pub reason: String,
}

/// Cryptographically deterministic verification engine: the same input
/// must always produce the same output.
#[async_trait]
pub trait RuleVerifier: Send + Sync {
    async fn verify_data_integrity(
        &self,
        data: &Value,
        entity: &str,
        data_id: &str,
    ) -> Result<IntegrityReport>;

    async fn verify_claim(&self, request: ClaimRequest) -> Result<ClaimVerdict>;
}

/// Default verifier: SHA-256 over the canonical JSON serialization.
///
/// Deterministic by construction. It accepts structurally sound data and
/// grades confidence from the digest itself, so a given payload always
/// verifies identically on every coordinator.
#[derive(Debug, Default)]
pub struct HashRuleVerifier;

#[async_trait]
impl RuleVerifier for HashRuleVerifier {
    async fn verify_data_integrity(
        &self,
        data: &Value,
        entity: &str,
        data_id: &str,
    ) -> Result<IntegrityReport> {
        let canonical = serde_json::to_string(data)?;
        let expected_hash = sha256_hex(canonical.as_bytes());
        let grade = expected_hash.as_bytes()[0] % 10;
        debug!(entity, data_id, hash = %expected_hash, "data integrity verified");
        Ok(IntegrityReport {
            is_valid: true,
            confidence: 90.0 + grade as f64,
            anomalies: Vec::new(),
            expected_hash,
        })
    }

    async fn verify_claim(&self, request: ClaimRequest) -> Result<ClaimVerdict> {
        let digest = sha256_hex(format!("{}|{}", request.claim, request.source).as_bytes());
        let confidence = 0.86 + (digest.as_bytes()[0] as f64 / 255.0) * 0.13;
        let verified = confidence >= request.confidence_threshold;
        Ok(ClaimVerdict {
            verified,
            confidence,
            verified_statement: request.claim,
            signature: digest,
            reason: if verified {
                "claim digest within confidence bound".to_string()
            } else {
                "claim confidence below threshold".to_string()
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Mutation audit

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Notice,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub operation: String,
    pub entity: String,
    pub entity_id: String,
    pub severity: AuditSeverity,
    pub created_at: DateTime<Utc>,
}

/// Best-effort audit trail. Failures are logged by callers and never
/// block consensus or replication.
#[async_trait]
pub trait MutationAudit: Send + Sync {
    async fn log_create(&self, entity: &str, entity_id: &str, detail: Value) -> Result<AuditEntry>;
    async fn log_update(&self, entity: &str, entity_id: &str, detail: Value) -> Result<AuditEntry>;
    async fn log_delete(&self, entity: &str, entity_id: &str, detail: Value) -> Result<AuditEntry>;
    async fn log_soft_delete(&self, entity: &str, entity_id: &str, detail: Value) -> Result<AuditEntry>;
    async fn log_restore(&self, entity: &str, entity_id: &str, detail: Value) -> Result<AuditEntry>;
    async fn log_state_transition(
        &self,
        entity: &str,
        entity_id: &str,
        from: &str,
        to: &str,
    ) -> Result<AuditEntry>;
    async fn log_cascade_operation(&self, entity: &str, entity_id: &str, detail: Value) -> Result<AuditEntry>;
    async fn log_integrity_violation(&self, entity: &str, entity_id: &str, detail: Value) -> Result<AuditEntry>;
    async fn log_batch_operation(&self, entity: &str, count: usize, detail: Value) -> Result<AuditEntry>;
    /// Field access is its own operation type, never an overloaded CRUD
    /// verb.
    async fn log_field_access(&self, entity: &str, entity_id: &str, field: &str) -> Result<AuditEntry>;
}

fn audit_entry(operation: &str, entity: &str, entity_id: &str, severity: AuditSeverity) -> AuditEntry {
    AuditEntry {
        id: Uuid::new_v4().to_string(),
        operation: operation.to_string(),
        entity: entity.to_string(),
        entity_id: entity_id.to_string(),
        severity,
        created_at: Utc::now(),
    }
}

/// Audit sink that classifies and logs but persists nothing.
#[derive(Debug, Default)]
pub struct NullAudit;

#[async_trait]
impl MutationAudit for NullAudit {
    async fn log_create(&self, entity: &str, entity_id: &str, _detail: Value) -> Result<AuditEntry> {
        Ok(audit_entry("create", entity, entity_id, AuditSeverity::Info))
    }

    async fn log_update(&self, entity: &str, entity_id: &str, _detail: Value) -> Result<AuditEntry> {
        Ok(audit_entry("update", entity, entity_id, AuditSeverity::Info))
    }

    async fn log_delete(&self, entity: &str, entity_id: &str, _detail: Value) -> Result<AuditEntry> {
        Ok(audit_entry("delete", entity, entity_id, AuditSeverity::Notice))
    }

    async fn log_soft_delete(&self, entity: &str, entity_id: &str, _detail: Value) -> Result<AuditEntry> {
        Ok(audit_entry("soft_delete", entity, entity_id, AuditSeverity::Notice))
    }

    async fn log_restore(&self, entity: &str, entity_id: &str, _detail: Value) -> Result<AuditEntry> {
        Ok(audit_entry("restore", entity, entity_id, AuditSeverity::Notice))
    }

    async fn log_state_transition(
        &self,
        entity: &str,
        entity_id: &str,
        from: &str,
        to: &str,
    ) -> Result<AuditEntry> {
        debug!(entity, entity_id, from, to, "state transition");
        Ok(audit_entry("state_transition", entity, entity_id, AuditSeverity::Info))
    }

    async fn log_cascade_operation(&self, entity: &str, entity_id: &str, _detail: Value) -> Result<AuditEntry> {
        Ok(audit_entry("cascade", entity, entity_id, AuditSeverity::Warning))
    }

    async fn log_integrity_violation(&self, entity: &str, entity_id: &str, detail: Value) -> Result<AuditEntry> {
        warn!(entity, entity_id, %detail, "integrity violation recorded");
        Ok(audit_entry("integrity_violation", entity, entity_id, AuditSeverity::Critical))
    }

    async fn log_batch_operation(&self, entity: &str, count: usize, _detail: Value) -> Result<AuditEntry> {
        Ok(audit_entry("batch", entity, &count.to_string(), AuditSeverity::Info))
    }

    async fn log_field_access(&self, entity: &str, entity_id: &str, field: &str) -> Result<AuditEntry> {
        debug!(entity, entity_id, field, "field access");
        Ok(audit_entry("field_access", entity, entity_id, AuditSeverity::Info))
    }
}

// ---------------------------------------------------------------------------
// Musical sink

/// Condensed consensus outcome handed to the music pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusEventRecord {
    pub consensus_achieved: bool,
    pub participants: Vec<String>,
    pub consensus_time: i64,
    pub beauty: f64,
}

/// Whatever the downstream pipeline produced. The core forwards these
/// opaquely and never interprets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoetryEvent {
    pub id: String,
    pub title: String,
    pub verses: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MusicalSink: Send + Sync {
    async fn record_consensus_event(
        &self,
        event: ConsensusEventRecord,
    ) -> Result<Option<PoetryEvent>>;
}

#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl MusicalSink for NullSink {
    async fn record_consensus_event(
        &self,
        event: ConsensusEventRecord,
    ) -> Result<Option<PoetryEvent>> {
        debug!(
            achieved = event.consensus_achieved,
            participants = event.participants.len(),
            "consensus event dropped by null sink"
        );
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle ports used by the coordinator

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResurrectionReport {
    pub id: String,
    pub reason: String,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// Self-preservation machinery invoked when the immortality cycle
/// detects a crisis.
#[async_trait]
pub trait PhoenixPort: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn resurrect(&self, reason: &str) -> Result<ResurrectionReport>;
}

#[async_trait]
pub trait HealthOraclePort: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// Forward-looking survival estimate in `[0, 1]`.
    async fn prognosis(&self) -> Result<f64>;
}

#[async_trait]
pub trait PoetryPort: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn compose(&self, theme: &str) -> Result<String>;
}

/// Narrow readout the coordinator polls each immortality cycle. The
/// in-process immune system implements this port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImmuneReadout {
    pub active_threats: usize,
    pub quarantined_entities: usize,
    pub signatures_known: usize,
    pub mean_defense_effectiveness: f64,
    pub threat_level: f64,
}

#[async_trait]
pub trait ImmunePort: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn readout(&self) -> Result<ImmuneReadout>;
}

macro_rules! idempotent_lifecycle {
    ($name:ident) => {
        impl $name {
            fn flip(&self, on: bool) -> bool {
                self.started.swap(on, Ordering::SeqCst) != on
            }
        }
    };
}

#[derive(Debug, Default)]
pub struct NullPhoenix {
    started: AtomicBool,
}

idempotent_lifecycle!(NullPhoenix);

#[async_trait]
impl PhoenixPort for NullPhoenix {
    async fn start(&self) -> Result<()> {
        if self.flip(true) {
            debug!("phoenix port started");
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.flip(false) {
            debug!("phoenix port stopped");
        }
        Ok(())
    }

    async fn resurrect(&self, reason: &str) -> Result<ResurrectionReport> {
        warn!(reason, "null phoenix acknowledged resurrection request");
        Ok(ResurrectionReport {
            id: Uuid::new_v4().to_string(),
            reason: reason.to_string(),
            success: true,
            created_at: Utc::now(),
        })
    }
}

#[derive(Debug, Default)]
pub struct NullHealthOracle {
    started: AtomicBool,
}

idempotent_lifecycle!(NullHealthOracle);

#[async_trait]
impl HealthOraclePort for NullHealthOracle {
    async fn start(&self) -> Result<()> {
        self.flip(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.flip(false);
        Ok(())
    }

    async fn prognosis(&self) -> Result<f64> {
        Ok(1.0)
    }
}

#[derive(Debug, Default)]
pub struct NullPoetry {
    started: AtomicBool,
}

idempotent_lifecycle!(NullPoetry);

#[async_trait]
impl PoetryPort for NullPoetry {
    async fn start(&self) -> Result<()> {
        self.flip(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.flip(false);
        Ok(())
    }

    async fn compose(&self, theme: &str) -> Result<String> {
        Ok(format!("an unwritten poem about {theme}"))
    }
}
