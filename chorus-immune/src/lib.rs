//! # Chorus Immune System
//!
//! Continuous threat scanning, immune memory, quarantine zones, and
//! adaptive defenses.
//!
//! Every sweep derives a threat level from the local vitals
//! (`(cpu + memory + system load) / 3`); levels above the detection
//! threshold become a [`DetectedThreat`] whose severity maps through
//! fixed cutoffs. A detected threat is first matched against immune
//! memory — a close-enough past encounter (weighted marker overlap at
//! or above 0.8) replays the response that worked before and reinforces
//! that memory. New threats pick their response by severity: critical
//! isolates, high neutralizes, medium adapts, low observes.
//!
//! All responses run behind a circuit breaker: a failing response path
//! trips the breaker and responses are skipped while the scanner keeps
//! sweeping. Bookkeeping is bounded everywhere — three adaptation
//! records per memory, five active quarantine zones, twenty threat
//! signatures — and quarantined entities auto-release when their zone's
//! TTL lapses. Quarantined peers stay readable but are excluded from
//! consensus and replication until release.
//!
//! The coordinator polls the whole system through the narrow
//! `ImmunePort` readout and can inject threats it observed elsewhere
//! (failed identity challenges, integrity violations) via
//! [`ImmuneSystem::handle_threat`].

pub mod system;
pub mod types;

pub use system::{ImmuneConfig, ImmuneStats, ImmuneSystem};
pub use types::{
    ActivationCondition, AdaptationRecord, AdaptiveDefense, BehavioralMarker, DefenseAction,
    DefenseKind, DefenseMechanism, DetectedThreat, ImmuneMemory, ImmuneResponse, QuarantineZone,
    ResponseAction, ThreatCategory, ThreatSeverity, ThreatSignature,
};
