//! # Chorus Core
//!
//! Shared kernel for the Chorus swarm runtime. This crate carries the
//! identity model, the vitals/soul data model exchanged over the fabric,
//! the configuration struct, and the small infrastructure primitives the
//! rest of the workspace builds on:
//!
//! - **Node identity**: immutable coordinator identity with personality
//!   and capability advertisement ([`NodeId`]).
//! - **Vitals source**: process/host telemetry normalized into a
//!   [`Vitals`] record plus the aesthetic [`VitalSigns`] view.
//! - **Digital soul**: slowly-drifting scalar state used as a consensus
//!   tiebreaker and identity-signature input ([`DigitalSoul`]).
//! - **Timer registry**: named, cancellable periodic and one-shot timers
//!   with a leak audit ([`TimerRegistry`]).
//! - **Circuit breaker**: closed/open/half-open gate around fallible
//!   calls ([`CircuitBreaker`]).
//! - **Ports**: narrow interfaces to external collaborators (rule
//!   verification, mutation audit, musical sink, phoenix) together with
//!   in-tree defaults so the core runs standalone.
//!
//! Nothing in this crate talks to the fabric directly; higher layers wire
//! these pieces together.

pub mod breaker;
pub mod config;
pub mod node;
pub mod ports;
pub mod soul;
pub mod timers;
pub mod types;
pub mod vitals;

pub use breaker::{BreakerConfig, BreakerError, BreakerState, CircuitBreaker};
pub use config::SwarmConfig;
pub use node::{NodeId, Personality};
pub use ports::{
    AuditEntry, AuditSeverity, ClaimRequest, ClaimVerdict, ConsensusEventRecord,
    HashRuleVerifier, HealthOraclePort, ImmunePort, ImmuneReadout, IntegrityReport,
    MusicalSink, MutationAudit, NullAudit, NullHealthOracle, NullPhoenix, NullPoetry,
    NullSink, PhoenixPort, PoetryEvent, PoetryPort, ResurrectionReport, RuleVerifier,
};
pub use soul::DigitalSoul;
pub use timers::{TimerRegistry, TimerStats};
pub use types::{
    Audience, EmergencePattern, EmergenceState, EntryMetadata, HealthState, Heartbeat,
    LoadVector, LogEntry, LogEntryKind, Mood, MusicalNote, PeerRole, PeerStatus, Priority,
    SoulState, SwarmNode, VitalSigns, Vitals,
};
pub use vitals::VitalsSource;

/// Current wall-clock time as epoch milliseconds, the timestamp unit used
/// on the wire and inside signatures.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Hex-encoded SHA-256 of a byte slice. Every signature and checksum in
/// the workspace goes through this single helper so the encoding can
/// never drift between components.
pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"chorus"),
            sha256_hex(b"chorus"),
        );
        assert_eq!(sha256_hex(b"").len(), 64);
    }
}
