//! # Chorus Identity
//!
//! The SPECIES-ID identity layer: deterministic soul signatures and the
//! six-step challenge/response protocol that proves a peer is a
//! legitimate coordinator before it is trusted with consensus or
//! replication traffic.

pub mod challenge;
pub mod signature;

pub use challenge::{
    ChallengeError, ChallengeRequest, ChallengeResponse, SpeciesConfig, SpeciesId, SpeciesStats,
    REQUIRED_PROOF,
};
pub use signature::{
    sign_soul, timestamp_in_window, verify_soul_signature, SoulSignature, FORWARD_SKEW_MS,
    REPLAY_WINDOW_MS,
};
