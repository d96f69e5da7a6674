//! Soul signatures.
//!
//! A soul signature is a deterministic SHA-256 over the node id, a
//! timestamp, and the four soul scalars plus mood. The signer commits to
//! the timestamp inside the hash, which is what makes replay detectable:
//! yesterday's signature recomputes correctly but carries yesterday's
//! timestamp.

use serde::{Deserialize, Serialize};

use chorus_core::{sha256_hex, SoulState};

/// How far in the past a signature timestamp may lie.
pub const REPLAY_WINDOW_MS: i64 = 30_000;

/// Allowed forward clock skew.
pub const FORWARD_SKEW_MS: i64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoulSignature {
    pub hash: String,
    pub timestamp: i64,
}

/// Canonical signing string. Scalars are fixed to six decimals so the
/// recomputation is bit-stable across peers.
fn signing_string(node_id: &str, timestamp: i64, soul: &SoulState) -> String {
    format!(
        "{}|{}|{:.6}|{:.6}|{:.6}|{:.6}|{}",
        node_id,
        timestamp,
        soul.consciousness,
        soul.creativity,
        soul.harmony,
        soul.wisdom,
        soul.mood.as_str(),
    )
}

/// Sign the current soul state at `timestamp`.
pub fn sign_soul(node_id: &str, timestamp: i64, soul: &SoulState) -> SoulSignature {
    SoulSignature {
        hash: sha256_hex(signing_string(node_id, timestamp, soul).as_bytes()),
        timestamp,
    }
}

/// Recompute the hash from the claimed inputs and compare.
pub fn verify_soul_signature(node_id: &str, soul: &SoulState, signature: &SoulSignature) -> bool {
    sha256_hex(signing_string(node_id, signature.timestamp, soul).as_bytes()) == signature.hash
}

/// The signature timestamp must lie within `[now - 30 s, now + 500 ms]`.
pub fn timestamp_in_window(signature_timestamp: i64, now: i64) -> bool {
    signature_timestamp >= now - REPLAY_WINDOW_MS && signature_timestamp <= now + FORWARD_SKEW_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{Mood, now_ms};

    fn soul() -> SoulState {
        SoulState {
            consciousness: 0.61,
            creativity: 0.42,
            harmony: 0.73,
            wisdom: 0.55,
            mood: Mood::Harmonizing,
        }
    }

    #[test]
    fn signature_round_trips() {
        let now = now_ms();
        let signature = sign_soul("n1", now, &soul());
        assert!(verify_soul_signature("n1", &soul(), &signature));
    }

    #[test]
    fn any_field_change_breaks_the_signature() {
        let now = now_ms();
        let signature = sign_soul("n1", now, &soul());

        let mut tampered = soul();
        tampered.harmony += 0.000002;
        assert!(!verify_soul_signature("n1", &tampered, &signature));
        assert!(!verify_soul_signature("n2", &soul(), &signature));

        let mut shifted = signature.clone();
        shifted.timestamp += 1;
        assert!(!verify_soul_signature("n1", &soul(), &shifted));
    }

    #[test]
    fn window_bounds() {
        let now = now_ms();
        assert!(timestamp_in_window(now, now));
        assert!(timestamp_in_window(now - REPLAY_WINDOW_MS, now));
        assert!(!timestamp_in_window(now - REPLAY_WINDOW_MS - 1, now));
        assert!(timestamp_in_window(now + FORWARD_SKEW_MS, now));
        assert!(!timestamp_in_window(now + FORWARD_SKEW_MS + 1, now));
    }
}
