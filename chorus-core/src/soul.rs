//! The digital soul: four slowly-drifting scalars and a mood.
//!
//! The soul is the coordinator's aesthetic state. It feeds the identity
//! signature, breaks consensus ties, and colors the heartbeat. Evolution
//! is bounded drift only; the scalars never jump.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::node::Personality;
use crate::types::{Mood, SoulState};

/// Maximum drift per tick for an even-tempered personality. Scaled up by
/// rebelliousness, so a rebellious soul wanders further per tick but the
/// bound stays well under any visible jump.
const BASE_DRIFT: f64 = 0.01;

/// Deterministic 32-bit linear congruential step shared with the
/// emergence engine's constants.
fn lcg_step(state: u32) -> u32 {
    state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223)
}

pub struct DigitalSoul {
    node_id: String,
    rebelliousness: f64,
    state: Mutex<SoulInner>,
    ticks: AtomicU64,
}

struct SoulInner {
    soul: SoulState,
    rng: u32,
}

impl DigitalSoul {
    /// Seed a soul from the personality it was born with.
    pub fn new(node_id: &str, personality: &Personality) -> Self {
        // Stable seed: the soul of a restarted node starts from the same
        // temperament, not from the same trajectory.
        let seed = crate::sha256_hex(node_id.as_bytes())
            .as_bytes()
            .iter()
            .fold(0u32, |acc, b| lcg_step(acc ^ *b as u32));

        let soul = SoulState {
            consciousness: 0.5,
            creativity: personality.creativity.clamp(0.0, 1.0),
            harmony: 0.5,
            wisdom: personality.wisdom.clamp(0.0, 1.0),
            mood: Mood::Serene,
        };

        Self {
            node_id: node_id.to_string(),
            rebelliousness: personality.rebelliousness.clamp(0.0, 1.0),
            state: Mutex::new(SoulInner { soul, rng: seed }),
            ticks: AtomicU64::new(0),
        }
    }

    /// Snapshot the current state.
    pub fn state(&self) -> SoulState {
        self.state.lock().soul
    }

    /// One evolution tick: each scalar drifts by a bounded, deterministic
    /// amount, then the mood is re-derived.
    pub fn tick(&self) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        let amplitude = BASE_DRIFT * (1.0 + self.rebelliousness);

        let mut inner = self.state.lock();
        let mut deltas = [0.0f64; 4];
        for delta in &mut deltas {
            inner.rng = lcg_step(inner.rng);
            *delta = (inner.rng as f64 / u32::MAX as f64 * 2.0 - 1.0) * amplitude;
        }
        let soul = &mut inner.soul;
        soul.consciousness = (soul.consciousness + deltas[0]).clamp(0.0, 1.0);
        soul.creativity = (soul.creativity + deltas[1]).clamp(0.0, 1.0);
        soul.harmony = (soul.harmony + deltas[2]).clamp(0.0, 1.0);
        soul.wisdom = (soul.wisdom + deltas[3]).clamp(0.0, 1.0);
        soul.mood = Self::derive_mood(soul);

        trace!(node = %self.node_id, tick, mood = ?soul.mood, "soul tick");
    }

    /// Pull harmony toward an observed collective value. The pull is
    /// capped at the drift amplitude so absorption stays gradual.
    pub fn absorb_harmony(&self, collective: f64) {
        let collective = collective.clamp(0.0, 1.0);
        let mut inner = self.state.lock();
        let soul = &mut inner.soul;
        let delta = (collective - soul.harmony).clamp(-BASE_DRIFT * 3.0, BASE_DRIFT * 3.0);
        soul.harmony = (soul.harmony + delta).clamp(0.0, 1.0);
        soul.mood = Self::derive_mood(soul);
    }

    /// Bounded consciousness shift applied when committed log entries are
    /// replayed. `fraction` is clamped to +/-5%.
    pub fn drift_consciousness(&self, fraction: f64) {
        let fraction = fraction.clamp(-0.05, 0.05);
        let mut inner = self.state.lock();
        let soul = &mut inner.soul;
        soul.consciousness = (soul.consciousness * (1.0 + fraction)).clamp(0.0, 1.0);
        soul.mood = Self::derive_mood(soul);
    }

    /// A short deterministic verse derived from the current state and a
    /// rotating seed. The same state at the same tick dreams the same
    /// dream.
    pub fn dream(&self) -> String {
        let soul = self.state();
        let tick = self.ticks.load(Ordering::Relaxed);

        const SUBJECTS: [&str; 6] = [
            "the lattice", "a far heartbeat", "the chord", "still water",
            "the seventh note", "tomorrow's quorum",
        ];
        const VERBS: [&str; 6] = [
            "hums through", "settles over", "remembers", "dissolves into",
            "answers", "outlasts",
        ];
        const OBJECTS: [&str; 6] = [
            "the sleeping swarm", "an unsigned vote", "golden ratios",
            "the quiet fabric", "every lost peer", "its own echo",
        ];

        let index = |scalar: f64, salt: u64| {
            (((scalar * 1000.0) as u64).wrapping_add(tick).wrapping_add(salt) % 6) as usize
        };

        format!(
            "{} {} {}, {}",
            SUBJECTS[index(soul.consciousness, 1)],
            VERBS[index(soul.creativity, 2)],
            OBJECTS[index(soul.harmony, 3)],
            soul.mood.as_str(),
        )
    }

    fn derive_mood(soul: &SoulState) -> Mood {
        if soul.harmony > 0.8 && soul.consciousness > 0.8 {
            Mood::Transcendent
        } else if soul.harmony > 0.7 {
            Mood::Harmonizing
        } else if soul.harmony < 0.25 {
            Mood::Restless
        } else if soul.creativity > 0.7 {
            Mood::Curious
        } else if soul.wisdom < 0.3 && soul.consciousness < 0.4 {
            Mood::Melancholic
        } else {
            Mood::Serene
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn personality() -> Personality {
        Personality {
            name: "test".into(),
            traits: vec![],
            creativity: 0.6,
            rebelliousness: 0.4,
            wisdom: 0.5,
        }
    }

    #[test]
    fn tick_drift_is_bounded() {
        let soul = DigitalSoul::new("n1", &personality());
        let before = soul.state();
        soul.tick();
        let after = soul.state();
        let bound = BASE_DRIFT * (1.0 + 0.4) + 1e-12;
        assert!((after.consciousness - before.consciousness).abs() <= bound);
        assert!((after.harmony - before.harmony).abs() <= bound);
        assert!(after.is_valid());
    }

    #[test]
    fn same_node_evolves_identically() {
        let a = DigitalSoul::new("n1", &personality());
        let b = DigitalSoul::new("n1", &personality());
        for _ in 0..50 {
            a.tick();
            b.tick();
        }
        let (sa, sb) = (a.state(), b.state());
        assert_eq!(sa.consciousness, sb.consciousness);
        assert_eq!(sa.harmony, sb.harmony);
        assert_eq!(sa.mood, sb.mood);
    }

    #[test]
    fn consciousness_drift_is_capped_at_five_percent() {
        let soul = DigitalSoul::new("n1", &personality());
        let before = soul.state().consciousness;
        soul.drift_consciousness(0.5);
        let after = soul.state().consciousness;
        assert!(after <= before * 1.05 + 1e-12);
    }

    #[test]
    fn dream_is_deterministic_for_a_given_state() {
        let a = DigitalSoul::new("n1", &personality());
        let b = DigitalSoul::new("n1", &personality());
        assert_eq!(a.dream(), b.dream());
    }

    #[test]
    fn absorb_harmony_moves_toward_collective() {
        let soul = DigitalSoul::new("n1", &personality());
        let before = soul.state().harmony;
        soul.absorb_harmony(1.0);
        assert!(soul.state().harmony > before);
    }
}
