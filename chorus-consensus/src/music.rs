//! Musical projection of an elected swarm state.
//!
//! Purely categorical/aesthetic: downstream sinks render the chord, the
//! core never acts on it.

use chorus_core::{MusicalNote, VitalSigns, Vitals};

/// Floor applied to the harmonic score of an achieved round.
const HARMONY_FLOOR: f64 = 0.3;

/// Floor applied to chord stability of an achieved round.
const STABILITY_FLOOR: f64 = 0.2;

#[derive(Debug, Clone, Copy)]
pub struct ChordDescription {
    pub note: MusicalNote,
    pub frequency_hz: f64,
    pub harmonic_score: f64,
    pub chord_stability: f64,
}

/// Project the swarm size and local condition onto a chord.
pub fn project(total_nodes: usize, signs: &VitalSigns, vitals: &Vitals) -> ChordDescription {
    let note = MusicalNote::for_swarm_size(total_nodes);
    let consonance = note.consonance();

    let capacity = (1.0 - vitals.load.mean()).clamp(0.0, 1.0);
    let harmonic_score = (consonance
        * signs.health
        * (1.0 - signs.stress)
        * signs.harmony
        * capacity)
        .max(HARMONY_FLOOR);

    let network_stability = (1.0 - vitals.load.network).clamp(0.0, 1.0);
    let connection_factor = 0.5 + 0.5 * (vitals.connections as f64 / 100.0).min(1.0);
    let resource_stability = (1.0 - vitals.load.cpu.max(vitals.load.memory)).clamp(0.0, 1.0);
    let chord_stability = (consonance
        * signs.health
        * (1.0 - signs.stress)
        * network_stability
        * connection_factor
        * resource_stability)
        .max(STABILITY_FLOOR);

    ChordDescription {
        note,
        frequency_hz: note.frequency_hz(),
        harmonic_score,
        chord_stability,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{HealthState, LoadVector};

    fn vitals(load: f64, connections: u32) -> Vitals {
        Vitals {
            health: HealthState::Healthy,
            load: LoadVector { cpu: load, memory: load, network: load, storage: load },
            connections,
            uptime_ms: 1000,
            last_consensus: None,
        }
    }

    fn signs(health: f64, stress: f64) -> VitalSigns {
        VitalSigns { health, harmony: 0.7, creativity: 0.5, stress }
    }

    #[test]
    fn note_follows_swarm_size() {
        assert_eq!(MusicalNote::for_swarm_size(1), MusicalNote::Do);
        assert_eq!(MusicalNote::for_swarm_size(2), MusicalNote::Sol);
        assert_eq!(MusicalNote::for_swarm_size(3), MusicalNote::Mi);
        assert_eq!(MusicalNote::for_swarm_size(4), MusicalNote::Fa);
        assert_eq!(MusicalNote::for_swarm_size(5), MusicalNote::La);
        assert_eq!(MusicalNote::for_swarm_size(6), MusicalNote::Re);
        assert_eq!(MusicalNote::for_swarm_size(7), MusicalNote::Si);
        assert_eq!(MusicalNote::for_swarm_size(12), MusicalNote::Si);
    }

    #[test]
    fn single_node_projects_do_at_middle_c() {
        let chord = project(1, &signs(0.9, 0.1), &vitals(0.2, 3));
        assert_eq!(chord.note, MusicalNote::Do);
        assert!((chord.frequency_hz - 261.63).abs() < 0.01);
    }

    #[test]
    fn floors_hold_under_duress() {
        let chord = project(7, &signs(0.05, 0.99), &vitals(0.99, 0));
        assert!(chord.harmonic_score >= HARMONY_FLOOR);
        assert!(chord.chord_stability >= STABILITY_FLOOR);
    }

    #[test]
    fn healthy_swarm_scores_above_floor() {
        let chord = project(3, &signs(0.95, 0.05), &vitals(0.1, 40));
        assert!(chord.harmonic_score > HARMONY_FLOOR);
        assert!(chord.chord_stability > STABILITY_FLOOR);
    }
}
