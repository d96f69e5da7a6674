//! The deterministic evolution engine.
//!
//! Everything here is pure floating-point arithmetic over a seeded linear
//! congruential generator, so a given seed and iteration count produce
//! bit-identical patterns on every coordinator. No wall clock, no
//! process state, no hash-map iteration order enters the math.

use chorus_core::{now_ms, EmergencePattern, EmergenceState};
use uuid::Uuid;

const PHI: f64 = 1.618_033_988_749_895;

/// Pull strength toward the mean of the two cyclic neighbors.
const SMOOTHING: f64 = 0.3;

/// Classic 32-bit LCG (Numerical Recipes constants). Values map to
/// `[-1, 1)` via `state / 2^32 * 2 - 1`.
pub(crate) struct Lcg {
    state: u32,
}

impl Lcg {
    pub(crate) fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    pub(crate) fn next_value(&mut self) -> f64 {
        self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        self.state as f64 / 4_294_967_296.0 * 2.0 - 1.0
    }
}

#[derive(Debug, Clone)]
pub struct EngineParams {
    pub pattern_length: usize,
    pub iterations: usize,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self { pattern_length: 50, iterations: 100 }
    }
}

/// Run one full evolution from a seed.
pub fn evolve(seed: u32, params: &EngineParams) -> EmergencePattern {
    let mut lcg = Lcg::new(seed);
    let mut pattern: Vec<f64> = (0..params.pattern_length)
        .map(|_| lcg.next_value())
        .collect();

    // Starts at maximum disorder; the update rule can only bring it down
    // as the pattern converges.
    let mut entropy = 1.0_f64;
    let mut evolution = Vec::with_capacity(params.iterations);

    for iteration in 0..params.iterations {
        smooth(&mut pattern);

        let variance = variance(&pattern);
        let convergence = (1.0 - 2.0 * variance).max(0.0);
        entropy = (0.95 * entropy + 0.05 * (1.0 - convergence)).max(0.1);

        let order = order(&pattern);
        let harmony = harmony(&pattern);
        let beauty = (order * (1.0 - entropy) * harmony).clamp(0.0, 1.0);

        evolution.push(EmergenceState {
            iteration,
            entropy,
            order,
            beauty,
            pattern: pattern.clone(),
        });
    }

    let final_state = evolution
        .last()
        .cloned()
        .unwrap_or(EmergenceState {
            iteration: 0,
            entropy,
            order: 0.0,
            beauty: 0.0,
            pattern: pattern.clone(),
        });

    EmergencePattern {
        id: Uuid::new_v4().to_string(),
        seed,
        complexity: complexity(&pattern, entropy),
        harmony: harmony(&pattern),
        evolution,
        final_state,
        timestamp: now_ms(),
    }
}

/// Each element is pulled toward the mean of its two cyclic neighbors.
fn smooth(pattern: &mut [f64]) {
    let n = pattern.len();
    if n < 3 {
        return;
    }
    let snapshot = pattern.to_vec();
    for i in 0..n {
        let left = snapshot[(i + n - 1) % n];
        let right = snapshot[(i + 1) % n];
        let target = (left + right) / 2.0;
        pattern[i] = (snapshot[i] + SMOOTHING * (target - snapshot[i])).clamp(-1.0, 1.0);
    }
}

fn variance(pattern: &[f64]) -> f64 {
    if pattern.is_empty() {
        return 0.0;
    }
    let mean = pattern.iter().sum::<f64>() / pattern.len() as f64;
    pattern.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / pattern.len() as f64
}

/// Mean cyclic self-similarity over periods 2 through 5.
fn order(pattern: &[f64]) -> f64 {
    let n = pattern.len();
    if n == 0 {
        return 0.0;
    }
    let mut total = 0.0;
    for period in 2..=5usize {
        let similarity: f64 = (0..n)
            .map(|i| 1.0 - (pattern[i] - pattern[(i + period) % n]).abs())
            .sum::<f64>()
            / n as f64;
        total += similarity;
    }
    (total / 4.0).clamp(0.0, 1.0)
}

/// Rewards smooth transitions and adjacent magnitude ratios near the
/// golden ratio.
fn harmony(pattern: &[f64]) -> f64 {
    let n = pattern.len();
    if n < 2 {
        return 0.0;
    }
    let mut total = 0.0;
    for i in 0..n {
        let a = pattern[i];
        let b = pattern[(i + 1) % n];
        let smoothness = 1.0 - (a - b).abs() / 2.0;
        let ratio = a.abs().max(0.001) / b.abs().max(0.001);
        let phi_score = (1.0 - (ratio - PHI).abs() / PHI).clamp(0.0, 1.0);
        total += 0.7 * smoothness + 0.3 * phi_score;
    }
    (total / n as f64).clamp(0.0, 1.0)
}

/// `(variance + entropy / 10) / 2` over log-magnitudes, floored away from
/// singularities.
fn complexity(pattern: &[f64], entropy: f64) -> f64 {
    let logs: Vec<f64> = pattern.iter().map(|x| x.abs().max(0.001).ln()).collect();
    (variance(&logs) + entropy / 10.0) / 2.0
}

/// Collective beauty of a set of patterns: the engine re-runs with the
/// wrapping sum of their seeds for 200 iterations.
pub fn collective(seeds: &[u32], pattern_length: usize) -> EmergencePattern {
    let seed = seeds.iter().fold(0u32, |acc, s| acc.wrapping_add(*s));
    evolve(seed, &EngineParams { pattern_length, iterations: 200 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcg_sequence_is_the_canonical_one() {
        let mut lcg = Lcg::new(0);
        let first = lcg.next_value();
        // state after one step from 0 is 1013904223
        let expected = 1_013_904_223u32 as f64 / 4_294_967_296.0 * 2.0 - 1.0;
        assert!((first - expected).abs() < 1e-15);
    }

    #[test]
    fn evolution_is_deterministic_for_a_seed() {
        let params = EngineParams::default();
        let a = evolve(42, &params);
        let b = evolve(42, &params);
        assert!((a.harmony - b.harmony).abs() < 1e-9);
        assert_eq!(a.final_state.pattern, b.final_state.pattern);
        assert_eq!(a.evolution.len(), 100);
    }

    #[test]
    fn different_seeds_diverge() {
        let params = EngineParams::default();
        let a = evolve(42, &params);
        let b = evolve(43, &params);
        assert_ne!(a.final_state.pattern, b.final_state.pattern);
    }

    #[test]
    fn scores_stay_in_bounds() {
        let params = EngineParams::default();
        let pattern = evolve(7, &params);
        assert!((0.0..=1.0).contains(&pattern.harmony));
        for state in &pattern.evolution {
            assert!(state.entropy >= 0.1);
            assert!((0.0..=1.0).contains(&state.order));
            assert!((0.0..=1.0).contains(&state.beauty));
            assert!(state.pattern.iter().all(|x| (-1.0..=1.0).contains(x)));
        }
    }

    #[test]
    fn collective_sums_seeds() {
        let a = collective(&[1, 2, 3], 50);
        let b = collective(&[6], 50);
        assert_eq!(a.final_state.pattern, b.final_state.pattern);
        assert_eq!(a.evolution.len(), 200);
    }

    #[test]
    fn smoothing_converges_toward_neighbors() {
        let mut pattern = vec![1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        let before = variance(&pattern);
        for _ in 0..20 {
            smooth(&mut pattern);
        }
        assert!(variance(&pattern) < before);
    }
}
