//! # Chorus Emergence
//!
//! Deterministic procedural pattern evolution. A seed becomes a 50-cell
//! one-dimensional pattern that is smoothed toward its cyclic neighbors
//! for a fixed number of iterations while entropy, order, harmony, and
//! beauty are tracked. The resulting harmony score is the aesthetic
//! input the consensus engine blends into every node's shared metric.
//!
//! Completed patterns are published on the fabric and cached locally
//! with a retention TTL. The service keeps working offline: when the
//! fabric is unreachable, publication is skipped with a warning and the
//! local cache still serves reads.

pub mod engine;
mod store;

pub use engine::{collective, evolve, EngineParams};
pub use store::{EmergenceConfig, EmergenceService, EmergenceStats};
