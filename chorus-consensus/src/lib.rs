//! # Chorus Harmonic Consensus
//!
//! Quorum-protected leader election over signed votes and shared
//! metrics, projected onto a musical chord for downstream sinks.
//!
//! ## Round Anatomy
//!
//! One round moves through `idle -> collecting_metrics -> voting ->
//! tallying -> committed | read_only`:
//!
//! 1. **Metrics snapshot** — the requester computes one
//!    [`SharedMetric`](chorus_protocol::SharedMetric) row per known
//!    node, blending resource health with the emergence layer's beauty
//!    factor (`final = 0.7 * health + 0.3 * beauty`). Missing peer data
//!    floors at 0.1 and is never fabricated upward.
//! 2. **Broadcast** — the full metrics table rides the vote request, so
//!    every voter computes from exactly the same inputs. This is the
//!    invariant that makes the majority deterministic: the vote rule
//!    (highest final score, ties to the ascending node id) is a pure
//!    function of the table.
//! 3. **Collection** — responses arrive inside a bounded window. Every
//!    vote must carry a signature that recomputes as
//!    `sha256("vote:" voter ":" candidate ":" timestamp)`; forged or
//!    out-of-set votes are discarded and audited, never tallied.
//! 4. **Quorum** — `floor(n/2) + 1` over the known set plus self,
//!    evaluated fresh each round. On top of quorum, the approval rate
//!    must clear the consensus threshold for the round to count as
//!    achieved.
//! 5. **Validation** — an elected candidate whose live health has
//!    collapsed since the snapshot is replaced by the best
//!    locally-scored node.
//!
//! Failing quorum is an outcome, not an error: the caller receives a
//! well-formed result with `read_only_mode = true`, a `"no-leader"`
//! leader, and a zeroed harmonic score. Results are cached briefly and
//! invalidated the moment swarm membership changes.

pub mod engine;
pub mod music;
pub mod types;

pub use engine::{
    best_candidate, verify_vote, vote_signature, BeautySource, HarmonicConsensus, PeerView,
};
pub use music::{project, ChordDescription};
pub use types::{ConsensusConfig, ConsensusResult, ConsensusStats, RoundPhase, NO_LEADER};
