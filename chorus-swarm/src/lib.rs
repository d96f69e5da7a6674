//! # Chorus Swarm
//!
//! The coordinator layer: wires the cache, fabric, protocol, emergence,
//! identity, immune, replication, and consensus subsystems together and
//! runs the awaken/sleep lifecycle with its three periodic cycles.
//!
//! ## Architecture Overview
//!
//! A [`SwarmCoordinator`] owns one instance of every subsystem and is
//! the only component allowed to mutate the peer cache. Everything else
//! observes the swarm through narrow, read-only adapters:
//!
//! - **Discovery cycle** (default 30 s): reads every heartbeat under the
//!   swarm prefix in bounded slices, parses off the hot path, marks
//!   stale peers lost, upserts fresh ones, and fires SPECIES-ID
//!   challenges at newcomers. It is the peer cache's single writer.
//! - **Consensus cycle** (default 120 s): runs one harmonic consensus
//!   round, records the outcome with the musical sink, and announces
//!   the round (and a self-election, when it happens) on the bus.
//! - **Immortality cycle** (default 60 s): polls the immune summary,
//!   escalates crises through the phoenix port, spills high harmony
//!   into creative output, and broadcasts a health check only when the
//!   condensed self-state moved significantly.
//!
//! The cycles never talk to each other directly; they share the peer
//! cache (snapshots only) and the message bus. Each cycle catches all
//! errors at its own boundary, so a failing round degrades one cycle
//! for one period and nothing else.
//!
//! ## Lifecycle
//!
//! `awaken` validates the interval ratios (discovery at least twice the
//! heartbeat period, consensus at least twice discovery), starts the
//! subsystems in dependency order, registers the heartbeat, and only
//! then launches the cycles. `sleep` unwinds in reverse and finishes by
//! clearing the timer registry, which doubles as the leak audit: a
//! coordinator that slept cleanly reports zero live timers.

pub mod coordinator;
pub mod heartbeat;
pub mod peers;

pub use coordinator::{CoordinatorPorts, CoordinatorStatus, SwarmCoordinator, SwarmStatus};
pub use heartbeat::{HeartbeatService, HeartbeatStats};
pub use peers::{EmergenceBeauty, PeerCache, PeerCacheView, PeerCounts};
