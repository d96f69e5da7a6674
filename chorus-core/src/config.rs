//! Swarm configuration.
//!
//! One plain struct passed by value; there is no file loading and no CLI
//! layer. Interval ratios matter: discovery must run at least 2x slower
//! than the heartbeat, and consensus at least 2x slower than discovery,
//! so that every consensus round sees a settled peer cache.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// All tunables of a coordinator, with the defaults the swarm ships with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Fabric keyspace prefix shared by every coordinator of one swarm.
    pub prefix: String,

    /// Vitals and heartbeat write period.
    pub heartbeat_interval: Duration,

    /// Peer discovery cycle period.
    pub discovery_frequency: Duration,

    /// Consensus cycle period.
    pub consensus_check_interval: Duration,

    /// Immortality (self-preservation) cycle period.
    pub immortality_cycle_interval: Duration,

    /// A peer whose heartbeat is older than this is marked lost.
    pub max_node_timeout: Duration,

    /// Approval rate below which a round degrades to read-only even when
    /// quorum was reached.
    pub consensus_threshold: f64,

    /// How long a consensus result stays cached for repeated callers.
    pub cache_ttl: Duration,

    /// Maximum wait for vote responses in one round.
    pub vote_collection_timeout: Duration,

    /// Round limit for a SPECIES-ID identity challenge.
    pub species_challenge_timeout: Duration,

    /// Immune system sweep period.
    pub immune_scan_interval: Duration,

    /// Per-batch replication deadline.
    pub replication_timeout: Duration,

    /// Maximum log entries per replication batch.
    pub max_batch_size: usize,

    /// Evolution steps per emergence pattern.
    pub emergence_iterations: usize,

    /// Minimum identity confidence the rule verifier must report for a
    /// SPECIES-ID challenge to pass.
    pub species_confidence_threshold: f64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            prefix: "swarm".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            discovery_frequency: Duration::from_secs(30),
            consensus_check_interval: Duration::from_secs(120),
            immortality_cycle_interval: Duration::from_secs(60),
            max_node_timeout: Duration::from_secs(30),
            consensus_threshold: 0.51,
            cache_ttl: Duration::from_secs(60),
            vote_collection_timeout: Duration::from_secs(10),
            species_challenge_timeout: Duration::from_secs(5),
            immune_scan_interval: Duration::from_secs(15),
            replication_timeout: Duration::from_secs(5),
            max_batch_size: 10,
            emergence_iterations: 100,
            species_confidence_threshold: 0.85,
        }
    }
}

impl SwarmConfig {
    /// Validate interval ratios and scalar ranges before awakening.
    pub fn validate(&self) -> Result<()> {
        if self.discovery_frequency < self.heartbeat_interval * 2 {
            bail!(
                "discovery_frequency ({:?}) must be at least twice heartbeat_interval ({:?})",
                self.discovery_frequency,
                self.heartbeat_interval
            );
        }
        if self.consensus_check_interval < self.discovery_frequency * 2 {
            bail!(
                "consensus_check_interval ({:?}) must be at least twice discovery_frequency ({:?})",
                self.consensus_check_interval,
                self.discovery_frequency
            );
        }
        if !(0.0..=1.0).contains(&self.consensus_threshold) {
            bail!("consensus_threshold must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.species_confidence_threshold) {
            bail!("species_confidence_threshold must be in [0, 1]");
        }
        if self.max_batch_size == 0 {
            bail!("max_batch_size must be positive");
        }
        if self.prefix.is_empty() {
            bail!("prefix must not be empty");
        }
        Ok(())
    }

    /// TTL for the expiring vitals key, three write periods.
    pub fn vitals_ttl(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}
