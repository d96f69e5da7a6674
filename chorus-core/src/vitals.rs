//! Process and host telemetry, normalized into the [`Vitals`] record the
//! rest of the swarm exchanges.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use sysinfo::{Disks, Pid, System};
use tracing::debug;

use crate::types::{HealthState, LoadVector, SoulState, VitalSigns, Vitals};

/// Samples the local process and host into normalized vitals.
///
/// The source owns the sysinfo handles behind a mutex; every snapshot
/// refreshes process CPU/memory and disk usage. Connection count,
/// network probe figures, and the last-consensus mark are fed in by the
/// coordinator as they change.
pub struct VitalsSource {
    system: Mutex<System>,
    disks: Mutex<Disks>,
    pid: Pid,
    cpu_count: usize,
    started: Instant,
    connections: AtomicU32,
    latency_ms: AtomicU64,
    /// Errors per 10 s window, stored in thousandths.
    error_rate_milli: AtomicU64,
    last_consensus: AtomicI64,
}

impl VitalsSource {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| anyhow!("cannot resolve current pid: {e}"))?;
        let system = System::new_all();
        let cpu_count = system.cpus().len().max(1);
        Ok(Self {
            system: Mutex::new(system),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
            pid,
            cpu_count,
            started: Instant::now(),
            connections: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            error_rate_milli: AtomicU64::new(0),
            last_consensus: AtomicI64::new(0),
        })
    }

    /// Take a fresh vitals snapshot.
    pub fn snapshot(&self) -> Vitals {
        let (cpu, memory) = {
            let mut system = self.system.lock();
            system.refresh_memory();
            system.refresh_process(self.pid);

            let total_memory = system.total_memory().max(1);
            match system.process(self.pid) {
                Some(process) => {
                    let cpu = (process.cpu_usage() as f64 / 100.0 / self.cpu_count as f64)
                        .clamp(0.0, 1.0);
                    let memory =
                        (process.memory() as f64 / total_memory as f64).clamp(0.0, 1.0);
                    (cpu, memory)
                }
                None => (0.0, 0.0),
            }
        };

        let load_norm =
            (System::load_average().one / self.cpu_count as f64).clamp(0.0, 1.0);
        let connections = self.connections.load(Ordering::Relaxed);
        let network = (0.7 * load_norm + 0.3 * (connections as f64 / 100.0).min(1.0))
            .clamp(0.0, 1.0);
        let storage = self.storage_pressure();

        let health = Self::classify(cpu, memory);
        debug!(cpu, memory, network, storage, ?health, "vitals sampled");

        let last_consensus = match self.last_consensus.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        };

        Vitals {
            health,
            load: LoadVector { cpu, memory, network, storage },
            connections,
            uptime_ms: self.started.elapsed().as_millis() as u64,
            last_consensus,
        }
    }

    /// Aesthetic view of the same sample, blended with the soul scalars.
    pub fn vital_signs(&self, soul: &SoulState) -> VitalSigns {
        let vitals = self.snapshot();
        let load = vitals.load;
        VitalSigns {
            health: (1.0 - 0.5 * load.cpu - 0.5 * load.memory).clamp(0.0, 1.0),
            harmony: (0.5 * soul.harmony + 0.5 * (1.0 - load.mean())).clamp(0.0, 1.0),
            creativity: soul.creativity.clamp(0.0, 1.0),
            stress: (0.4 * load.cpu + 0.4 * load.memory + 0.2 * load.network)
                .clamp(0.0, 1.0),
        }
    }

    fn classify(cpu: f64, memory: f64) -> HealthState {
        if memory > 0.9 || cpu > 0.95 {
            HealthState::Critical
        } else if memory > 0.8 || cpu > 0.8 {
            HealthState::Warning
        } else if cpu < 0.25 && memory < 0.4 {
            HealthState::Optimal
        } else {
            HealthState::Healthy
        }
    }

    fn storage_pressure(&self) -> f64 {
        let mut disks = self.disks.lock();
        disks.refresh();
        let (total, available) = disks
            .iter()
            .fold((0u64, 0u64), |(t, a), disk| {
                (t + disk.total_space(), a + disk.available_space())
            });
        if total == 0 {
            return 0.0;
        }
        (1.0 - available as f64 / total as f64).clamp(0.0, 1.0)
    }

    pub fn set_connections(&self, count: u32) {
        self.connections.store(count, Ordering::Relaxed);
    }

    /// Record a network probe observation (round-trip latency and error
    /// rate over the last window).
    pub fn record_probe(&self, latency_ms: u64, error_rate: f64) {
        self.latency_ms.store(latency_ms, Ordering::Relaxed);
        self.error_rate_milli
            .store((error_rate.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_ms.load(Ordering::Relaxed) as f64
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate_milli.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn mark_consensus(&self, timestamp: i64) {
        self.last_consensus.store(timestamp, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mood;

    #[test]
    fn snapshot_is_normalized() {
        let source = VitalsSource::new().unwrap();
        let vitals = source.snapshot();
        assert!((0.0..=1.0).contains(&vitals.load.cpu));
        assert!((0.0..=1.0).contains(&vitals.load.memory));
        assert!((0.0..=1.0).contains(&vitals.load.network));
        assert!((0.0..=1.0).contains(&vitals.load.storage));
    }

    #[test]
    fn classification_thresholds() {
        assert_eq!(VitalsSource::classify(0.99, 0.1), HealthState::Critical);
        assert_eq!(VitalsSource::classify(0.1, 0.95), HealthState::Critical);
        assert_eq!(VitalsSource::classify(0.85, 0.1), HealthState::Warning);
        assert_eq!(VitalsSource::classify(0.5, 0.5), HealthState::Healthy);
        assert_eq!(VitalsSource::classify(0.1, 0.1), HealthState::Optimal);
    }

    #[test]
    fn probe_values_round_trip() {
        let source = VitalsSource::new().unwrap();
        source.record_probe(42, 1.5);
        assert_eq!(source.latency_ms(), 42.0);
        assert!((source.error_rate() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn vital_signs_are_bounded() {
        let source = VitalsSource::new().unwrap();
        let soul = SoulState {
            consciousness: 0.6,
            creativity: 0.7,
            harmony: 0.8,
            wisdom: 0.5,
            mood: Mood::Serene,
        };
        let signs = source.vital_signs(&soul);
        for value in [signs.health, signs.harmony, signs.creativity, signs.stress] {
            assert!((0.0..=1.0).contains(&value));
        }
    }
}
