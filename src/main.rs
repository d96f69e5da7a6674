// chorusd - swarm coordinator daemon
//
// Runs a single coordinator over a process-local fabric. Deployments
// that span hosts plug a shared fabric implementation into
// `SwarmCoordinator::new` instead; everything else is identical.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};

use chorus_core::{NodeId, SwarmConfig};
use chorus_fabric::{Fabric, MemoryFabric};
use chorus_swarm::{CoordinatorPorts, SwarmCoordinator};

/// Entry point: awaken one coordinator, report status periodically, and
/// sleep it cleanly on Ctrl+C.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chorus=info".parse()?),
        )
        .init();

    info!("starting chorus swarm coordinator");

    let config = SwarmConfig::default();
    let fabric: Arc<dyn Fabric> = Arc::new(MemoryFabric::new());
    let node = NodeId::generate("chorus");

    let coordinator =
        SwarmCoordinator::new(node, config, fabric, CoordinatorPorts::default())?;
    if let Err(error) = coordinator.awaken().await {
        error!(%error, "coordinator failed to awaken");
        return Err(error);
    }
    info!(node = %coordinator.node().id, "coordinator awake");

    // Periodic operator-facing status line.
    let reporter = Arc::clone(&coordinator);
    let status_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;
            let report = reporter.report();
            info!(
                status = ?report.status,
                peers_active = report.peers.active,
                leader = report.leader.as_deref().unwrap_or("none"),
                commit_index = report.commit_index,
                threat_level = report.immune.threat_level,
                "swarm status"
            );
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(error) => error!(%error, "unable to listen for shutdown signal"),
    }

    status_task.abort();
    coordinator.sleep().await;
    info!("coordinator stopped");
    Ok(())
}
