//! Loom Worker
//!
//! Runs on each compute host: loads the reserved capacity from the
//! environment, builds the resource and workload managers, and serves until
//! interrupted. The HTTP front-end that drives the managers is a separate
//! component.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loom_worker::config::{Config, EngineKind};
use loom_worker::docker::DockerEngine;
use loom_worker::host::HostResources;
use loom_worker::{ContainerEngine, MockEngine, ResourceManager, WorkloadManager};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        reserved_cpu = config.reserved.cpu,
        reserved_memory = config.reserved.memory,
        engine = ?config.engine,
        "Starting loom worker"
    );

    let host = HostResources::measure(&config.data_dir);
    info!(
        cpu_cores = host.cpu_cores,
        total_memory_bytes = host.total_memory_bytes,
        available_memory_bytes = host.available_memory_bytes,
        disk_free_bytes = host.disk.map(|d| d.free),
        disk_total_bytes = host.disk.map(|d| d.total),
        "Host measured"
    );
    let (cpu_over, memory_over) = host.overcommitted(config.reserved);
    if cpu_over || memory_over {
        warn!(
            cpu_over,
            memory_over,
            host_capacity = %host.capacity(),
            reserved = %config.reserved,
            "Reserved capacity exceeds host capacity"
        );
    }

    let resources = Arc::new(ResourceManager::new(config.reserved));

    let engine_kind = config.engine;
    let docker_socket = config.docker_socket.clone();
    let workloads = WorkloadManager::new(
        config.supported_workloads.as_deref(),
        &config.preinstalled_images,
        || async move {
            let engine: Arc<dyn ContainerEngine> = match engine_kind {
                EngineKind::Docker => Arc::new(DockerEngine::connect(&docker_socket).await?),
                EngineKind::Mock => Arc::new(MockEngine::new()),
            };
            Ok(engine)
        },
    )
    .await
    .context("error initializing workloads")?;
    let workloads = Arc::new(workloads);

    let retention = config.workload_retention;
    tokio::spawn({
        let workloads = Arc::clone(&workloads);
        async move {
            let mut interval = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                interval.tick().await;
                let pruned = workloads.prune_finished(retention);
                if pruned > 0 {
                    info!(pruned, "Pruned finished workloads");
                }
            }
        }
    });

    info!(
        free = %resources.query_free(),
        supported = ?workloads.supported_types(),
        "Worker ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    warn!("Received shutdown signal");

    info!(
        outstanding_allocations = resources.allocation_count(),
        active_workloads = workloads.registry().active_count(),
        "Worker shutdown complete"
    );
    Ok(())
}
