//! Workload manager.
//!
//! Validates a workload request against the worker's supported types and
//! hands it to the launcher for its type. Resource accounting is separate:
//! callers allocate through [`crate::ResourceManager`] first, start the
//! workload here, and free the allocation themselves when the workload is
//! done. Nothing here looks up or releases allocations.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use loom_id::WorkloadId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{ContainerEngine, EngineError};
use crate::error::ErrorClass;
use crate::image_cache::ImageCache;
use crate::launcher::{ContainerLauncher, LaunchError};
use crate::registry::{WorkloadRegistry, WorkloadStatus};
use crate::workload::{
    parse_supported_types, UnknownWorkloadType, Workload, WorkloadPayload, WorkloadState,
    WorkloadType,
};

/// Errors from the workload manager.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// A type name this worker cannot run. At init this comes from the
    /// configured list; at start it means the worker was configured with a
    /// type it has no launcher for. Both are configuration faults.
    #[error(transparent)]
    UnknownWorkloadType(#[from] UnknownWorkloadType),

    #[error("error initializing container engine: {0}")]
    EngineUnavailable(#[source] EngineError),

    #[error("error starting workload {workload_id}: {source}")]
    Launch {
        workload_id: WorkloadId,
        #[source]
        source: LaunchError,
    },
}

impl WorkloadError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WorkloadError::UnknownWorkloadType(_) => ErrorClass::Configuration,
            WorkloadError::EngineUnavailable(_) => ErrorClass::Configuration,
            WorkloadError::Launch { source, .. } => source.class(),
        }
    }
}

/// Dispatches workloads to type-specific launchers.
pub struct WorkloadManager {
    supported: BTreeSet<WorkloadType>,
    images: Arc<ImageCache>,
    registry: Arc<WorkloadRegistry>,
    container_launcher: Option<ContainerLauncher>,
}

impl WorkloadManager {
    /// Builds the manager.
    ///
    /// `supported` is the raw configured type list (`None` → dev + docker).
    /// `connect` is only called when docker is supported, and its failure
    /// fails initialization.
    pub async fn new<F, Fut>(
        supported: Option<&str>,
        preinstalled_images: &[String],
        connect: F,
    ) -> Result<Self, WorkloadError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn ContainerEngine>, EngineError>>,
    {
        if supported.map(str::trim).unwrap_or_default().is_empty() {
            debug!("Using default workload types of dev and docker");
        }
        let supported = parse_supported_types(supported)?;

        let images = Arc::new(ImageCache::with_images(preinstalled_images.iter().cloned()));
        let registry = Arc::new(WorkloadRegistry::new());

        let container_launcher = if supported.contains(&WorkloadType::Docker) {
            let engine = connect().await.map_err(WorkloadError::EngineUnavailable)?;
            Some(ContainerLauncher::new(
                engine,
                Arc::clone(&images),
                Arc::clone(&registry),
                true,
            ))
        } else {
            None
        };

        info!(
            supported = ?supported,
            preinstalled_images = images.len(),
            "Workload manager initialized"
        );

        Ok(Self {
            supported,
            images,
            registry,
            container_launcher,
        })
    }

    /// Starts a workload and returns its id.
    ///
    /// Docker workloads block until the container is running, including any
    /// image pull. Cancelling `cancel` aborts an in-flight pull.
    pub async fn start_workload(
        &self,
        cancel: &CancellationToken,
        workload: Workload,
    ) -> Result<WorkloadId, WorkloadError> {
        let workload_id = WorkloadId::generate();
        debug!(
            workload_id = %workload_id,
            workload_type = %workload.workload_type(),
            cpu = workload.resources.cpu,
            memory = workload.resources.memory,
            "Starting workload"
        );

        match &workload.payload {
            WorkloadPayload::Dev => {}
            WorkloadPayload::Docker(payload) => {
                let launcher = self
                    .container_launcher
                    .as_ref()
                    .ok_or(WorkloadError::Launch {
                        workload_id,
                        source: LaunchError::UnsupportedWorkloadType,
                    })?;
                launcher
                    .launch(
                        cancel,
                        workload_id,
                        workload.resources,
                        workload.timeout,
                        payload,
                    )
                    .await
                    .map_err(|source| WorkloadError::Launch {
                        workload_id,
                        source,
                    })?;
            }
            WorkloadPayload::Firecracker(_) => {
                return Err(UnknownWorkloadType(WorkloadType::Firecracker.to_string()).into());
            }
        }

        info!(workload_id = %workload_id, workload_type = %workload.workload_type(), "Workload started");
        Ok(workload_id)
    }

    /// Current status of a container workload. Dev workloads are not tracked.
    pub fn status(&self, workload_id: &WorkloadId) -> Option<WorkloadStatus> {
        self.registry.status(workload_id)
    }

    /// Drops the record of a finished container workload and returns its
    /// final status. Active workloads are kept.
    pub fn forget(&self, workload_id: &WorkloadId) -> Option<WorkloadStatus> {
        self.registry.remove(workload_id)
    }

    /// Drops records of container workloads that finished at least
    /// `retention` ago.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        self.registry.prune_finished(retention)
    }

    /// Resolves once a container workload reaches a terminal state.
    pub async fn wait_terminal(&self, workload_id: &WorkloadId) -> Option<WorkloadState> {
        self.registry.wait_terminal(workload_id).await
    }

    pub fn supported_types(&self) -> &BTreeSet<WorkloadType> {
        &self.supported
    }

    pub fn supports(&self, workload_type: WorkloadType) -> bool {
        self.supported.contains(&workload_type)
    }

    pub fn image_cache(&self) -> &Arc<ImageCache> {
        &self.images
    }

    pub fn registry(&self) -> &Arc<WorkloadRegistry> {
        &self.registry
    }
}
