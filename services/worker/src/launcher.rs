//! Container launcher.
//!
//! Turns a docker workload into a running container:
//!
//! 1. reject if docker support is disabled or the payload has no image
//! 2. pull the image unless the cache says it is present (cancellable)
//! 3. create and start the container (blocks the caller)
//! 4. hand the container to a background supervisor that races the exit
//!    wait against the workload timeout
//!
//! The supervisor resolves exactly once: whichever of exit or timeout is
//! observed first wins and the other future is dropped, so an exited
//! container is never killed and a killed one is never reported as exited.
//! A workload is only recorded as `Killed` once the engine confirmed the
//! kill. A container that could not be killed or waited on stays active
//! with the error attached.

use std::sync::Arc;
use std::time::Duration;

use loom_id::WorkloadId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{ContainerEngine, ContainerHandle, ContainerSpec, EngineError, ExitStatus};
use crate::error::ErrorClass;
use crate::image_cache::ImageCache;
use crate::registry::{TransitionDetail, WorkloadRegistry};
use crate::resources::ResourceQuantity;
use crate::workload::{duration_millis, DockerPayload, WorkloadState, WorkloadType};

/// Errors from launching a container workload.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("unsupported workload type: docker is not enabled on this worker")]
    UnsupportedWorkloadType,

    #[error("invalid docker payload: {0}")]
    InvalidPayload(String),

    #[error("image pull failed for {image}: {source}")]
    ImagePullFailed {
        image: String,
        #[source]
        source: EngineError,
    },

    #[error("container create failed: {0}")]
    CreateFailed(#[source] EngineError),

    #[error("launch cancelled")]
    Cancelled,
}

impl LaunchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LaunchError::UnsupportedWorkloadType | LaunchError::InvalidPayload(_) => {
                ErrorClass::Policy
            }
            LaunchError::ImagePullFailed { .. }
            | LaunchError::CreateFailed(_)
            | LaunchError::Cancelled => ErrorClass::Runtime,
        }
    }
}

/// Calls to `wait` and `kill` made before giving up on a container.
const ENGINE_ATTEMPTS: u32 = 3;

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// How a supervised container finished.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Exited(i64),
    WaitFailed(String),
    TimedOut,
}

/// Engine-backed launcher for docker workloads.
pub struct ContainerLauncher {
    engine: Arc<dyn ContainerEngine>,
    images: Arc<ImageCache>,
    registry: Arc<WorkloadRegistry>,
    docker_enabled: bool,
}

impl ContainerLauncher {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        images: Arc<ImageCache>,
        registry: Arc<WorkloadRegistry>,
        docker_enabled: bool,
    ) -> Self {
        Self {
            engine,
            images,
            registry,
            docker_enabled,
        }
    }

    /// Launches the container for `workload_id` and returns once it is
    /// running. The workload is registered as soon as the request passes
    /// validation, so failed pulls and creates stay visible in the registry.
    pub async fn launch(
        &self,
        cancel: &CancellationToken,
        workload_id: WorkloadId,
        resources: ResourceQuantity,
        timeout: Option<Duration>,
        payload: &DockerPayload,
    ) -> Result<(), LaunchError> {
        if !self.docker_enabled {
            return Err(LaunchError::UnsupportedWorkloadType);
        }
        if payload.image.trim().is_empty() {
            return Err(LaunchError::InvalidPayload("image reference is empty".to_string()));
        }
        self.registry
            .insert(workload_id, WorkloadType::Docker, Some(payload.image.clone()));

        if let Err(e) = self.ensure_image(cancel, &workload_id, &payload.image).await {
            self.registry.transition_with(
                &workload_id,
                WorkloadState::PullFailed,
                failure_detail(&e),
            );
            return Err(e);
        }

        let spec = ContainerSpec::for_workload(&workload_id, payload, resources.cpu, resources.memory);
        let handle = match self.engine.create_and_start(&spec).await {
            Ok(handle) => handle,
            Err(source) => {
                let e = LaunchError::CreateFailed(source);
                error!(workload_id = %workload_id, error = %e, "Failed to create container");
                self.registry.transition_with(
                    &workload_id,
                    WorkloadState::CreateFailed,
                    failure_detail(&e),
                );
                return Err(e);
            }
        };

        self.registry.transition_with(
            &workload_id,
            WorkloadState::Created,
            TransitionDetail {
                container_id: Some(handle.id.clone()),
                ..Default::default()
            },
        );
        self.registry.transition(&workload_id, WorkloadState::Running);
        info!(
            workload_id = %workload_id,
            container_id = %handle.id,
            image = %payload.image,
            timeout_ms = timeout.map(duration_millis),
            "Container running"
        );

        tokio::spawn(supervise(
            Arc::clone(&self.engine),
            Arc::clone(&self.registry),
            workload_id,
            handle,
            timeout,
        ));
        Ok(())
    }

    /// Pulls the image unless cached. The cache is only updated after a
    /// pull completes; a cancelled pull is dropped mid-flight.
    async fn ensure_image(
        &self,
        cancel: &CancellationToken,
        workload_id: &WorkloadId,
        image: &str,
    ) -> Result<(), LaunchError> {
        if self.images.is_present(image) {
            debug!(workload_id = %workload_id, image = %image, "Image cache hit");
            return Ok(());
        }

        self.registry.transition(workload_id, WorkloadState::ImagePulling);
        info!(workload_id = %workload_id, image = %image, "Pulling image");

        let pulled = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(workload_id = %workload_id, image = %image, "Image pull cancelled");
                return Err(LaunchError::Cancelled);
            }
            result = self.engine.pull_image(image) => result,
        };

        pulled.map_err(|source| LaunchError::ImagePullFailed {
            image: image.to_string(),
            source,
        })?;
        self.images.mark_present(image);
        Ok(())
    }
}

fn failure_detail(e: &LaunchError) -> TransitionDetail {
    TransitionDetail {
        error_message: Some(e.to_string()),
        ..Default::default()
    }
}

/// Waits for the container to exit, killing it if the timeout fires first
/// or the engine can no longer report on it. Removes the container once it
/// is known to be stopped.
async fn supervise(
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<WorkloadRegistry>,
    workload_id: WorkloadId,
    handle: ContainerHandle,
    timeout: Option<Duration>,
) {
    let engine = engine.as_ref();
    let outcome = race_exit(engine, &handle, timeout).await;

    let (state, detail) = match outcome {
        Outcome::Exited(code) => {
            info!(workload_id = %workload_id, container_id = %handle.id, exit_code = code, "Container exited");
            (
                WorkloadState::Exited,
                TransitionDetail {
                    exit_code: Some(code),
                    ..Default::default()
                },
            )
        }
        Outcome::WaitFailed(message) => {
            error!(workload_id = %workload_id, container_id = %handle.id, error = %message, "Lost track of container, killing it");
            let error_message = format!("wait failed: {message}");
            match kill_with_retry(engine, &handle).await {
                Ok(()) => (
                    WorkloadState::Killed,
                    TransitionDetail {
                        error_message: Some(error_message),
                        ..Default::default()
                    },
                ),
                Err(e) => {
                    registry.annotate(&workload_id, format!("{error_message}; kill failed: {e}"));
                    error!(workload_id = %workload_id, container_id = %handle.id, error = %e, "Failed to kill container, leaving workload active");
                    return;
                }
            }
        }
        Outcome::TimedOut => {
            warn!(workload_id = %workload_id, container_id = %handle.id, "Workload timed out, killing container");
            match kill_with_retry(engine, &handle).await {
                Ok(()) => (WorkloadState::Killed, TransitionDetail::default()),
                Err(e) => {
                    error!(workload_id = %workload_id, container_id = %handle.id, error = %e, "Failed to kill container, waiting for it to exit");
                    registry.annotate(&workload_id, format!("kill failed: {e}"));
                    match wait_with_retry(engine, &handle).await {
                        Ok(status) => (
                            WorkloadState::Exited,
                            TransitionDetail {
                                exit_code: Some(status.code),
                                ..Default::default()
                            },
                        ),
                        Err(e) => {
                            error!(workload_id = %workload_id, container_id = %handle.id, error = %e, "Lost track of container, leaving workload active");
                            return;
                        }
                    }
                }
            }
        }
    };

    registry.transition_with(&workload_id, state, detail);

    if let Err(e) = engine.remove(&handle).await {
        warn!(workload_id = %workload_id, container_id = %handle.id, error = %e, "Failed to remove container");
    }
}

async fn race_exit(
    engine: &dyn ContainerEngine,
    handle: &ContainerHandle,
    timeout: Option<Duration>,
) -> Outcome {
    let wait = async {
        match wait_with_retry(engine, handle).await {
            Ok(status) => Outcome::Exited(status.code),
            Err(e) => Outcome::WaitFailed(e.to_string()),
        }
    };

    match timeout {
        Some(limit) => tokio::select! {
            outcome = wait => outcome,
            _ = tokio::time::sleep(limit) => Outcome::TimedOut,
        },
        None => wait.await,
    }
}

async fn wait_with_retry(
    engine: &dyn ContainerEngine,
    handle: &ContainerHandle,
) -> Result<ExitStatus, EngineError> {
    let mut attempt = 1;
    loop {
        match engine.wait(handle).await {
            Ok(status) => return Ok(status),
            Err(e) if attempt < ENGINE_ATTEMPTS => {
                warn!(container_id = %handle.id, attempt, error = %e, "Waiting on container failed, retrying");
                attempt += 1;
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn kill_with_retry(
    engine: &dyn ContainerEngine,
    handle: &ContainerHandle,
) -> Result<(), EngineError> {
    let mut attempt = 1;
    loop {
        match engine.kill(handle).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < ENGINE_ATTEMPTS => {
                warn!(container_id = %handle.id, attempt, error = %e, "Killing container failed, retrying");
                attempt += 1;
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MockEngine;

    fn launcher(engine: Arc<MockEngine>, docker_enabled: bool) -> (ContainerLauncher, Arc<WorkloadRegistry>, Arc<ImageCache>) {
        let images = Arc::new(ImageCache::with_images(["cached:1"]));
        let registry = Arc::new(WorkloadRegistry::new());
        let launcher = ContainerLauncher::new(
            engine,
            Arc::clone(&images),
            Arc::clone(&registry),
            docker_enabled,
        );
        (launcher, registry, images)
    }

    const RES: ResourceQuantity = ResourceQuantity::new(100, 128);

    /// Removal runs after the terminal transition, so poll for it.
    async fn wait_removed(engine: &MockEngine, container_id: &str) {
        for _ in 0..200 {
            if engine.removed().iter().any(|id| id == container_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("container {container_id} was not removed");
    }

    #[tokio::test]
    async fn test_disabled_docker_is_rejected() {
        let engine = Arc::new(MockEngine::new());
        let (launcher, registry, _) = launcher(Arc::clone(&engine), false);
        let id = WorkloadId::generate();

        let err = launcher
            .launch(&CancellationToken::new(), id, RES, None, &DockerPayload::new("alpine"))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::UnsupportedWorkloadType));
        assert!(registry.status(&id).is_none());
        assert_eq!(engine.pull_count(), 0);
        assert_eq!(engine.create_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_image_is_rejected() {
        let engine = Arc::new(MockEngine::new());
        let (launcher, registry, _) = launcher(Arc::clone(&engine), true);

        let err = launcher
            .launch(&CancellationToken::new(), WorkloadId::generate(), RES, None, &DockerPayload::new("  "))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::InvalidPayload(_)));
        assert_eq!(err.class(), ErrorClass::Policy);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_pull_without_caching() {
        let engine = Arc::new(MockEngine::new().with_pull_delay(Duration::from_secs(30)));
        let (launcher, registry, images) = launcher(Arc::clone(&engine), true);
        let id = WorkloadId::generate();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = launcher
            .launch(&cancel, id, RES, None, &DockerPayload::new("slow:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::Cancelled));
        assert!(!images.is_present("slow:1"));
        assert_eq!(registry.status(&id).unwrap().state, WorkloadState::PullFailed);
        assert_eq!(engine.create_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_kills_exactly_once() {
        let engine = Arc::new(MockEngine::new().with_run_duration(Duration::from_secs(30)));
        let (launcher, registry, _) = launcher(Arc::clone(&engine), true);
        let id = WorkloadId::generate();

        launcher
            .launch(
                &CancellationToken::new(),
                id,
                RES,
                Some(Duration::from_millis(30)),
                &DockerPayload::new("cached:1"),
            )
            .await
            .unwrap();

        assert_eq!(registry.wait_terminal(&id).await, Some(WorkloadState::Killed));
        let status = registry.status(&id).unwrap();
        let container_id = status.container_id.unwrap();
        assert_eq!(engine.killed(), vec![container_id.clone()]);
        assert_eq!(engine.kill_attempts(), 1);
        assert_eq!(status.exit_code, None);

        wait_removed(&engine, &container_id).await;
        assert_eq!(engine.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_exit_before_timeout_is_not_killed() {
        let engine = Arc::new(
            MockEngine::new()
                .with_run_duration(Duration::from_millis(10))
                .with_exit_code(7),
        );
        let (launcher, registry, _) = launcher(Arc::clone(&engine), true);
        let id = WorkloadId::generate();

        launcher
            .launch(
                &CancellationToken::new(),
                id,
                RES,
                Some(Duration::from_secs(30)),
                &DockerPayload::new("cached:1"),
            )
            .await
            .unwrap();

        assert_eq!(registry.wait_terminal(&id).await, Some(WorkloadState::Exited));
        let status = registry.status(&id).unwrap();
        assert_eq!(status.exit_code, Some(7));
        assert!(engine.killed().is_empty());
        assert_eq!(engine.kill_attempts(), 0);

        wait_removed(&engine, &status.container_id.unwrap()).await;
    }

    #[tokio::test]
    async fn test_failed_wait_kills_container() {
        let engine = Arc::new(MockEngine::new());
        engine.set_fail_waits(true);
        let (launcher, registry, _) = launcher(Arc::clone(&engine), true);
        let id = WorkloadId::generate();

        launcher
            .launch(
                &CancellationToken::new(),
                id,
                RES,
                Some(Duration::from_secs(60)),
                &DockerPayload::new("cached:1"),
            )
            .await
            .unwrap();

        assert_eq!(registry.wait_terminal(&id).await, Some(WorkloadState::Killed));
        let status = registry.status(&id).unwrap();
        let container_id = status.container_id.unwrap();
        assert_eq!(engine.wait_count(), u64::from(ENGINE_ATTEMPTS));
        assert_eq!(engine.killed(), vec![container_id.clone()]);
        assert_eq!(status.exit_code, None);
        assert!(status.error_message.unwrap().starts_with("wait failed"));

        wait_removed(&engine, &container_id).await;
    }

    #[tokio::test]
    async fn test_failed_kill_is_not_recorded_as_killed() {
        let engine = Arc::new(MockEngine::new().with_run_duration(Duration::from_millis(400)));
        engine.set_fail_kills(true);
        let (launcher, registry, _) = launcher(Arc::clone(&engine), true);
        let id = WorkloadId::generate();

        launcher
            .launch(
                &CancellationToken::new(),
                id,
                RES,
                Some(Duration::from_millis(30)),
                &DockerPayload::new("cached:1"),
            )
            .await
            .unwrap();

        // The kill never lands, so the workload only finishes when the
        // container exits on its own.
        assert_eq!(registry.wait_terminal(&id).await, Some(WorkloadState::Exited));
        let status = registry.status(&id).unwrap();
        assert_eq!(engine.kill_attempts(), u64::from(ENGINE_ATTEMPTS));
        assert!(engine.killed().is_empty());
        assert_eq!(status.exit_code, Some(0));
        assert!(status.error_message.unwrap().starts_with("kill failed"));

        wait_removed(&engine, &status.container_id.unwrap()).await;
    }

    #[tokio::test]
    async fn test_unkillable_container_stays_active() {
        let engine = Arc::new(MockEngine::new());
        engine.set_fail_waits(true);
        engine.set_fail_kills(true);
        let (launcher, registry, _) = launcher(Arc::clone(&engine), true);
        let id = WorkloadId::generate();

        launcher
            .launch(&CancellationToken::new(), id, RES, None, &DockerPayload::new("cached:1"))
            .await
            .unwrap();

        for _ in 0..200 {
            if engine.kill_attempts() == u64::from(ENGINE_ATTEMPTS) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = registry.status(&id).unwrap();
        assert_eq!(status.state, WorkloadState::Running);
        assert!(status.error_message.unwrap().contains("kill failed"));
        assert_eq!(registry.active_count(), 1);
        assert!(engine.removed().is_empty());
    }
}
