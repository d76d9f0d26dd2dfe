//! Container engine capability and an in-process mock.
//!
//! The worker never isolates anything itself. It asks an engine to pull an
//! image, create and start a container, wait for it to exit, or kill it.
//! [`crate::docker::DockerEngine`] speaks to a real Docker daemon;
//! [`MockEngine`] stands in for it in development and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::workload::DockerPayload;
use loom_id::WorkloadId;

/// Errors reported by a container engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container engine unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("engine API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("pull of {image} failed: {message}")]
    Pull { image: String, message: String },
}

impl From<hyper::http::Error> for EngineError {
    fn from(err: hyper::http::Error) -> Self {
        EngineError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// What to create. Limits come from the workload's granted resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: Vec<String>,
    pub cpu_millis: i64,
    pub memory_mib: i64,
}

impl ContainerSpec {
    pub fn for_workload(
        workload_id: &WorkloadId,
        payload: &DockerPayload,
        cpu_millis: i64,
        memory_mib: i64,
    ) -> Self {
        Self {
            name: workload_id.to_string(),
            image: payload.image.clone(),
            command: payload.command.clone(),
            env: payload.env.clone(),
            cpu_millis,
            memory_mib,
        }
    }

    /// CPU limit in the engine's nano-CPU unit.
    pub fn nano_cpus(&self) -> i64 {
        self.cpu_millis.saturating_mul(1_000_000)
    }

    pub fn memory_bytes(&self) -> i64 {
        self.memory_mib.saturating_mul(1024 * 1024)
    }
}

/// Handle to a created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
}

/// How a container finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i64,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Container engine interface.
///
/// Pulls must be safe to issue concurrently for the same image.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Make an image present locally. May block for a long time.
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Create and start a container. Returns once the engine accepted it.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerHandle, EngineError>;

    /// Wait until the container exits.
    async fn wait(&self, handle: &ContainerHandle) -> Result<ExitStatus, EngineError>;

    /// Forcibly stop the container. Stopping one that already exited is not
    /// an error.
    async fn kill(&self, handle: &ContainerHandle) -> Result<(), EngineError>;

    /// Delete the container, stopping it first if needed. Deleting one that
    /// is already gone is not an error.
    async fn remove(&self, handle: &ContainerHandle) -> Result<(), EngineError>;
}

/// Engine that runs nothing. Containers "run" for a fixed duration.
pub struct MockEngine {
    pull_delay: Duration,
    run_duration: Duration,
    exit_code: i64,
    fail_pulls: AtomicBool,
    fail_creates: AtomicBool,
    fail_waits: AtomicBool,
    fail_kills: AtomicBool,
    pulls: AtomicU64,
    creates: AtomicU64,
    waits: AtomicU64,
    kill_attempts: AtomicU64,
    counter: AtomicU64,
    killed: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            pull_delay: Duration::ZERO,
            run_duration: Duration::from_millis(10),
            exit_code: 0,
            fail_pulls: AtomicBool::new(false),
            fail_creates: AtomicBool::new(false),
            fail_waits: AtomicBool::new(false),
            fail_kills: AtomicBool::new(false),
            pulls: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            kill_attempts: AtomicU64::new(0),
            counter: AtomicU64::new(0),
            killed: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Every pull sleeps this long before succeeding.
    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = delay;
        self
    }

    /// Every container exits this long after it starts.
    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = duration;
        self
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn set_fail_pulls(&self, fail: bool) {
        self.fail_pulls.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Every wait errors immediately, as when the daemon drops the connection.
    pub fn set_fail_waits(&self, fail: bool) {
        self.fail_waits.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_kills(&self, fail: bool) {
        self.fail_kills.store(fail, Ordering::SeqCst);
    }

    /// Number of pulls that were started (including failed or aborted ones).
    pub fn pull_count(&self) -> u64 {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn wait_count(&self) -> u64 {
        self.waits.load(Ordering::SeqCst)
    }

    /// Kill calls, successful or not.
    pub fn kill_attempts(&self) -> u64 {
        self.kill_attempts.load(Ordering::SeqCst)
    }

    /// Ids of containers that were killed successfully.
    pub fn killed(&self) -> Vec<String> {
        self.killed
            .lock()
            .map(|killed| killed.clone())
            .unwrap_or_default()
    }

    /// Ids of containers that were removed.
    pub fn removed(&self) -> Vec<String> {
        self.removed
            .lock()
            .map(|removed| removed.clone())
            .unwrap_or_default()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        info!(image = %image, "[MOCK] Pulling image");
        tokio::time::sleep(self.pull_delay).await;

        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(EngineError::Pull {
                image: image.to_string(),
                message: "mock engine configured to fail pulls".to_string(),
            });
        }
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerHandle, EngineError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(EngineError::Api {
                status: 500,
                message: "mock engine configured to fail creates".to_string(),
            });
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = ContainerHandle {
            id: format!("mock_{:016x}", n),
        };
        info!(
            name = %spec.name,
            image = %spec.image,
            container_id = %handle.id,
            "[MOCK] Container started"
        );
        Ok(handle)
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<ExitStatus, EngineError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        if self.fail_waits.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable(
                "mock engine configured to fail waits".to_string(),
            ));
        }
        tokio::time::sleep(self.run_duration).await;
        debug!(container_id = %handle.id, "[MOCK] Container exited");
        Ok(ExitStatus {
            code: self.exit_code,
        })
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        self.kill_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_kills.load(Ordering::SeqCst) {
            return Err(EngineError::Api {
                status: 500,
                message: "mock engine configured to fail kills".to_string(),
            });
        }
        info!(container_id = %handle.id, "[MOCK] Killing container");
        if let Ok(mut killed) = self.killed.lock() {
            killed.push(handle.id.clone());
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        debug!(container_id = %handle.id, "[MOCK] Removing container");
        if let Ok(mut removed) = self.removed.lock() {
            removed.push(handle.id.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_limits() {
        let spec = ContainerSpec::for_workload(
            &WorkloadId::generate(),
            &DockerPayload::new("alpine"),
            250,
            512,
        );
        assert_eq!(spec.nano_cpus(), 250_000_000);
        assert_eq!(spec.memory_bytes(), 512 * 1024 * 1024);
        assert!(spec.name.starts_with("wrkl_"));
    }

    #[tokio::test]
    async fn test_mock_engine_lifecycle() {
        let engine = MockEngine::new().with_exit_code(3);
        engine.pull_image("alpine").await.unwrap();
        let spec = ContainerSpec::for_workload(
            &WorkloadId::generate(),
            &DockerPayload::new("alpine"),
            100,
            128,
        );
        let handle = engine.create_and_start(&spec).await.unwrap();
        assert!(handle.id.starts_with("mock_"));

        let status = engine.wait(&handle).await.unwrap();
        assert_eq!(status.code, 3);
        assert!(!status.success());
        engine.remove(&handle).await.unwrap();
        assert_eq!(engine.removed(), vec![handle.id.clone()]);
        assert_eq!(engine.pull_count(), 1);
        assert_eq!(engine.create_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_engine_failures() {
        let engine = MockEngine::new();
        engine.set_fail_pulls(true);
        assert!(matches!(
            engine.pull_image("alpine").await,
            Err(EngineError::Pull { .. })
        ));

        engine.set_fail_waits(true);
        let handle = ContainerHandle {
            id: "mock_0".to_string(),
        };
        assert!(engine.wait(&handle).await.is_err());

        engine.set_fail_kills(true);
        assert!(engine.kill(&handle).await.is_err());
        assert_eq!(engine.kill_attempts(), 1);
        assert!(engine.killed().is_empty());

        engine.set_fail_creates(true);
        let spec = ContainerSpec::for_workload(
            &WorkloadId::generate(),
            &DockerPayload::new("alpine"),
            100,
            128,
        );
        assert!(engine.create_and_start(&spec).await.is_err());
    }
}
