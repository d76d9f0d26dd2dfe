//! Workload request model and lifecycle states.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::ResourceQuantity;

/// The kinds of workload a worker can be configured to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
    /// No-op launch used to exercise the control path locally.
    Dev,
    /// A container run through the container engine.
    Docker,
    /// A microVM. Recognized in configuration, but no launcher exists.
    Firecracker,
}

impl WorkloadType {
    pub const ALL: [WorkloadType; 3] = [
        WorkloadType::Dev,
        WorkloadType::Docker,
        WorkloadType::Firecracker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::Dev => "dev",
            WorkloadType::Docker => "docker",
            WorkloadType::Firecracker => "firecracker",
        }
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A token that is not one of the known workload type names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown workload type '{0}'")]
pub struct UnknownWorkloadType(pub String);

impl FromStr for WorkloadType {
    type Err = UnknownWorkloadType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkloadType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownWorkloadType(s.to_string()))
    }
}

/// Resolves the configured set of supported workload types.
///
/// Unset or blank configuration means `{dev, docker}`. Otherwise every
/// comma-separated token must name a known type; the first unknown token
/// fails the whole call.
pub fn parse_supported_types(
    configured: Option<&str>,
) -> Result<BTreeSet<WorkloadType>, UnknownWorkloadType> {
    let configured = configured.map(str::trim).unwrap_or_default();
    if configured.is_empty() {
        return Ok(BTreeSet::from([WorkloadType::Dev, WorkloadType::Docker]));
    }

    configured
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(WorkloadType::from_str)
        .collect()
}

/// Payload of a container workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerPayload {
    /// Image reference, e.g. `alpine:3.19` or `ghcr.io/org/app@sha256:...`.
    pub image: String,

    /// Overrides the image's default command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// `KEY=value` environment entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

impl DockerPayload {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            command: None,
            env: Vec::new(),
        }
    }
}

/// Payload of a microVM workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirecrackerPayload {
    pub rootfs: String,
}

/// Type-specific workload data. The variant determines the workload type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkloadPayload {
    Dev,
    Docker(DockerPayload),
    Firecracker(FirecrackerPayload),
}

/// A request to run one unit of work on this worker.
///
/// `resources` is the shape granted by a prior allocation. The worker does
/// not check that the allocation still exists; sequencing allocate, start
/// and free is the caller's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub resources: ResourceQuantity,

    /// Kill the workload if it is still running after this long.
    #[serde(
        default,
        rename = "timeout_ms",
        with = "duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,

    #[serde(flatten)]
    pub payload: WorkloadPayload,
}

impl Workload {
    pub fn dev(resources: ResourceQuantity) -> Self {
        Self {
            resources,
            timeout: None,
            payload: WorkloadPayload::Dev,
        }
    }

    pub fn docker(resources: ResourceQuantity, image: impl Into<String>) -> Self {
        Self {
            resources,
            timeout: None,
            payload: WorkloadPayload::Docker(DockerPayload::new(image)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn workload_type(&self) -> WorkloadType {
        match self.payload {
            WorkloadPayload::Dev => WorkloadType::Dev,
            WorkloadPayload::Docker(_) => WorkloadType::Docker,
            WorkloadPayload::Firecracker(_) => WorkloadType::Firecracker,
        }
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_u64(super::duration_millis(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Lifecycle of a container-backed workload.
///
/// ```text
/// pending -> image_pulling -> created -> running -> exited
///    |             |                       |
///    |             +--> pull_failed        +------> killed
///    +--------------------------+
///    |                          v
///    +------------------> create_failed
/// ```
///
/// `pending` skips straight to `created` when the image is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadState {
    Pending,
    ImagePulling,
    Created,
    Running,
    Exited,
    Killed,
    PullFailed,
    CreateFailed,
}

impl WorkloadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkloadState::Exited
                | WorkloadState::Killed
                | WorkloadState::PullFailed
                | WorkloadState::CreateFailed
        )
    }

    pub fn can_transition_to(&self, next: WorkloadState) -> bool {
        use WorkloadState::*;
        matches!(
            (self, next),
            (Pending, ImagePulling)
                | (Pending, Created)
                | (Pending, PullFailed)
                | (Pending, CreateFailed)
                | (ImagePulling, Created)
                | (ImagePulling, PullFailed)
                | (ImagePulling, CreateFailed)
                | (Created, Running)
                | (Running, Exited)
                | (Running, Killed)
        )
    }
}

impl fmt::Display for WorkloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadState::Pending => "pending",
            WorkloadState::ImagePulling => "image_pulling",
            WorkloadState::Created => "created",
            WorkloadState::Running => "running",
            WorkloadState::Exited => "exited",
            WorkloadState::Killed => "killed",
            WorkloadState::PullFailed => "pull_failed",
            WorkloadState::CreateFailed => "create_failed",
        };
        f.write_str(s)
    }
}
