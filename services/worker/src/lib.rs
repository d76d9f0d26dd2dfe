//! Loom Worker Library
//!
//! The worker runs on each compute host. It offers a fixed CPU/memory
//! budget, lets callers reserve slices of it, and launches workloads
//! (containers, or a no-op dev stub) against those reservations.
//!
//! ## Architecture
//!
//! ```text
//! ResourceManager            (ledger of free capacity and allocations)
//! WorkloadManager            (validates and dispatches workloads)
//! ├── ImageCache             (images known to be present)
//! ├── WorkloadRegistry       (container workload lifecycle)
//! └── ContainerLauncher      (pull, create, supervise with timeout)
//!     └── dyn ContainerEngine  (DockerEngine in prod, MockEngine in dev)
//! ```
//!
//! Resource accounting and workload launch are independent calls. The
//! caller allocates, starts the workload with the granted shape, and frees
//! the allocation when the workload ends.

pub mod config;
pub mod docker;
pub mod engine;
pub mod error;
pub mod host;
pub mod image_cache;
pub mod launcher;
pub mod manager;
pub mod registry;
pub mod resources;
pub mod workload;

// Re-export commonly used types
pub use engine::{ContainerEngine, EngineError, MockEngine};
pub use error::ErrorClass;
pub use image_cache::ImageCache;
pub use manager::{WorkloadError, WorkloadManager};
pub use resources::{ResourceError, ResourceManager, ResourceQuantity};
pub use workload::{Workload, WorkloadPayload, WorkloadState, WorkloadType};

pub use loom_id::{AllocationId, WorkloadId};
