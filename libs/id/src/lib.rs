//! # loom-id
//!
//! Opaque identifiers handed out by a loom worker.
//!
//! Every identifier is `{prefix}_{ulid}`:
//!
//! - `alloc_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a resource allocation
//! - `wrkl_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for a workload
//!
//! The prefix makes a misplaced identifier fail to parse instead of
//! silently matching nothing, and the ULID carries 80 random bits so
//! identifiers never collide within a process lifetime.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for callers that build identifiers from raw ULIDs.
pub use ulid::Ulid;
