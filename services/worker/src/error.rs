//! Error classification shared by the worker's subsystems.
//!
//! Callers on the other side of the worker boundary (the HTTP layer, the
//! scheduler) need to tell apart "try another worker", "fix the request" and
//! "this worker is unhealthy" without matching on every concrete variant.

use serde::Serialize;

/// Coarse category of a worker error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Not enough free capacity right now. Retry elsewhere or later.
    Capacity,
    /// The request violates worker policy and will never succeed as-is.
    Policy,
    /// The referenced object does not exist (double free, wrong id).
    NotFound,
    /// The worker itself is misconfigured. Fatal at startup.
    Configuration,
    /// An infrastructure failure while serving one request.
    Runtime,
}

impl ErrorClass {
    /// Whether sending the same request again (here or elsewhere) can succeed.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Capacity | ErrorClass::Runtime)
    }
}
