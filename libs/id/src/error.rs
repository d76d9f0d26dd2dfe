//! Identifier parse errors.

use thiserror::Error;

/// Why a string could not be parsed as a typed identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    #[error("identifier has no '_' between prefix and ULID")]
    MissingSeparator,

    #[error("wrong identifier prefix: expected '{expected}', got '{actual}'")]
    WrongPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("malformed ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// True when the identifier belongs to a different kind of object.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::WrongPrefix { .. })
    }
}
