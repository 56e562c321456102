//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (malformed identifiers,
/// statuses or payloads). Transport and storage concerns belong to the
/// client crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. empty or not a UUID).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A job status string is not one the client understands.
    #[error("unknown job status: {0}")]
    UnknownStatus(String),

    /// An action payload does not have the shape its kind requires.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}
