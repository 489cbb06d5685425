//! Error taxonomy of the control core. Idempotent no-ops (stopping an idle
//! system, starting a running one) are successes and never appear here.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("irrigation system '{0}' not found")]
    NotFound(String),

    #[error("invalid action '{0}' (use start/stop)")]
    InvalidAction(String),

    #[error("invalid duration {0}: must be a whole number of minutes, 0 or more")]
    InvalidDuration(String),

    /// The request body could not be read as a command at all.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid irrigation system: {0}")]
    InvalidSystem(String),

    #[error("irrigation system '{0}' already exists")]
    AlreadyExists(String),

    /// An open log was found despite the registry guard. Indicates a logic
    /// bug and is never retried.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
}

impl ControlError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidAction(_) => "invalid_action",
            Self::InvalidDuration(_) => "invalid_duration",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidSystem(_) => "invalid_system",
            Self::AlreadyExists(_) => "already_exists",
            Self::Conflict(_) => "conflict",
            Self::Persistence(_) => "persistence_error",
        }
    }
}
