//! Error types for the call engine

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallEngineError {
    /// Bad input from a caller (e.g. non-positive reader capacity)
    #[error("Validation error: {0}")]
    Validation(String),

    /// State machine contract violation
    #[error("Invalid transition for session {session_id}: {detail}")]
    InvalidTransition { session_id: String, detail: String },

    /// Referenced session does not exist
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Referenced reader does not exist
    #[error("Reader not found: {0}")]
    ReaderNotFound(String),

    /// Storage layer failure; the triggering operation aborts without
    /// partial state mutation
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Notification delivery failure; logged, never propagated out of a
    /// state transition
    #[error("Dispatch failure: {0}")]
    Dispatch(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CallEngineError {
    pub fn invalid_transition(session_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvalidTransition {
            session_id: session_id.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CallEngineError>;
