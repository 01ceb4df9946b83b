//! Error taxonomy for the agent loop.
//!
//! Recoverable classes (`BackendError`, malformed/non-conformant replies) are
//! retried locally up to a fixed bound. Policy refusals and command failures are
//! never retried with the same action: they become data in the conversation.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::policy::PolicyViolation;

/// Failure to obtain a reply from the generative backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Backend could not be reached or answered with an unusable response.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// No response arrived within the configured duration.
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),
}

/// Rejection of a raw backend reply by the action validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Reply is not a single well-formed JSON object with nothing around it.
    #[error("malformed output: {0}")]
    MalformedOutput(String),
    /// Reply parsed but does not match the action shape.
    #[error("schema violation:\n- {}", .0.join("\n- "))]
    SchemaViolation(Vec<String>),
    /// Reply is well-formed but its command is refused on safety grounds.
    #[error("policy violation: {0}")]
    PolicyViolation(PolicyViolation),
}

impl ValidationError {
    /// Whether a corrective re-prompt may fix this rejection.
    pub fn is_correctable(&self) -> bool {
        matches!(
            self,
            ValidationError::MalformedOutput(_) | ValidationError::SchemaViolation(_)
        )
    }
}

/// Failure raised by the shell abstraction before any process is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShellError {
    #[error("invalid working directory {}", .0.display())]
    InvalidWorkingDirectory(PathBuf),
}

/// Top-level failure of a loop controller run.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Shell(#[from] ShellError),
    #[error("cancelled by user")]
    UserCancelled,
    #[error("invalid loop state: {0}")]
    InvalidState(String),
}

impl AgentError {
    /// Whether the run may continue after this error (possibly after asking the user).
    pub fn is_recoverable(&self) -> bool {
        match self {
            AgentError::Backend(BackendError::Timeout(_)) => true,
            AgentError::Backend(BackendError::Unavailable(_)) => false,
            AgentError::Validation(_) => true,
            AgentError::Shell(_) => true,
            AgentError::UserCancelled => true,
            AgentError::InvalidState(_) => false,
        }
    }
}
