pub mod checkpoint_store;
pub mod command_runner;
pub mod jwks;
pub mod kernel;

use thiserror::Error;

/// Failure reported by any external collaborator (kernel, CLI tool, store).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("{0} is not installed or not on PATH")]
    DependencyMissing(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    InvalidWorkflow(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Failed(String),
}

impl AdapterError {
    /// Maps an error code emitted by the kernel or a tool's JSON output.
    pub fn from_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code.trim().to_ascii_uppercase().as_str() {
            "NOT_FOUND" | "SESSION_NOT_FOUND" | "PANE_NOT_FOUND" => AdapterError::NotFound(message),
            "INVALID_ARGS" | "INVALID_ARGUMENT" | "BAD_REQUEST" | "VALIDATION" => {
                AdapterError::Invalid(message)
            }
            "INVALID_WORKFLOW" => AdapterError::InvalidWorkflow(message),
            "CONFLICT" | "ALREADY_EXISTS" => AdapterError::Conflict(message),
            "DEPENDENCY_MISSING" | "NOT_INSTALLED" => AdapterError::DependencyMissing(message),
            "TIMEOUT" => AdapterError::Timeout(message),
            "UNAVAILABLE" | "SERVICE_UNAVAILABLE" => AdapterError::Unavailable(message),
            _ => AdapterError::Failed(message),
        }
    }
}
