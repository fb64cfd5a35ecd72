//! Error types for worker supervision and connectivity.

use thiserror::Error;

/// Failures of a single `start_host` attempt.
///
/// Cloneable so that every caller awaiting the same in-flight start observes
/// the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    /// A required path is empty or does not exist.
    #[error("Invalid host configuration: {0}")]
    Configuration(String),

    /// The process could not be spawned or reported an I/O error.
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    /// The process exited before printing its readiness marker.
    #[error("Worker exited before becoming ready (exit code: {})", display_code(.0))]
    Exited(Option<i32>),

    /// `stop_host` was called while the start was still pending.
    #[error("Worker start was cancelled")]
    Cancelled,
}

/// Errors surfaced by the warden components.
#[derive(Debug, Error)]
pub enum WardenError {
    /// Missing or invalid configuration value.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The worker process could not be spawned.
    #[error("Process spawn error: {0}")]
    ProcessSpawn(String),

    /// The worker process exited prematurely.
    #[error("Process exited with code {}", display_code(.0))]
    ProcessExit(Option<i32>),

    /// Every connection attempt failed.
    #[error("Connection timed out after {attempts} attempts")]
    ConnectionTimeout { attempts: u32 },

    /// A stop or disconnect aborted the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// The health endpoint did not answer.
    #[error("Worker not reachable at {0}")]
    ServerNotReachable(String),

    /// The external record store rejected an operation.
    #[error("Record store error: {0}")]
    Store(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SupervisorError> for WardenError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Configuration(msg) => WardenError::Configuration(msg),
            SupervisorError::Spawn(msg) => WardenError::ProcessSpawn(msg),
            SupervisorError::Exited(code) => WardenError::ProcessExit(code),
            SupervisorError::Cancelled => WardenError::Cancelled,
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}
