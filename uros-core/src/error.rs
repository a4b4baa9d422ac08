//! Error types for the micro-ROS agent extension

use crate::lifecycle::ExitInfo;
use serde::Serialize;

/// Result type for extension operations
pub type Result<T> = std::result::Result<T, Error>;

/// A configuration field that failed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("invalid {field}: {message}")]
pub struct ValidationError {
    /// Name of the offending field as it appears on the wire
    pub field: &'static str,
    /// Human readable reason
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Error types for the extension
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration field is invalid; nothing was changed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The agent is already starting or running
    #[error("micro-ROS agent is already running")]
    AlreadyRunning,

    /// The agent is stopped or crashed
    #[error("micro-ROS agent is not running")]
    NotRunning,

    /// Settings cannot change while the agent is active
    #[error("micro-ROS agent is active; stop it before changing its settings")]
    AgentActive,

    /// Another lifecycle operation holds the supervisor
    #[error("another lifecycle operation is in progress")]
    Busy,

    /// The agent process could not be spawned
    #[error("failed to launch micro-ROS agent: {0}")]
    LaunchFailure(String),

    /// The agent exited during its startup grace window
    #[error("micro-ROS agent exited during startup ({0})")]
    Crashed(ExitInfo),

    /// Settings could not be durably written
    #[error("failed to persist settings: {0}")]
    Persistence(String),

    /// Service configuration is invalid
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::AlreadyRunning => "already_running",
            Error::NotRunning => "not_running",
            Error::AgentActive => "agent_active",
            Error::Busy => "busy",
            Error::LaunchFailure(_) => "launch_failure",
            Error::Crashed(_) => "crashed",
            Error::Persistence(_) => "persistence_failure",
            Error::Configuration(_) => "configuration_error",
        }
    }

    /// True for errors caused by the lifecycle state rather than the request itself
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::AlreadyRunning | Error::NotRunning | Error::AgentActive | Error::Busy
        )
    }
}
