//! Lifecycle states and status records of the supervised agent

use crate::agent::AgentConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// State of the supervised agent process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// No process; either never started or stopped on request
    #[default]
    Stopped,
    /// Spawned, waiting out the startup grace window
    Starting,
    /// Alive past the startup grace window
    Running,
    /// Termination requested, waiting for exit
    Stopping,
    /// Exited without being asked to
    Crashed,
}

impl AgentState {
    /// True while a process exists for this state
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AgentState::Starting | AgentState::Running | AgentState::Stopping
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Stopped => write!(f, "stopped"),
            AgentState::Starting => write!(f, "starting"),
            AgentState::Running => write!(f, "running"),
            AgentState::Stopping => write!(f, "stopping"),
            AgentState::Crashed => write!(f, "crashed"),
        }
    }
}

/// How a launch ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one
    pub signal: Option<i32>,
    /// When the exit was observed
    pub exited_at: DateTime<Utc>,
    /// True when the exit followed an explicit stop
    pub expected: bool,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus, expected: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            exited_at: Utc::now(),
            expected,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "killed by signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Point-in-time view of the supervised agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: AgentState,
    /// Process ID while a process exists
    pub pid: Option<u32>,
    /// Identifier of the current (or most recent) launch
    pub launch_id: Option<u64>,
    /// When the current launch was spawned
    pub started_at: Option<DateTime<Utc>>,
    /// Configuration the current launch was spawned with
    pub config: Option<AgentConfig>,
    /// How the previous launch ended
    pub last_exit: Option<ExitInfo>,
    /// Last launch failure message
    pub last_error: Option<String>,
}

impl AgentStatus {
    /// Time since spawn, only while a process exists
    pub fn uptime(&self) -> Option<Duration> {
        if !self.state.is_active() {
            return None;
        }
        self.started_at
            .and_then(|started| (Utc::now() - started).to_std().ok())
    }
}
