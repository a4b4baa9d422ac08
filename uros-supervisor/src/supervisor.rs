//! Supervisor trait

use crate::LogCapture;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uros_core::{AgentConfig, AgentStatus, ConfigCandidate, Result, SettingsStore};

/// Control surface over the single supervised micro-ROS agent
#[async_trait]
pub trait AgentControl: Send + Sync {
    /// Launch the agent with the persisted configuration
    async fn start(&self) -> Result<AgentStatus>;

    /// Stop the agent, escalating to a forced kill after the shutdown timeout
    async fn stop(&self) -> Result<AgentStatus>;

    /// Stop (when active) and start again as one lifecycle operation
    async fn restart(&self) -> Result<AgentStatus>;

    /// Validate and persist a new configuration while the agent is inactive
    async fn configure(&self, candidate: ConfigCandidate) -> Result<AgentConfig>;

    /// Persist the auto-start flag; allowed in any state
    async fn set_enabled(&self, enabled: bool) -> Result<()>;

    /// Current status; never waits for a lifecycle operation
    fn status(&self) -> AgentStatus;

    /// Liveness of the supervised process
    fn health_check(&self) -> HealthStatus;

    /// Persisted settings
    fn settings(&self) -> &SettingsStore;

    /// Captured agent output
    fn logs(&self) -> &LogCapture;
}

/// Health status of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Agent is running and its process exists
    Healthy,
    /// Agent crashed, or is marked running but its process is gone
    Unhealthy,
    /// Agent is not supposed to be running, or is between states
    Unknown,
}
