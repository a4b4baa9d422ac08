//! micro-ROS agent supervisor
//!
//! Owns the lifecycle of the single micro-ROS agent process run by the BlueOS
//! extension: launching it from the persisted settings, stopping it with a bounded
//! SIGTERM/SIGKILL escalation, detecting crashes, and capturing its output.
//!
//! A crashed agent is reported as [`AgentState::Crashed`](uros_core::AgentState)
//! and left alone; restarting it is up to the caller.

mod logs;
mod process;
mod supervisor;

pub use logs::{LaunchLog, LogCapture, LogLine, LogPage, LogStream};
pub use process::{ProcessSupervisor, launch_command_line};
pub use supervisor::{AgentControl, HealthStatus};
pub use uros_core::{Error, Result};
