//! Core types for the micro-ROS agent BlueOS extension
//!
//! Holds everything that does not touch a process:
//!
//! - [`agent`]: the run configuration, its validation and the agent argument builder
//! - [`settings`]: the durable settings store
//! - [`lifecycle`]: supervised process states and status records
//! - [`config`]: configuration of the extension service itself
//! - [`error`]: the error taxonomy shared by every layer

pub mod agent;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod settings;

pub use agent::{AgentConfig, ConfigCandidate, Transport};
pub use config::ExtensionConfig;
pub use error::{Error, Result, ValidationError};
pub use lifecycle::{AgentState, AgentStatus, ExitInfo};
pub use settings::{AgentSettings, SettingsStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
