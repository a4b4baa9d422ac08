//! Service configuration for the extension
//!
//! This is configuration of the extension itself (where to listen, which binary
//! to supervise, timeouts), as opposed to the agent run settings persisted by
//! [`crate::settings::SettingsStore`].

use crate::error::{Error, Result};
use crate::settings::DEFAULT_SETTINGS_PATH;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the extension
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtensionConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Settings store configuration
    #[serde(default)]
    pub settings: SettingsConfig,

    /// Supervised agent configuration
    #[serde(default)]
    pub agent: AgentProcessConfig,

    /// Log capture configuration
    #[serde(default)]
    pub logs: LogConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the control API listens on
    pub bind: SocketAddr,

    /// Directory with the bundled web UI, served at `/`
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 9133)),
            static_dir: None,
        }
    }
}

/// Settings store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Path of the persisted settings document
    pub path: PathBuf,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SETTINGS_PATH),
        }
    }
}

/// Supervised agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProcessConfig {
    /// Agent executable, resolved through `PATH` when relative
    pub binary: PathBuf,

    /// Fixed arguments placed before the transport
    #[serde(default)]
    pub prefix_args: Vec<String>,

    /// Window in which an exit counts as a failed start
    #[serde(with = "humantime_serde")]
    pub startup_grace: Duration,

    /// Time allowed after SIGTERM before escalating to SIGKILL
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Time allowed after SIGKILL for the exit to be observed
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,

    /// How long a lifecycle request waits for another one to finish
    #[serde(with = "humantime_serde")]
    pub lock_wait: Duration,
}

impl Default for AgentProcessConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("micro-ros-agent"),
            prefix_args: Vec::new(),
            startup_grace: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(2),
            lock_wait: Duration::from_millis(250),
        }
    }
}

/// Log capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Lines retained per launch
    pub max_lines: usize,

    /// Longer lines are split into chunks of this size
    pub max_line_bytes: usize,

    /// Previous launches retained after rotation
    pub history: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_lines: 1000,
            max_line_bytes: 4096,
            history: 1,
        }
    }
}

impl ExtensionConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `uros.toml` in the working directory
    /// 3. File named by `UROS_CONFIG_PATH`
    /// 4. `path`, when given
    /// 5. `UROS_` environment variables, nested with `__` (`UROS_AGENT__BINARY`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is malformed or the result is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(ExtensionConfig::default()))
            .merge(Toml::file("uros.toml"));

        if let Ok(path) = std::env::var("UROS_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }

        let config: ExtensionConfig = figment
            .merge(Env::prefixed("UROS_").ignore(&["CONFIG_PATH"]).split("__"))
            .extract()
            .map_err(|e| Error::Configuration(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<()> {
        if self.agent.binary.as_os_str().is_empty() {
            return Err(Error::Configuration("agent.binary must not be empty".into()));
        }
        if self.agent.startup_grace.is_zero() {
            return Err(Error::Configuration("agent.startup_grace must be positive".into()));
        }
        if self.agent.kill_timeout.is_zero() {
            return Err(Error::Configuration("agent.kill_timeout must be positive".into()));
        }
        if self.logs.max_lines == 0 {
            return Err(Error::Configuration("logs.max_lines must be positive".into()));
        }
        Ok(())
    }
}
