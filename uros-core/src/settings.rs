//! Persistent agent settings
//!
//! Settings live in a single JSON document under the extension's persistent
//! storage directory:
//!
//! ```json
//! { "micro_ros_agent": { "enabled": false, "transport": "udp4", "port": 2019, "verbosity": 4 } }
//! ```
//!
//! A missing document means defaults. Writes go to a temporary file in the same
//! directory which is then renamed over the document, and the in-memory copy is
//! only replaced once that rename succeeded.

use crate::agent::{AgentConfig, ConfigCandidate, LooseInt};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Default location of the settings document inside the extension container
pub const DEFAULT_SETTINGS_PATH: &str = "/app/settings/micro-ros-agent-settings.json";

/// Everything persisted for the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Start the agent automatically when the extension starts
    pub enabled: bool,

    #[serde(flatten)]
    pub config: AgentConfig,
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    micro_ros_agent: &'a AgentSettings,
}

#[derive(Deserialize)]
struct StoredDocument {
    #[serde(default)]
    micro_ros_agent: StoredAgent,
}

// Every field is optional so partially written or older documents still load.
#[derive(Debug, Default, Deserialize)]
struct StoredAgent {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    transport: Option<String>,
    #[serde(default)]
    port: Option<LooseInt>,
    #[serde(default, alias = "verbose")]
    verbosity: Option<LooseInt>,
    #[serde(default)]
    device: Option<String>,
    #[serde(default)]
    baudrate: Option<LooseInt>,
    #[serde(default)]
    extra_flags: Option<Vec<String>>,
}

impl StoredAgent {
    fn into_settings(self) -> Result<AgentSettings> {
        let defaults = ConfigCandidate::from(&AgentConfig::default());
        let candidate = ConfigCandidate {
            transport: self.transport.unwrap_or(defaults.transport),
            port: self.port.or(defaults.port),
            verbosity: self.verbosity.or(defaults.verbosity),
            device: self.device,
            baudrate: self.baudrate,
            extra_flags: self.extra_flags.unwrap_or_default(),
        };

        Ok(AgentSettings {
            enabled: self.enabled.unwrap_or(false),
            config: AgentConfig::try_from(candidate)?,
        })
    }
}

/// Validating, durable store for [`AgentSettings`]
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: Mutex<AgentSettings>,
    // Serializes writers; `current` is only locked to read or swap the value
    writer: Mutex<()>,
}

impl SettingsStore {
    /// Open the store at `path`, loading whatever is persisted there.
    ///
    /// Never fails: unreadable or invalid documents fall back to defaults and
    /// are left on disk untouched until the next successful write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = load(&path);
        Self {
            path,
            current: Mutex::new(current),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current run configuration
    pub fn get(&self) -> AgentConfig {
        self.lock().config.clone()
    }

    /// Current configuration plus the auto-start flag
    pub fn settings(&self) -> AgentSettings {
        self.lock().clone()
    }

    /// Persisted auto-start flag
    pub fn enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Validate and persist a new run configuration.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] if the candidate is invalid and [`Error::Persistence`]
    /// if it could not be written; in both cases nothing changes.
    pub fn set(&self, candidate: AgentConfig) -> Result<AgentConfig> {
        candidate.validate()?;

        let _writer = self.lock_writer();
        let next = AgentSettings {
            enabled: self.enabled(),
            config: candidate,
        };
        self.persist(&next)?;
        *self.lock() = next.clone();

        info!(
            "Saved micro-ROS agent settings: transport={}, port={:?}, verbosity={}",
            next.config.transport, next.config.port, next.config.verbosity
        );
        Ok(next.config)
    }

    /// Convert, validate and persist loosely typed input.
    pub fn set_candidate(&self, candidate: ConfigCandidate) -> Result<AgentConfig> {
        let config = AgentConfig::try_from(candidate)?;
        self.set(config)
    }

    /// Persist the auto-start flag.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        let _writer = self.lock_writer();
        let next = AgentSettings {
            enabled,
            config: self.get(),
        };
        self.persist(&next)?;
        *self.lock() = next;

        info!("micro-ROS agent enabled state: {}", enabled);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, AgentSettings> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, settings: &AgentSettings) -> Result<()> {
        write_atomically(&self.path, settings)
            .map_err(|e| Error::Persistence(format!("{}: {}", self.path.display(), e)))
    }
}

fn load(path: &Path) -> AgentSettings {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("Settings file not found at {}, using defaults", path.display());
            return AgentSettings::default();
        }
        Err(e) => {
            warn!("Error reading settings from {}, using defaults: {}", path.display(), e);
            return AgentSettings::default();
        }
    };

    let stored: StoredDocument = match serde_json::from_str(&contents) {
        Ok(stored) => stored,
        Err(e) => {
            warn!("Error parsing settings in {}, using defaults: {}", path.display(), e);
            return AgentSettings::default();
        }
    };

    match stored.micro_ros_agent.into_settings() {
        Ok(settings) => {
            debug!("Loaded settings from {}: {:?}", path.display(), settings);
            settings
        }
        Err(e) => {
            warn!("Invalid settings in {}, using defaults: {}", path.display(), e);
            AgentSettings::default()
        }
    }
}

fn write_atomically(path: &Path, settings: &AgentSettings) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(
        &mut tmp,
        &DocumentRef {
            micro_ros_agent: settings,
        },
    )?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Transport;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults_without_writing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");

        let store = SettingsStore::open(&path);
        assert_eq!(store.get(), AgentConfig::default());
        assert!(!store.enabled());
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_file_yields_defaults_and_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = SettingsStore::open(&path);
        assert_eq!(store.get(), AgentConfig::default());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_invalid_stored_values_yield_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"micro_ros_agent": {"transport": "udp4", "port": 99999, "verbosity": 4}}"#,
        )
        .unwrap();

        let store = SettingsStore::open(&path);
        assert_eq!(store.get(), AgentConfig::default());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"micro_ros_agent": {"enabled": true, "port": 8888}}"#).unwrap();

        let store = SettingsStore::open(&path);
        let config = store.get();
        assert!(store.enabled());
        assert_eq!(config.transport, Transport::Udp4);
        assert_eq!(config.port, Some(8888));
        assert_eq!(config.verbosity, 4);
    }

    #[test]
    fn test_set_writes_document_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::open(&path);

        store
            .set(AgentConfig {
                transport: Transport::Udp6,
                port: Some(8888),
                verbosity: 2,
                ..Default::default()
            })
            .unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let agent = &written["micro_ros_agent"];
        assert_eq!(agent["transport"], "udp6");
        assert_eq!(agent["port"], 8888);
        assert_eq!(agent["verbosity"], 2);
        assert_eq!(agent["enabled"], false);
    }

    #[test]
    fn test_set_enabled_keeps_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path);
        let config = AgentConfig {
            port: Some(7400),
            ..Default::default()
        };
        store.set(config.clone()).unwrap();

        store.set_enabled(true).unwrap();
        assert!(store.enabled());
        assert_eq!(store.get(), config);
    }

    #[test]
    fn test_reads_do_not_wait_for_writer() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json"));

        // Stand-in for a write stuck in fsync
        let _writer = store.lock_writer();
        assert_eq!(store.get(), AgentConfig::default());
        assert!(!store.enabled());
    }
}
