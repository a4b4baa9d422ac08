//! micro-ROS agent run configuration
//!
//! [`AgentConfig`] is the validated set of launch parameters. Callers hand in a
//! loosely typed [`ConfigCandidate`]; converting it reports the first offending
//! field as a [`ValidationError`] instead of failing deserialization.
//!
//! The agent command line is built as an explicit argument vector from the
//! validated fields, so nothing a caller supplies ever reaches a shell.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Default UDP port of the micro-ROS agent on BlueOS
pub const DEFAULT_PORT: u16 = 2019;

/// Default agent verbosity
pub const DEFAULT_VERBOSITY: u8 = 4;

/// Highest verbosity accepted
pub const MAX_VERBOSITY: u8 = 4;

/// Upper bound on caller-supplied extra flags
pub const MAX_EXTRA_FLAGS: usize = 32;

// Options the extension derives from the configuration itself.
const MANAGED_FLAGS: &[&str] = &["-p", "--port", "-D", "--dev", "-b", "--baudrate", "--verbose"];

/// Transport the agent uses to reach the autopilot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp4,
    Udp6,
    Tcp4,
    Tcp6,
    Serial,
}

impl Transport {
    pub const ALL: [Transport; 5] = [
        Transport::Udp4,
        Transport::Udp6,
        Transport::Tcp4,
        Transport::Tcp6,
        Transport::Serial,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Udp4 => "udp4",
            Transport::Udp6 => "udp6",
            Transport::Tcp4 => "tcp4",
            Transport::Tcp6 => "tcp6",
            Transport::Serial => "serial",
        }
    }

    /// Network transports listen on a port; serial ones open a device
    pub fn uses_port(self) -> bool {
        !matches!(self, Transport::Serial)
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Transport::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| {
                let allowed: Vec<_> = Transport::ALL.iter().map(|t| t.as_str()).collect();
                ValidationError::new(
                    "transport",
                    format!("unknown transport {:?}, expected one of {}", s, allowed.join(", ")),
                )
            })
    }
}

/// Validated launch parameters for the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub transport: Transport,

    /// Listening port, required for network transports
    #[serde(default)]
    pub port: Option<u16>,

    /// Agent log verbosity (0-4)
    #[serde(alias = "verbose")]
    pub verbosity: u8,

    /// Serial device, required for the serial transport
    #[serde(default)]
    pub device: Option<String>,

    /// Serial baudrate; the agent default applies when unset
    #[serde(default)]
    pub baudrate: Option<u32>,

    /// Appended verbatim after the managed options
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Udp4,
            port: Some(DEFAULT_PORT),
            verbosity: DEFAULT_VERBOSITY,
            device: None,
            baudrate: None,
            extra_flags: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Check the configuration is launchable for its transport.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.transport.uses_port() {
            match self.port {
                None => {
                    return Err(ValidationError::new(
                        "port",
                        format!("required for the {} transport", self.transport),
                    ));
                }
                Some(0) => {
                    return Err(ValidationError::new("port", "must be between 1 and 65535"));
                }
                Some(_) => {}
            }
        } else {
            match self.device.as_deref() {
                None | Some("") => {
                    return Err(ValidationError::new(
                        "device",
                        format!("required for the {} transport", self.transport),
                    ));
                }
                Some(device) if !device.starts_with('/') || device.contains('\0') => {
                    return Err(ValidationError::new("device", "must be an absolute path"));
                }
                Some(_) => {}
            }
            if self.baudrate == Some(0) {
                return Err(ValidationError::new("baudrate", "must be positive"));
            }
        }

        if self.verbosity > MAX_VERBOSITY {
            return Err(ValidationError::new(
                "verbosity",
                format!("must be between 0 and {}", MAX_VERBOSITY),
            ));
        }

        validate_extra_flags(&self.extra_flags)
    }

    /// Agent argument vector, excluding the binary and any fixed prefix.
    ///
    /// Assumes the configuration has been validated.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args = vec![self.transport.as_str().to_string()];

        if self.transport.uses_port() {
            if let Some(port) = self.port {
                args.push("--port".to_string());
                args.push(port.to_string());
            }
        } else {
            if let Some(device) = &self.device {
                args.push("--dev".to_string());
                args.push(device.clone());
            }
            if let Some(baudrate) = self.baudrate {
                args.push("-b".to_string());
                args.push(baudrate.to_string());
            }
        }

        args.push(format!("-v{}", self.verbosity));
        args.extend(self.extra_flags.iter().cloned());
        args
    }
}

fn validate_extra_flags(flags: &[String]) -> Result<(), ValidationError> {
    if flags.len() > MAX_EXTRA_FLAGS {
        return Err(ValidationError::new(
            "extra_flags",
            format!("at most {} flags are allowed", MAX_EXTRA_FLAGS),
        ));
    }

    for flag in flags {
        if flag.is_empty() || flag.contains('\0') {
            return Err(ValidationError::new(
                "extra_flags",
                "flags must be non-empty and contain no NUL bytes",
            ));
        }
        let name = flag.split('=').next().unwrap_or(flag);
        let verbosity = name.starts_with("-v") && name[2..].chars().all(|c| c.is_ascii_digit());
        if MANAGED_FLAGS.contains(&name) || verbosity {
            return Err(ValidationError::new(
                "extra_flags",
                format!("{} is set from the transport, port and verbosity fields", name),
            ));
        }
    }

    Ok(())
}

/// Integer that may arrive as a JSON number or a numeric string
///
/// Fractional and out-of-range numbers are kept as `Float` so they fail
/// validation against their field instead of failing to deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LooseInt {
    Int(i64),
    Float(f64),
    Text(String),
}

impl LooseInt {
    fn parse(&self, field: &'static str) -> Result<i64, ValidationError> {
        match self {
            LooseInt::Int(v) => Ok(*v),
            LooseInt::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
                Ok(*v as i64)
            }
            LooseInt::Float(v) => Err(ValidationError::new(
                field,
                format!("expected an integer, found {}", v),
            )),
            LooseInt::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| ValidationError::new(field, format!("expected an integer, found {:?}", s))),
        }
    }
}

impl From<i64> for LooseInt {
    fn from(v: i64) -> Self {
        LooseInt::Int(v)
    }
}

/// Unvalidated configuration as supplied by a caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigCandidate {
    pub transport: String,
    #[serde(default)]
    pub port: Option<LooseInt>,
    #[serde(default, alias = "verbose")]
    pub verbosity: Option<LooseInt>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub baudrate: Option<LooseInt>,
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

impl TryFrom<ConfigCandidate> for AgentConfig {
    type Error = ValidationError;

    fn try_from(candidate: ConfigCandidate) -> Result<Self, Self::Error> {
        let transport: Transport = candidate.transport.parse()?;

        let port = candidate
            .port
            .map(|p| {
                let value = p.parse("port")?;
                u16::try_from(value)
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| ValidationError::new("port", "must be between 1 and 65535"))
            })
            .transpose()?;

        let verbosity = match candidate.verbosity {
            Some(v) => {
                let value = v.parse("verbosity")?;
                u8::try_from(value)
                    .ok()
                    .filter(|v| *v <= MAX_VERBOSITY)
                    .ok_or_else(|| {
                        ValidationError::new(
                            "verbosity",
                            format!("must be between 0 and {}", MAX_VERBOSITY),
                        )
                    })?
            }
            None => DEFAULT_VERBOSITY,
        };

        let baudrate = candidate
            .baudrate
            .map(|b| {
                let value = b.parse("baudrate")?;
                u32::try_from(value)
                    .ok()
                    .filter(|b| *b != 0)
                    .ok_or_else(|| ValidationError::new("baudrate", "must be positive"))
            })
            .transpose()?;

        let device = candidate.device.filter(|d| !d.trim().is_empty());

        let config = AgentConfig {
            transport,
            port: if transport.uses_port() { port } else { None },
            verbosity,
            device: if transport.uses_port() { None } else { device },
            baudrate: if transport.uses_port() { None } else { baudrate },
            extra_flags: candidate.extra_flags,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<&AgentConfig> for ConfigCandidate {
    fn from(config: &AgentConfig) -> Self {
        Self {
            transport: config.transport.to_string(),
            port: config.port.map(|p| LooseInt::Int(p.into())),
            verbosity: Some(LooseInt::Int(config.verbosity.into())),
            device: config.device.clone(),
            baudrate: config.baudrate.map(|b| LooseInt::Int(b.into())),
            extra_flags: config.extra_flags.clone(),
        }
    }
}
