//! Instance configuration.
//!
//! Loaded once from JSON, validated, and resolved into typed
//! [`Acquisition`]s before any line is touched. Field names follow the
//! existing `hdc_config.json` files.

use crate::channels::{command_level, Acquisition, ChannelKind, DebounceThresholds};
use crate::diagnostics::DiagnosticCheck;
use crate::line_io::Level;
use serde::Deserialize;
use serde_json::Value;
use static_assertions::const_assert;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_CONFIG_FILE: &str = "hdc_config.json";
pub const DEFAULT_GPIO_PATH: &str = "/sys/class/gpio";
pub const DEFAULT_TOKEN_PREFIX: &str = "magls_";

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_TIMEOUT_S: u64 = 60;
const DEFAULT_TEMP_MAX_RESTART: u32 = 3;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_CHECKUP_INTERVAL_S: u64 = 300;
const DEFAULT_DEADMAN_S: u64 = 420;
const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_RECONNECT_BACKOFF_S: u64 = 30;
const DEFAULT_CMD_MAX_AGE_S: u64 = 7200;
const DEFAULT_DIAGNOSTIC_TIMEOUT_S: u64 = 30;

/// Upper bound on long checks run by one checkup.
pub const MAX_LONG_CHECKS_PER_CALL: usize = 16;

// The deadman must never fire ahead of a healthy periodic checkup.
const_assert!(DEFAULT_DEADMAN_S > DEFAULT_CHECKUP_INTERVAL_S);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("\"{kind}\" is not a valid acquisition type (channel '{name}')")]
    UnknownType { name: String, kind: String },
    #[error("invalid object for {kind} channel '{name}': {reason}")]
    BadObject {
        name: String,
        kind: &'static str,
        reason: String,
    },
    #[error("temperature sensor fault channel already allocated ('{0}')")]
    DuplicateTempFault(String),
    #[error("temperature sensor enable channel already allocated ('{0}')")]
    DuplicateTempEnable(String),
    #[error("channel name '{0}' used more than once")]
    DuplicateName(String),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Raw acquisition descriptor as written in the file.
#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    pub name: String,
    #[serde(rename = "type", alias = "acType")]
    pub kind: String,
    #[serde(rename = "object", alias = "acObject")]
    pub object: Value,
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}
fn default_mqtt_timeout() -> u64 {
    DEFAULT_MQTT_TIMEOUT_S
}
fn default_temp_max_restart() -> u32 {
    DEFAULT_TEMP_MAX_RESTART
}
fn default_gpio_path() -> String {
    DEFAULT_GPIO_PATH.to_string()
}
fn default_token_prefix() -> String {
    DEFAULT_TOKEN_PREFIX.to_string()
}
fn default_one() -> u32 {
    1
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_checkup_interval() -> u64 {
    DEFAULT_CHECKUP_INTERVAL_S
}
fn default_deadman() -> u64 {
    DEFAULT_DEADMAN_S
}
fn default_connect_attempts() -> u32 {
    DEFAULT_CONNECT_ATTEMPTS
}
fn default_reconnect_backoff() -> u64 {
    DEFAULT_RECONNECT_BACKOFF_S
}
fn default_cmd_max_age() -> u64 {
    DEFAULT_CMD_MAX_AGE_S
}
fn default_diagnostic_timeout() -> u64 {
    DEFAULT_DIAGNOSTIC_TIMEOUT_S
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub boot_check_list: serde_json::Map<String, Value>,
    pub acq_io: Vec<AcquisitionConfig>,
    #[serde(default = "default_one")]
    pub long_checkup_freq: u32,
    #[serde(default)]
    pub long_checkup_leng: usize,
    #[serde(default = "default_gpio_path")]
    pub gpio_path: String,
    pub mqtt_broker: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default = "default_mqtt_timeout")]
    pub mqtt_timeout: u64,
    #[serde(default = "default_temp_max_restart")]
    pub temp_max_restart: u32,
    #[serde(default)]
    pub tokens: Option<Vec<String>>,
    #[serde(default = "default_token_prefix")]
    pub token_prefix: String,
    #[serde(default)]
    pub loglevel: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_checkup_interval")]
    pub checkup_interval_secs: u64,
    #[serde(default = "default_deadman")]
    pub deadman_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: u64,
    #[serde(default = "default_cmd_max_age")]
    pub cmd_max_age_secs: u64,
    #[serde(default)]
    pub switch_debounce: Option<u32>,
    #[serde(default)]
    pub motion_debounce: Option<u32>,
    #[serde(default)]
    pub fault_debounce: Option<u32>,
    #[serde(default = "default_diagnostic_timeout")]
    pub diagnostic_timeout_secs: u64,
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Scalar checks plus full acquisition resolution.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "name",
                reason: "must not be empty".into(),
            });
        }
        if self.long_checkup_freq == 0 {
            return Err(ConfigError::Invalid {
                field: "long_checkup_freq",
                reason: "must be at least 1".into(),
            });
        }
        if self.long_checkup_leng > MAX_LONG_CHECKS_PER_CALL {
            return Err(ConfigError::Invalid {
                field: "long_checkup_leng",
                reason: format!("at most {} checks per checkup", MAX_LONG_CHECKS_PER_CALL),
            });
        }
        for (field, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("checkup_interval_secs", self.checkup_interval_secs),
            ("deadman_secs", self.deadman_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "connect_attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.deadman_secs <= self.checkup_interval_secs {
            warn!(
                "Deadman window ({}s) is not longer than the checkup interval ({}s)",
                self.deadman_secs, self.checkup_interval_secs
            );
        }
        self.boot_checks()?;
        self.resolve_acquisitions()?;
        Ok(())
    }

    /// Turn the raw descriptors into typed acquisitions.
    pub fn resolve_acquisitions(&self) -> Result<Vec<Acquisition>, ConfigError> {
        let mut names = HashSet::new();
        let mut fault: Option<&str> = None;
        let mut enable: Option<&str> = None;
        let mut resolved = Vec::with_capacity(self.acq_io.len());

        for raw in &self.acq_io {
            let kind = ChannelKind::from_code(&raw.kind).ok_or_else(|| ConfigError::UnknownType {
                name: raw.name.clone(),
                kind: raw.kind.clone(),
            })?;

            if !names.insert(raw.name.as_str()) {
                return Err(ConfigError::DuplicateName(raw.name.clone()));
            }

            match kind {
                ChannelKind::TempFault => {
                    if let Some(existing) = fault {
                        return Err(ConfigError::DuplicateTempFault(existing.to_string()));
                    }
                    fault = Some(raw.name.as_str());
                }
                ChannelKind::TempEnable => {
                    if let Some(existing) = enable {
                        return Err(ConfigError::DuplicateTempEnable(existing.to_string()));
                    }
                    enable = Some(raw.name.as_str());
                }
                _ => {}
            }

            resolved.push(resolve_one(raw, kind)?);
        }

        Ok(resolved)
    }

    pub fn boot_checks(&self) -> Result<Vec<DiagnosticCheck>, ConfigError> {
        self.boot_check_list
            .iter()
            .map(|(name, command)| {
                let command = match command {
                    Value::String(text) => text.clone(),
                    Value::Array(words) => words
                        .iter()
                        .map(|w| w.as_str().map(str::to_string))
                        .collect::<Option<Vec<_>>>()
                        .map(|w| w.join(" "))
                        .ok_or_else(|| ConfigError::Invalid {
                            field: "boot_check_list",
                            reason: format!("'{}' must be a string or a list of strings", name),
                        })?,
                    _ => {
                        return Err(ConfigError::Invalid {
                            field: "boot_check_list",
                            reason: format!("'{}' must be a string or a list of strings", name),
                        })
                    }
                };
                Ok(DiagnosticCheck {
                    name: name.clone(),
                    command,
                })
            })
            .collect()
    }

    pub fn thresholds(&self) -> DebounceThresholds {
        let defaults = DebounceThresholds::default();
        DebounceThresholds {
            switch: self.switch_debounce.unwrap_or(defaults.switch),
            motion: self.motion_debounce.unwrap_or(defaults.motion),
            fault: self.fault_debounce.unwrap_or(defaults.fault),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Poll ticks between periodic checkups, at least one.
    pub fn ticks_per_checkup(&self) -> u32 {
        let ticks = (self.checkup_interval_secs * 1000) / self.poll_interval_ms.max(1);
        u32::try_from(ticks).unwrap_or(u32::MAX).max(1)
    }

    pub fn deadman_window(&self) -> Duration {
        Duration::from_secs(self.deadman_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    pub fn mqtt_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt_timeout)
    }

    pub fn cmd_max_age(&self) -> Duration {
        Duration::from_secs(self.cmd_max_age_secs)
    }

    pub fn diagnostic_timeout(&self) -> Duration {
        Duration::from_secs(self.diagnostic_timeout_secs)
    }
}

fn resolve_one(raw: &AcquisitionConfig, kind: ChannelKind) -> Result<Acquisition, ConfigError> {
    let name = raw.name.clone();
    let bad = |reason: &str| ConfigError::BadObject {
        name: raw.name.clone(),
        kind: kind.code(),
        reason: reason.to_string(),
    };
    let pin = |value: &Value| -> Result<u32, ConfigError> {
        value
            .as_u64()
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| bad("expected a line number"))
    };

    let acquisition = match kind {
        ChannelKind::Switch => Acquisition::Switch { name, pin: pin(&raw.object)? },
        ChannelKind::SwitchInverted => Acquisition::SwitchInverted { name, pin: pin(&raw.object)? },
        ChannelKind::Motion => Acquisition::Motion { name, pin: pin(&raw.object)? },
        ChannelKind::TempFault => Acquisition::TempFault { name, pin: pin(&raw.object)? },
        ChannelKind::TempEnable => Acquisition::TempEnable { name, pin: pin(&raw.object)? },
        ChannelKind::TempSensor => {
            let path = match &raw.object {
                Value::String(path) => path.clone(),
                Value::Array(items) => items
                    .first()
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| bad("expected a probe path"))?,
                _ => return Err(bad("expected a probe path")),
            };
            Acquisition::TempSensor { name, path: PathBuf::from(path) }
        }
        ChannelKind::Output => match &raw.object {
            Value::Array(items) => {
                let line = items.first().ok_or_else(|| bad("expected [line, initial]"))?;
                let initial = items.get(1).map_or(Level::Inactive, command_level);
                Acquisition::Output { name, pin: pin(line)?, initial }
            }
            value => Acquisition::Output { name, pin: pin(value)?, initial: Level::Inactive },
        },
    };
    Ok(acquisition)
}
