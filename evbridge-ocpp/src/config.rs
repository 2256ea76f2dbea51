//! Configuration for the charge point bridge
//!
//! Read once at startup from a JSON file; every section and field falls back
//! to a default when absent. Command-line overrides are applied with the
//! `with_*` builders.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ocpp::OcppServerConfig;
use crate::persistence::DEFAULT_PERSIST_PATH;
use crate::schedule::MAX_CURRENT_CHARGER;
use crate::session::SessionSettings;

/// Default configuration file name
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Errors loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub ocpp: OcppConfig,
    pub mqtt: MqttConfig,
    pub ev: EvConfig,
    /// Gate for every command that changes charge point state
    pub allow_writeback: bool,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

/// OCPP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcppConfig {
    pub host: String,
    pub port: u16,
    /// Identity assigned to the connected charge point
    pub charge_point_id: String,
    /// Outbound call timeout in seconds
    pub request_timeout_secs: u64,
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

/// Vehicle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvConfig {
    /// Lowest current the vehicle can regulate to, in amps
    pub min_current: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub path: PathBuf,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter for the log file
    pub level: String,
    /// Log file; console only when unset
    pub file: Option<PathBuf>,
    /// Filter for console output
    pub to_console_level: String,
}

impl Default for OcppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            charge_point_id: "CP_1".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: "evbridge".to_string(),
            keep_alive_secs: 60,
        }
    }
}

impl Default for EvConfig {
    fn default() -> Self {
        Self { min_current: 6 }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_PERSIST_PATH),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            to_console_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ocpp.charge_point_id.trim().is_empty() {
            return Err(ConfigError::Invalid("ocpp.charge_point_id is empty".into()));
        }
        if !(0..=MAX_CURRENT_CHARGER).contains(&self.ev.min_current) {
            return Err(ConfigError::Invalid(format!(
                "ev.min_current {} outside 0..={}",
                self.ev.min_current, MAX_CURRENT_CHARGER
            )));
        }
        if self.ocpp.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("ocpp.request_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// Snapshot handed to each new session
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            min_current_ev: self.ev.min_current,
            ..SessionSettings::default()
        }
    }

    pub fn server_config(&self) -> OcppServerConfig {
        OcppServerConfig {
            host: self.ocpp.host.clone(),
            port: self.ocpp.port,
            charge_point_id: self.ocpp.charge_point_id.clone(),
            request_timeout: Duration::from_secs(self.ocpp.request_timeout_secs),
            session: self.session_settings(),
            persist_path: self.persistence.path.clone(),
        }
    }

    /// Set listener host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.ocpp.host = host.into();
        self
    }

    /// Set listener port
    pub fn with_port(mut self, port: u16) -> Self {
        self.ocpp.port = port;
        self
    }

    /// Set charge point identity
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.ocpp.charge_point_id = identity.into();
        self
    }

    /// Set both log filters
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        let level = level.into();
        self.logging.to_console_level = level.clone();
        self.logging.level = level;
        self
    }
}
