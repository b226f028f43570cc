pub mod characteristic;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

pub use characteristic::{CharacteristicConfig, ControlWrite};

use crate::core::bluetooth::constants::{
    DATA_CHARACTERISTIC_NAME, DEFAULT_DEVICE_ALIASES, DEFAULT_NAME_PATTERN, IMU_CONFIG_COMMAND,
    MAG_CONFIG_COMMAND, MOTION_COLUMNS, UUID_CONTROL_CHAR, UUID_DATA_CHAR,
};
use crate::core::decoder::DecoderKind;
use crate::logging::Logger;
use crate::utils::ensure_directory_exists;

pub const CONFIG_FILE_NAME: &str = "streamlog_config.json";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("duplicate device alias \"{0}\"")]
    DuplicateAlias(String),
    #[error("duplicate characteristic name \"{0}\"")]
    DuplicateCharacteristicName(String),
    #[error("duplicate characteristic UUID \"{0}\"")]
    DuplicateCharacteristicUuid(Uuid),
    #[error("invalid device name pattern \"{pattern}\": {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("characteristic \"{name}\" declares {found} columns but its decoder emits {expected}")]
    ColumnMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),
    #[error("{0} must be a positive number of seconds")]
    InvalidDuration(&'static str),
}

/// Static session parameters. Loaded and validated once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    // ── Devices ──
    /// Optional nickname per address, used for status logging and file names.
    pub device_aliases: BTreeMap<String, String>,
    /// A device is admitted if its advertised name matches any of these.
    pub name_patterns: Vec<String>,
    pub characteristics: Vec<CharacteristicConfig>,
    pub control_writes: Vec<ControlWrite>,

    // ── Connection parameters ──
    pub max_active_connections: usize,
    /// Anything above one sometimes makes the radio unstable.
    pub max_simultaneous_connection_attempts: usize,
    pub connect_timeout_secs: f64,
    /// Extra allowance on top of a characteristic timeout for the first notification.
    pub initial_characteristic_timeout_secs: f64,
    /// Time between supervisor ticks.
    pub manager_interval_secs: f64,

    // ── Scanner parameters ──
    pub scan_duration_secs: f64,
    pub scan_timeout_secs: f64,
    pub scan_cooldown_secs: f64,
    /// A device stays "recently seen" this long after its last sighting.
    pub seen_timeout_secs: f64,

    // ── Consumers ──
    pub consumer_queue_capacity: usize,
    pub intake_queue_capacity: usize,
    /// Length of the per-device rolling buffer handed to the console.
    pub buffer_size: usize,
    pub output_csv: bool,
    pub output_folder: PathBuf,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            device_aliases: DEFAULT_DEVICE_ALIASES
                .iter()
                .map(|(adr, alias)| (adr.to_string(), alias.to_string()))
                .collect(),
            name_patterns: vec![DEFAULT_NAME_PATTERN.to_string()],
            characteristics: vec![CharacteristicConfig {
                name: DATA_CHARACTERISTIC_NAME.to_string(),
                uuid: UUID_DATA_CHAR,
                timeout_secs: None,
                decoder: DecoderKind::Motion,
                columns: MOTION_COLUMNS.iter().map(|c| c.to_string()).collect(),
            }],
            control_writes: vec![
                ControlWrite {
                    characteristic: UUID_CONTROL_CHAR,
                    data: IMU_CONFIG_COMMAND.to_vec(),
                },
                ControlWrite {
                    characteristic: UUID_CONTROL_CHAR,
                    data: MAG_CONFIG_COMMAND.to_vec(),
                },
            ],
            max_active_connections: 3,
            max_simultaneous_connection_attempts: 3,
            connect_timeout_secs: 15.0,
            initial_characteristic_timeout_secs: 10.0,
            manager_interval_secs: 0.1,
            scan_duration_secs: 5.0,
            scan_timeout_secs: 5.0,
            scan_cooldown_secs: 0.1,
            seen_timeout_secs: 5.0,
            consumer_queue_capacity: 1500,
            intake_queue_capacity: 10_000,
            buffer_size: 1500,
            output_csv: true,
            output_folder: PathBuf::from("output"),
        }
    }
}

/// Seconds must convert into a `Duration`: finite, non-negative and in range.
fn check_duration(field: &'static str, secs: f64, allow_zero: bool) -> Result<(), ConfigError> {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if allow_zero || !d.is_zero() => Ok(()),
        _ => Err(ConfigError::InvalidDuration(field)),
    }
}

/// Canonical form for Bluetooth addresses: no `0x`, trimmed, upper-case.
pub fn normalise_address(address: &str) -> String {
    address.replace("0x", "").trim().to_uppercase()
}

/// Compiles a name pattern so that it must match from the start of the name.
pub fn compile_name_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(&format!("^(?:{})", pattern)).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

impl Configuration {
    /// Loads the config from a JSON file, falling back to defaults when the file is absent.
    pub async fn load(path: &Path, log: &Logger) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            log.warn(format_args!(
                "Config file not found at {:?}, using default.",
                path
            ));
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {:?}", path))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("parsing {:?}", path))?;

        log.info(format_args!("Config loaded from {:?}", path));
        Ok(config)
    }

    /// Saves the config as pretty JSON, creating the parent directory if needed.
    pub async fn save(&self, path: &Path, log: &Logger) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            ensure_directory_exists(parent, log).await?;
        }
        let config_json = serde_json::to_string_pretty(self)?;
        fs::write(path, config_json).await?;
        log.info(format_args!("Config saved to {:?}.", path));
        Ok(())
    }

    /// Checks the configuration and converts addresses into canonical form.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.device_aliases = self
            .device_aliases
            .into_iter()
            .map(|(adr, alias)| (normalise_address(&adr), alias))
            .collect();

        // Aliases and characteristic names end up in file names.
        let mut seen_aliases = HashSet::new();
        for alias in self.device_aliases.values() {
            if !seen_aliases.insert(alias.as_str()) {
                return Err(ConfigError::DuplicateAlias(alias.clone()));
            }
        }

        let mut seen_names = HashSet::new();
        let mut seen_uuids = HashSet::new();
        for characteristic in &self.characteristics {
            if !seen_names.insert(characteristic.name.as_str()) {
                return Err(ConfigError::DuplicateCharacteristicName(characteristic.name.clone()));
            }
            if !seen_uuids.insert(characteristic.uuid) {
                return Err(ConfigError::DuplicateCharacteristicUuid(characteristic.uuid));
            }
            let expected = characteristic.decoder.column_count();
            if characteristic.columns.len() != expected {
                return Err(ConfigError::ColumnMismatch {
                    name: characteristic.name.clone(),
                    expected,
                    found: characteristic.columns.len(),
                });
            }
            if let Some(timeout) = characteristic.timeout_secs {
                check_duration("characteristic timeout", timeout, false)?;
            }
        }

        for pattern in &self.name_patterns {
            compile_name_pattern(pattern)?;
        }

        let limits = [
            ("max_active_connections", self.max_active_connections),
            (
                "max_simultaneous_connection_attempts",
                self.max_simultaneous_connection_attempts,
            ),
            ("consumer_queue_capacity", self.consumer_queue_capacity),
            ("intake_queue_capacity", self.intake_queue_capacity),
            ("buffer_size", self.buffer_size),
        ];
        for (field, value) in limits {
            if value == 0 {
                return Err(ConfigError::ZeroLimit(field));
            }
        }

        let durations = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("manager_interval_secs", self.manager_interval_secs),
            ("scan_duration_secs", self.scan_duration_secs),
            ("scan_timeout_secs", self.scan_timeout_secs),
            ("seen_timeout_secs", self.seen_timeout_secs),
        ];
        for (field, value) in durations {
            check_duration(field, value, false)?;
        }
        check_duration(
            "initial_characteristic_timeout_secs",
            self.initial_characteristic_timeout_secs,
            true,
        )?;
        check_duration("scan_cooldown_secs", self.scan_cooldown_secs, true)?;

        Ok(self)
    }

    pub fn alias(&self, address: &str) -> Option<&str> {
        self.device_aliases.get(address).map(String::as_str)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }

    pub fn initial_characteristic_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.initial_characteristic_timeout_secs)
    }

    pub fn manager_interval(&self) -> Duration {
        Duration::from_secs_f64(self.manager_interval_secs)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs_f64(self.scan_duration_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.scan_timeout_secs)
    }

    pub fn scan_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.scan_cooldown_secs)
    }

    pub fn seen_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.seen_timeout_secs)
    }
}
