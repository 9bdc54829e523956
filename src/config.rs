//! Configuration management
//!
//! Settings live in `~/.scanfill/config.json` by default. Every section is
//! `#[serde(default)]` so partial files load, and a schema `version` drives
//! sequential migrations when an older file is read.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::capture::CaptureMode;
use crate::rules::MatchMode;

/// Current config schema version
pub const CURRENT_VERSION: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unknown config version: {0}")]
    UnknownVersion(u32),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Schema version for migrations
    pub version: u32,
    pub capture: CaptureConfig,
    pub queue: QueueConfig,
    pub coordinator: CoordinatorConfig,
    pub engine: EngineConfig,
    pub macros: MacroConfig,
    pub storage: StorageConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            capture: CaptureConfig::default(),
            queue: QueueConfig::default(),
            coordinator: CoordinatorConfig::default(),
            engine: EngineConfig::default(),
            macros: MacroConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Keystroke capture settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Longest gap between scanner keystrokes before the buffer is dropped
    pub idle_timeout_ms: u64,
    /// Shortest buffer that Enter turns into a scan
    pub min_scan_length: usize,
    /// Whether switching to `off` drops pending scans
    pub clear_queue_on_off: bool,
    /// Whether manual scans are accepted while the scanner is off
    pub allow_manual_in_off: bool,
    /// Mode used when nothing was persisted
    pub initial_mode: CaptureMode,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 50,
            min_scan_length: 3,
            clear_queue_on_off: true,
            allow_manual_in_off: false,
            initial_mode: CaptureMode::Standby,
        }
    }
}

/// Queue processor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pause between consecutive scans
    pub throttle_ms: u64,
    /// Scan history entries kept
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 100,
            history_limit: crate::history::DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Cross-tab coordination settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub heartbeat_ms: u64,
    /// A leader record older than this is considered abandoned
    pub leader_timeout_ms: u64,
    /// Use the native channel over the storage relay when both exist
    pub prefer_channel: bool,
    /// Prefix of every shared-store key
    pub namespace: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 5_000,
            leader_timeout_ms: 10_000,
            prefer_channel: true,
            namespace: "scanfill".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub match_mode: MatchMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroConfig {
    /// Pause between field steps
    pub step_delay_ms: u64,
}

impl Default for MacroConfig {
    fn default() -> Self {
        Self { step_delay_ms: 50 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file (None for `~/.scanfill/scanfill.db`)
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(crate::storage::sqlite::default_database_path)
    }
}

impl Config {
    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capture.min_scan_length == 0 {
            return Err(ConfigError::Invalid(
                "capture.min_scan_length must be at least 1".to_string(),
            ));
        }
        if self.coordinator.heartbeat_ms == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.heartbeat_ms must be at least 1".to_string(),
            ));
        }
        if self.coordinator.leader_timeout_ms <= self.coordinator.heartbeat_ms {
            return Err(ConfigError::Invalid(format!(
                "coordinator.leader_timeout_ms ({}) must exceed heartbeat_ms ({})",
                self.coordinator.leader_timeout_ms, self.coordinator.heartbeat_ms
            )));
        }
        if self.queue.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "queue.history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Directory holding config, database and logs (~/.scanfill)
pub fn data_dir() -> PathBuf {
    home_dir_or_fallback().join(".scanfill")
}

/// Default config file path (~/.scanfill/config.json)
pub fn default_config_path() -> PathBuf {
    data_dir().join("config.json")
}

/// Get the home directory, falling back to /tmp if unavailable
fn home_dir_or_fallback() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        tracing::error!("Could not determine home directory, using /tmp");
        PathBuf::from("/tmp")
    })
}

/// Load configuration, falling back to defaults when the file is missing.
/// Older files are migrated and written back.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::info!("Config file {} not found, using defaults", path.display());
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&contents)?;
    let original_version = config.version;
    let migrated = migrate_config(config)?;

    if migrated.version != original_version {
        tracing::info!(
            "Migrated config from version {} to {}",
            original_version,
            migrated.version
        );
        save_config(path, &migrated)?;
    }

    Ok(migrated)
}

/// Write configuration as pretty JSON, creating the parent directory
pub fn save_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }
    let contents = serde_json::to_string_pretty(config)?;
    fs::write(path, contents)?;
    tracing::info!("Config saved to {}", path.display());
    Ok(())
}

/// Migrate configuration from older schema versions
fn migrate_config(mut config: Config) -> Result<Config, ConfigError> {
    while config.version < CURRENT_VERSION {
        config = apply_migration(config)?;
    }
    if config.version > CURRENT_VERSION {
        return Err(ConfigError::UnknownVersion(config.version));
    }
    Ok(config)
}

/// Apply a single migration step
fn apply_migration(config: Config) -> Result<Config, ConfigError> {
    match config.version {
        // Version 0 -> 1: initial schema
        0 => Ok(Config {
            version: 1,
            ..config
        }),
        // Version 1 -> 2: leader timeout must cover two missed heartbeats
        1 => {
            let mut migrated = config;
            let minimum = migrated.coordinator.heartbeat_ms.saturating_mul(2);
            if migrated.coordinator.leader_timeout_ms < minimum {
                tracing::warn!(
                    "Raising leader_timeout_ms from {} to {}",
                    migrated.coordinator.leader_timeout_ms,
                    minimum
                );
                migrated.coordinator.leader_timeout_ms = minimum;
            }
            migrated.version = 2;
            Ok(migrated)
        }
        v => Err(ConfigError::UnknownVersion(v)),
    }
}
