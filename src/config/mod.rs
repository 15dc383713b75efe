//! Configuration for the device-access core
//!
//! Every setting has a default, so a missing or partial file is fine.
//!
//! # Location
//!
//! The configuration file is looked up in this order:
//! 1. The path in the `CAMBACKEND_CONFIG` environment variable
//! 2. The platform config directory:
//!    - **Linux**: `~/.config/cambackend/config.json`
//!    - **macOS**: `~/Library/Application Support/cambackend/config.json`
//!    - **Windows**: `%APPDATA%\cambackend\config.json`
//!
//! Files ending in `.toml` are parsed as TOML, everything else as JSON.
//!
//! # Example
//!
//! ```ignore
//! use cambackend::config::CoreConfig;
//!
//! let config = CoreConfig::load_or_default();
//! println!("Polling sysfs at {}", config.standard.sysfs_root.display());
//! ```

use crate::classifier::FamilyTable;
use crate::error::{BackendError, Result};
use crate::session::RecordingMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for the config directory
pub const APP_ID: &str = "cambackend";

/// Config filename
pub const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the config path
pub const CONFIG_ENV_VAR: &str = "CAMBACKEND_CONFIG";

/// Default hot-plug polling interval in milliseconds
pub const DEFAULT_HOTPLUG_POLL_MS: u64 = 500;

/// Playback speed bounds
pub const MIN_PLAYBACK_SPEED: f64 = 0.1;
pub const MAX_PLAYBACK_SPEED: f64 = 10.0;

// ==================== Config Location ====================

/// Path of the configuration file, honouring the environment override
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

fn is_toml(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

// ==================== Sections ====================

/// Settings for the standard backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandardConfig {
    /// Root of the sysfs tree to enumerate
    pub sysfs_root: PathBuf,
    /// Root under which device nodes are opened
    pub dev_root: PathBuf,
    /// How often hot-plug polling re-enumerates
    pub hotplug_poll_interval_ms: u64,
}

impl Default for StandardConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev"),
            hotplug_poll_interval_ms: DEFAULT_HOTPLUG_POLL_MS,
        }
    }
}

/// Settings for the recording backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// How frame and report payloads are stored
    pub mode: RecordingMode,
    /// Flush the log after every entry
    pub flush_each_entry: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            mode: RecordingMode::default(),
            flush_each_entry: true,
        }
    }
}

/// Settings for the playback backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Replay clock multiplier (1.0 = recorded pace)
    pub speed: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { speed: 1.0 }
    }
}

impl PlaybackConfig {
    /// Speed clamped to the supported range
    pub fn effective_speed(&self) -> f64 {
        if self.speed.is_finite() {
            self.speed.clamp(MIN_PLAYBACK_SPEED, MAX_PLAYBACK_SPEED)
        } else {
            1.0
        }
    }
}

// ==================== Core Config ====================

/// Complete configuration of the core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub standard: StandardConfig,
    pub recording: RecordingConfig,
    pub playback: PlaybackConfig,
    /// Device family signatures used by the classifier
    pub families: FamilyTable,
}

impl CoreConfig {
    /// Load from the default location; a missing file yields defaults
    pub fn load() -> Result<Self> {
        let path = config_path().ok_or_else(|| {
            BackendError::Config("Could not determine config path".to_string())
        })?;

        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load from an explicit path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackendError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        if is_toml(path) {
            toml::from_str(&content).map_err(|e| {
                BackendError::Config(format!("Failed to parse config {:?}: {}", path, e))
            })
        } else {
            serde_json::from_str(&content).map_err(|e| {
                BackendError::Config(format!("Failed to parse config {:?}: {}", path, e))
            })
        }
    }

    /// Load config, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save to `path`, choosing the format by extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackendError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| BackendError::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| BackendError::Config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            BackendError::Config(format!("Failed to write config {:?}: {}", path, e))
        })
    }
}
