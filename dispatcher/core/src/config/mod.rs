//! TOML Configuration File Support
//!
//! Process-level settings for the dispatcher, loaded from a TOML file at
//! `~/.config/model-dispatcher/dispatcher.toml`.
//!
//! This file configures *how* the dispatcher runs. The backends and routing
//! rules themselves live in the store document (see
//! [`crate::routing::FileConfigStore`]), whose path is set here.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (when applicable)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/model-dispatcher/dispatcher.toml` (settings)
//! - `$XDG_CONFIG_HOME/model-dispatcher/backends.toml` (default store)
//!
//! # Example Configuration
//!
//! ```toml
//! [store]
//! path = "/etc/model-dispatcher/backends.toml"
//!
//! [dispatch]
//! lane_mode = "per_backend"
//! execution_timeout_ms = 30000
//!
//! [ledger]
//! history_capacity = 5000
//! summary_chars = 120
//!
//! [selection]
//! cost_tier_mode = "strict"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::{CostTierMode, LaneMode};

/// Directory name under the XDG config dir
const APP_DIR: &str = "model-dispatcher";

/// Default bound on retained history records
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Default length of input/output summaries in history
pub const DEFAULT_SUMMARY_CHARS: usize = 200;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Store section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreToml {
    /// Path of the backend/routing-rules document
    pub path: Option<PathBuf>,
}

/// Dispatch section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    /// `single` or `per_backend`
    pub lane_mode: Option<LaneMode>,

    /// Per-request execution timeout in milliseconds (0 = no timeout)
    pub execution_timeout_ms: Option<u64>,
}

/// Ledger section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerToml {
    /// Maximum retained history records
    pub history_capacity: Option<usize>,

    /// Maximum characters kept in input/output summaries
    pub summary_chars: Option<usize>,
}

/// Selection section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionToml {
    /// `advisory` or `strict`
    pub cost_tier_mode: Option<CostTierMode>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherToml {
    /// Store configuration section
    pub store: StoreToml,

    /// Dispatch configuration section
    pub dispatch: DispatchToml,

    /// Ledger configuration section
    pub ledger: LedgerToml,

    /// Selection configuration section
    pub selection: SelectionToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the dispatcher
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct DispatcherConfigFile {
    /// Path of the store document
    pub store_path: PathBuf,

    /// How queued requests are spread across lanes
    pub lane_mode: LaneMode,

    /// Per-request execution timeout
    pub execution_timeout: Option<Duration>,

    /// Maximum retained history records
    pub history_capacity: usize,

    /// Maximum characters kept in history summaries
    pub summary_chars: usize,

    /// Cost tier filtering mode
    pub cost_tier_mode: CostTierMode,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for DispatcherConfigFile {
    fn default() -> Self {
        Self {
            store_path: default_store_path()
                .unwrap_or_else(|| PathBuf::from("backends.toml")),
            lane_mode: LaneMode::default(),
            execution_timeout: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            summary_chars: DEFAULT_SUMMARY_CHARS,
            cost_tier_mode: CostTierMode::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl DispatcherConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values are usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a zero history capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "history_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/model-dispatcher/dispatcher.toml` or
/// `~/.config/model-dispatcher/dispatcher.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR).join("dispatcher.toml"))
}

/// Get the default store document path
#[must_use]
pub fn default_store_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR).join("backends.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the resulting values are invalid. A missing config file is not an error.
pub fn load_config() -> Result<DispatcherConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<DispatcherConfigFile, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with a custom environment lookup
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env<F>(
    path: Option<PathBuf>,
    env: F,
) -> Result<DispatcherConfigFile, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = DispatcherConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: DispatcherToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Environment overrides file values
    apply_env_config(&mut config, env);

    config.validate()?;
    Ok(config)
}

fn timeout_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut DispatcherConfigFile, toml: &DispatcherToml) {
    if let Some(ref path) = toml.store.path {
        config.store_path = path.clone();
    }

    if let Some(mode) = toml.dispatch.lane_mode {
        config.lane_mode = mode;
    }
    if let Some(ms) = toml.dispatch.execution_timeout_ms {
        config.execution_timeout = timeout_from_ms(ms);
    }

    if let Some(capacity) = toml.ledger.history_capacity {
        config.history_capacity = capacity;
    }
    if let Some(chars) = toml.ledger.summary_chars {
        config.summary_chars = chars;
    }

    if let Some(mode) = toml.selection.cost_tier_mode {
        config.cost_tier_mode = mode;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut DispatcherConfigFile, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = env("DISPATCHER_STORE_PATH") {
        config.store_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    if let Some(mode) = env("DISPATCHER_LANE_MODE") {
        match mode.parse::<LaneMode>() {
            Ok(mode) => {
                config.lane_mode = mode;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring DISPATCHER_LANE_MODE"),
        }
    }
    if let Some(timeout) = env("DISPATCHER_EXECUTION_TIMEOUT_MS") {
        match timeout.parse::<u64>() {
            Ok(ms) => {
                config.execution_timeout = timeout_from_ms(ms);
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(
                error = %e,
                value = %timeout,
                "Ignoring DISPATCHER_EXECUTION_TIMEOUT_MS"
            ),
        }
    }
    if let Some(capacity) = env("DISPATCHER_HISTORY_CAPACITY") {
        match capacity.parse::<usize>() {
            Ok(n) => {
                config.history_capacity = n;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(
                error = %e,
                value = %capacity,
                "Ignoring DISPATCHER_HISTORY_CAPACITY"
            ),
        }
    }
    if let Some(chars) = env("DISPATCHER_SUMMARY_CHARS") {
        match chars.parse::<usize>() {
            Ok(n) => {
                config.summary_chars = n;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(
                error = %e,
                value = %chars,
                "Ignoring DISPATCHER_SUMMARY_CHARS"
            ),
        }
    }
    if let Some(mode) = env("DISPATCHER_COST_TIER_MODE") {
        match mode.parse::<CostTierMode>() {
            Ok(mode) => {
                config.cost_tier_mode = mode;
                config.source = ConfigSource::Env;
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring DISPATCHER_COST_TIER_MODE"),
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Store path override
    pub store_path: Option<PathBuf>,

    /// Lane mode override
    pub lane_mode: Option<LaneMode>,

    /// Execution timeout override (milliseconds, 0 = none)
    pub execution_timeout_ms: Option<u64>,

    /// History capacity override
    pub history_capacity: Option<usize>,

    /// Cost tier mode override
    pub cost_tier_mode: Option<CostTierMode>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set store path override
    #[must_use]
    pub fn with_store_path(mut self, path: PathBuf) -> Self {
        self.store_path = Some(path);
        self
    }

    /// Set lane mode override
    #[must_use]
    pub fn with_lane_mode(mut self, mode: LaneMode) -> Self {
        self.lane_mode = Some(mode);
        self
    }

    /// Set execution timeout override
    #[must_use]
    pub fn with_execution_timeout_ms(mut self, ms: u64) -> Self {
        self.execution_timeout_ms = Some(ms);
        self
    }

    /// Set history capacity override
    #[must_use]
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = Some(capacity);
        self
    }

    /// Set cost tier mode override
    #[must_use]
    pub fn with_cost_tier_mode(mut self, mode: CostTierMode) -> Self {
        self.cost_tier_mode = Some(mode);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the overridden configuration is invalid.
    pub fn apply(&self, config: &mut DispatcherConfigFile) -> Result<(), ConfigError> {
        if self.store_path.is_some()
            || self.lane_mode.is_some()
            || self.execution_timeout_ms.is_some()
            || self.history_capacity.is_some()
            || self.cost_tier_mode.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.store_path {
            config.store_path = path.clone();
        }
        if let Some(mode) = self.lane_mode {
            config.lane_mode = mode;
        }
        if let Some(ms) = self.execution_timeout_ms {
            config.execution_timeout = timeout_from_ms(ms);
        }
        if let Some(capacity) = self.history_capacity {
            config.history_capacity = capacity;
        }
        if let Some(mode) = self.cost_tier_mode {
            config.cost_tier_mode = mode;
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
