use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use travel_sync_core::EngineConfig;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// User the simulated devices belong to
    pub username: ConfigValue<String>,
    /// Number of simulated devices
    pub devices: ConfigValue<usize>,
    /// Replication tick interval in milliseconds
    pub sync_period_ms: ConfigValue<u64>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    /// Remaining engine settings, taken from the file as-is
    pub engine: EngineConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    username: Option<String>,
    devices: Option<usize>,
    engine: Option<EngineConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut engine = EngineConfig::default();
        let mut username = ConfigValue::new("traveler".to_string(), ConfigSource::Default);
        let mut devices = ConfigValue::new(2, ConfigSource::Default);
        let mut sync_source = ConfigSource::Default;
        let mut config_file = None;

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(user) = file_config.username {
                username = ConfigValue::new(user, ConfigSource::File);
            }
            if let Some(count) = file_config.devices {
                devices = ConfigValue::new(count, ConfigSource::File);
            }
            if let Some(engine_config) = file_config.engine {
                if engine_config.sync_period_ms != engine.sync_period_ms {
                    sync_source = ConfigSource::File;
                }
                engine = engine_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(user) = std::env::var("TRAVELSYNC_USERNAME") {
            username = ConfigValue::new(user, ConfigSource::Environment);
        }
        if let Ok(count) = std::env::var("TRAVELSYNC_DEVICES") {
            let count = count
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("TRAVELSYNC_DEVICES", count.clone()))?;
            devices = ConfigValue::new(count, ConfigSource::Environment);
        }
        if let Ok(period) = std::env::var("TRAVELSYNC_SYNC_PERIOD_MS") {
            engine.sync_period_ms = period
                .parse()
                .map_err(|_| ConfigError::InvalidEnv("TRAVELSYNC_SYNC_PERIOD_MS", period.clone()))?;
            sync_source = ConfigSource::Environment;
        }

        Ok(Self {
            username,
            devices,
            sync_period_ms: ConfigValue::new(engine.sync_period_ms, sync_source),
            config_file,
            engine,
        })
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/travelsync/
    /// - macOS: ~/Library/Application Support/travelsync/
    /// - Windows: %APPDATA%/travelsync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("travelsync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidEnv(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidEnv(name, value) => {
                write!(f, "Invalid value for {}: '{}'", name, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
