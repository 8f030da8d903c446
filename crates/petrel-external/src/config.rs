//! Endpoint configuration with layered loading.

use figment::{
    providers::{Env, Format, Toml},
    Error as FigmentError, Figment,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when loading or parsing endpoint configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error from the Figment configuration library.
    #[error("Configuration error: {0}")]
    Figment(Box<FigmentError>),

    /// The specified configuration file was not found.
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<FigmentError> for ConfigError {
    fn from(err: FigmentError) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Configuration for external endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalConfig {
    /// Ordered list of directory templates searched for helper binaries.
    /// `%B` expands to the install prefix.
    #[serde(default = "default_helper_binary_path")]
    pub helper_binary_path: Vec<String>,

    /// Install prefix substituted for `%B`.
    #[serde(default = "default_install_prefix")]
    pub install_prefix: PathBuf,

    /// Interval between watchdog PINGs.
    #[serde(
        default = "default_ping_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub ping_interval: Duration,

    /// The worker is declared unresponsive after
    /// `ping_interval * pong_timeout_factor` without a PONG.
    #[serde(default = "default_pong_timeout_factor")]
    pub pong_timeout_factor: u32,

    /// Maximum accepted frame payload size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ExternalConfig {
    fn default() -> Self {
        Self {
            helper_binary_path: default_helper_binary_path(),
            install_prefix: default_install_prefix(),
            ping_interval: default_ping_interval(),
            pong_timeout_factor: default_pong_timeout_factor(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl ExternalConfig {
    /// Loads configuration from the default path (`petrel.toml`).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("petrel.toml")
    }

    /// Loads configuration from the specified file path.
    ///
    /// Environment variables prefixed with `PETREL_` override file
    /// settings.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PETREL_").split("__").lowercase(false));

        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(Toml::string(content));
        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Expands one search-path template against the install prefix.
    #[must_use]
    pub fn expand_search_path(&self, template: &str) -> PathBuf {
        PathBuf::from(template.replace("%B", &self.install_prefix.to_string_lossy()))
    }

    /// Returns the watchdog staleness threshold.
    #[must_use]
    pub fn pong_timeout(&self) -> Duration {
        self.ping_interval * self.pong_timeout_factor
    }
}

fn default_helper_binary_path() -> Vec<String> {
    vec!["%B".to_owned()]
}

fn default_install_prefix() -> PathBuf {
    PathBuf::from("/usr/local/bin")
}

const fn default_ping_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_pong_timeout_factor() -> u32 {
    5
}

const fn default_max_frame_size() -> usize {
    petrel_proto::MAX_DATA_SIZE
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}
