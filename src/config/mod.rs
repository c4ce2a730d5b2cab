//! Application configuration.
//!
//! Loaded from YAML files and `EXPORT__`-prefixed environment variables
//! into a single [`Config`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::BusConfig;
use crate::keys::{KeyDecrypter, KeyError, PassphraseKeys, PlaintextKeys};
use crate::models::Registration;
use crate::sender::SenderSettings;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EXPORT_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EXPORT";

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("failed to read registrations file {path}: {source}")]
    RegistrationsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed registrations file {path}: {source}")]
    RegistrationsParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid key configuration: {0}")]
    Keys(#[from] KeyError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Notification listener.
    pub service: ServiceConfig,
    /// Inbound event bus.
    pub bus: BusConfig,
    /// Where registrations come from.
    pub registrations: RegistrationsConfig,
    /// Upstream event store for mark pushed.
    pub core_data: CoreDataConfig,
    pub worker: WorkerConfig,
    pub sender: SenderSettings,
    pub keys: KeysConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 48071,
        }
    }
}

/// Registration source.
///
/// With `url` set, registrations are read from the registration service.
/// Otherwise they are read once from the JSON array in `file`, or start
/// empty.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrationsConfig {
    pub url: Option<String>,
    pub file: Option<PathBuf>,
    pub timeout_secs: u64,
    /// Delay between attempts to list registrations at startup.
    pub retry_interval_secs: u64,
}

impl Default for RegistrationsConfig {
    fn default() -> Self {
        Self {
            url: None,
            file: None,
            timeout_secs: 10,
            retry_interval_secs: 5,
        }
    }
}

impl RegistrationsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs.max(1))
    }

    /// Read the seed registrations from `file`, if configured.
    pub fn load_file(&self) -> Result<Vec<Registration>, ConfigError> {
        let Some(path) = &self.file else {
            return Ok(Vec::new());
        };
        read_registrations(path)
    }
}

fn read_registrations(path: &Path) -> Result<Vec<Registration>, ConfigError> {
    let raw = std::fs::read(path).map_err(|source| ConfigError::RegistrationsFile {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| ConfigError::RegistrationsParse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreDataConfig {
    pub url: String,
    /// Report successful deliveries back to core data.
    pub mark_pushed: bool,
    pub timeout_secs: u64,
}

impl Default for CoreDataConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:48080".to_string(),
            mark_pushed: false,
            timeout_secs: 10,
        }
    }
}

impl CoreDataConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Per-worker event channel capacity. 1 keeps the hand-off as close to
    /// rendezvous as tokio allows.
    pub event_buffer: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { event_buffer: 1 }
    }
}

/// Sink credential decryption.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Passphrase sealing stored private keys. Unset means keys are plaintext.
    pub passphrase: Option<String>,
    pub iv: String,
}

impl KeysConfig {
    pub fn decrypter(&self) -> Result<Arc<dyn KeyDecrypter>, ConfigError> {
        Ok(match &self.passphrase {
            Some(passphrase) => Arc::new(PassphraseKeys::new(passphrase, &self.iv)?),
            None => Arc::new(PlaintextKeys),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
