//! Swarmvault configuration file handling
//!
//! Configuration is a TOML file stored in the storage root next to the `data`
//! directory. Durations are written as humantime strings (`"5s"`, `"500ms"`).
//!
//! Everything the manager writes lives under the storage root:
//! - `data/content/<key>`: durable archive directories
//! - `data/secrets`: archive private keys
//! - `data/dbs/archives.db`: the archive index
//! - `data/announce`: peer announcements of the local engine

use crate::network::ConnectivitySettings;
use crate::ports::{PortPool, PortRange};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config file '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub storage: StorageConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub removal: RemovalConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
}

/// Port pools and peer-connection retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_upload_ports")]
    pub upload_ports: PortRange,

    #[serde(default = "default_download_ports")]
    pub download_ports: PortRange,

    /// How long each attempt waits for a peer
    #[serde(default = "default_peer_timeout", with = "duration_str")]
    pub peer_timeout: Duration,

    #[serde(default = "default_poll_interval", with = "duration_str")]
    pub poll_interval: Duration,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// Download pipeline deadlines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_metadata_timeout", with = "duration_str")]
    pub metadata_timeout: Duration,

    /// Longest pause between progress events while mirroring
    #[serde(default = "default_idle_timeout", with = "duration_str")]
    pub idle_timeout: Duration,
}

/// Archive removal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovalConfig {
    /// Delay between closing an archive and deleting its directory
    #[serde(default = "default_grace", with = "duration_str")]
    pub grace: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

fn default_upload_ports() -> PortRange {
    PortRange::new(3282, 3382)
}

fn default_download_ports() -> PortRange {
    PortRange::new(3382, 3482)
}

fn default_peer_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_metadata_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_grace() -> Duration {
    Duration::from_secs(1)
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            upload_ports: default_upload_ports(),
            download_ports: default_download_ports(),
            peer_timeout: default_peer_timeout(),
            poll_interval: default_poll_interval(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            metadata_timeout: default_metadata_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for RemovalConfig {
    fn default() -> Self {
        Self {
            grace: default_grace(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

impl NetworkConfig {
    pub fn ports(&self, pool: PortPool) -> PortRange {
        match pool {
            PortPool::Upload => self.upload_ports,
            PortPool::Download => self.download_ports,
        }
    }

    pub fn connectivity(&self) -> ConnectivitySettings {
        ConnectivitySettings {
            peer_timeout: self.peer_timeout,
            poll_interval: self.poll_interval,
            max_attempts: self.max_attempts,
        }
    }
}

impl ManagerConfig {
    /// Create a new configuration with the given storage root
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage: StorageConfig { path: storage_path },
            network: NetworkConfig::default(),
            download: DownloadConfig::default(),
            removal: RemovalConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: ManagerConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        write_file(path, &contents)
    }

    /// Check ranges and deadlines
    pub fn validate(&self) -> Result<(), ConfigError> {
        let upload = self.network.upload_ports;
        let download = self.network.download_ports;
        if upload.is_empty() || download.is_empty() {
            return Err(ConfigError::Invalid("port ranges must not be empty".into()));
        }
        if upload.overlaps(&download) {
            return Err(ConfigError::Invalid(format!(
                "upload ports {} overlap download ports {}",
                upload, download
            )));
        }
        if self.network.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.network.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        Ok(())
    }

    /// Directory holding durable archive directories
    pub fn content_dir(&self) -> PathBuf {
        self.storage.path.join("data").join("content")
    }

    /// Durable directory of the archive `key`
    pub fn archive_dir(&self, key: &crate::engine::ArchiveKey) -> PathBuf {
        self.content_dir().join(key.to_hex())
    }

    pub fn secret_dir(&self) -> PathBuf {
        self.storage.path.join("data").join("secrets")
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage
            .path
            .join("data")
            .join("dbs")
            .join("archives.db")
    }

    pub fn announce_dir(&self) -> PathBuf {
        self.storage.path.join("data").join("announce")
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml(storage_path: &Path) -> String {
        format!(
            r#"# Swarmvault Configuration
#
# Archives, secrets and the archive index live under the storage path:
#   data/content/<key>      durable archive directories
#   data/secrets            archive private keys (keep these safe)
#   data/dbs/archives.db    index used to resume archives after restart

[storage]
path = "{storage_path}"

[network]
# Ports for sharing archives (create, resume) and for downloads.
# Ranges are [start, end) and must not overlap.
upload_ports = {{ start = 3282, end = 3382 }}
download_ports = {{ start = 3382, end = 3482 }}

# How long a download waits for a peer before rebinding on a new port
peer_timeout = "5s"
poll_interval = "1s"
max_attempts = 3

[download]
# Waiting for the remote file tree is not retried
metadata_timeout = "30s"
# A download with no progress for this long is abandoned
idle_timeout = "30s"

[removal]
# Delay between closing an archive and deleting its directory
grace = "1s"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (optional, logs to stderr if not specified)
# file = "/var/log/swarmvault/swarmvault.log"
"#,
            storage_path = storage_path.display()
        )
    }

    /// Create and save a default configuration file
    pub fn create_default(config_path: &Path, storage_path: &Path) -> Result<(), ConfigError> {
        write_file(config_path, &Self::generate_default_toml(storage_path))
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), ConfigError> {
    let write_error = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    fs::write(path, contents).map_err(write_error)
}

/// Get the default config file path for a storage root
pub fn default_config_path(storage_path: &Path) -> PathBuf {
    storage_path.join("config.toml")
}

/// Get the default storage root
pub fn default_storage_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("swarmvault")
}

/// Serde adapter for humantime duration strings.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let storage = PathBuf::from("/data/swarmvault");
        let config = ManagerConfig::new(storage.clone());

        assert_eq!(config.storage.path, storage);
        assert_eq!(config.network.upload_ports, PortRange::new(3282, 3382));
        assert_eq!(config.network.download_ports, PortRange::new(3382, 3482));
        assert_eq!(config.network.max_attempts, 3);
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_derived_paths() {
        let config = ManagerConfig::new(PathBuf::from("/srv/sv"));
        assert_eq!(config.content_dir(), PathBuf::from("/srv/sv/data/content"));
        assert_eq!(config.secret_dir(), PathBuf::from("/srv/sv/data/secrets"));
        assert_eq!(config.db_path(), PathBuf::from("/srv/sv/data/dbs/archives.db"));
        assert_eq!(config.announce_dir(), PathBuf::from("/srv/sv/data/announce"));

        let key = crate::engine::ArchiveKey::from_bytes(&[0xab; 32]).unwrap();
        assert_eq!(
            config.archive_dir(&key),
            PathBuf::from("/srv/sv/data/content").join(key.to_hex())
        );
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut config = ManagerConfig::new(PathBuf::from("/data/swarmvault"));
        config.network.peer_timeout = Duration::from_millis(1500);
        config.save(&config_path).unwrap();

        let loaded = ManagerConfig::load(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_create_default_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let storage = temp_dir.path().join("store");

        ManagerConfig::create_default(&config_path, &storage).unwrap();
        assert!(config_path.exists());

        let config = ManagerConfig::load(&config_path).unwrap();
        assert_eq!(config, ManagerConfig::new(storage));
    }

    #[test]
    fn test_load_config_with_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[storage]
path = "/tmp/sv"

[network]
peer_timeout = "250ms"
"#,
        )
        .unwrap();

        let config = ManagerConfig::load(&config_path).unwrap();
        assert_eq!(config.network.peer_timeout, Duration::from_millis(250));
        assert_eq!(config.network.poll_interval, Duration::from_secs(1));
        assert_eq!(config.download.metadata_timeout, Duration::from_secs(30));
        assert_eq!(config.removal.grace, Duration::from_secs(1));
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[storage]
path = "/tmp/sv"

[network]
upload_ports = { start = 4000, end = 4100 }
download_ports = { start = 4050, end = 4150 }
"#,
        )
        .unwrap();

        assert!(matches!(
            ManagerConfig::load(&config_path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_duration_is_parse_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(
            &config_path,
            "[storage]\npath = \"/tmp\"\n[download]\nidle_timeout = \"soon\"\n",
        )
        .unwrap();

        assert!(matches!(
            ManagerConfig::load(&config_path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_default_config_path() {
        assert_eq!(
            default_config_path(Path::new("/data/swarmvault")),
            PathBuf::from("/data/swarmvault/config.toml")
        );
    }
}
