//! Configuration for the tidekv server
//!
//! Settings are read from a TOML file; every section and field has a default,
//! so a partial file (or no file at all) yields a runnable configuration.
//! Command-line flags are applied on top by the binary.

use crate::replication::BackoffConfig;
use crate::wal::{FsyncPolicy, WalConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// tidekv server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub persistence: PersistenceSettings,
    pub replication: ReplicationSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    pub host: String,
    /// Listening port (0 picks an ephemeral port)
    pub port: u16,
    /// Number of logical databases
    pub databases: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            databases: crate::keyspace::DEFAULT_DATABASES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Directory for WAL segments and the snapshot file
    pub dir: PathBuf,
    /// Whether committed writes go to the WAL
    pub wal_enabled: bool,
    /// WAL page size in bytes
    pub wal_page_size: usize,
    /// Number of pages in the WAL ring
    pub wal_page_count: usize,
    /// WAL fsync policy
    pub fsync: FsyncPolicy,
    /// Snapshot file name inside `dir`
    pub snapshot_file: String,
    /// Seconds between background snapshots when there were writes (0 disables)
    pub snapshot_interval_secs: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data"),
            wal_enabled: true,
            wal_page_size: crate::wal::DEFAULT_PAGE_SIZE,
            wal_page_count: crate::wal::DEFAULT_PAGE_COUNT,
            fsync: FsyncPolicy::Everysec,
            snapshot_file: "dump.tdb".to_string(),
            snapshot_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    /// Backlog capacity in bytes
    pub backlog_size: usize,
    /// Seconds a primary keeps its backlog with no replicas (0 keeps it forever)
    pub backlog_ttl_secs: u64,
    /// Largest slice of backlog handed to a replica per pump
    pub chunk_size: usize,
    /// Period of the replication housekeeping tick
    pub cron_interval_ms: u64,
    /// Seconds between keepalive probes to idle replicas
    pub ping_period_secs: u64,
    /// Seconds of silence after which a peer is considered dead
    pub replica_timeout_secs: u64,
    /// Milliseconds between acknowledgements sent by a replica
    pub ack_interval_ms: u64,
    /// First reconnect delay
    pub reconnect_initial_ms: u64,
    /// Largest reconnect delay
    pub reconnect_max_ms: u64,
    /// Reconnect delay growth factor
    pub reconnect_multiplier: f64,
    /// Primary to replicate from at startup, as `host:port`
    pub replicaof: Option<String>,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            backlog_size: crate::replication::DEFAULT_BACKLOG_CAPACITY,
            backlog_ttl_secs: 3600,
            chunk_size: 16 * 1024,
            cron_interval_ms: 100,
            ping_period_secs: 10,
            replica_timeout_secs: 60,
            ack_interval_ms: 1000,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
            reconnect_multiplier: 2.0,
            replicaof: None,
        }
    }
}

impl ReplicationSettings {
    pub fn cron_interval(&self) -> Duration {
        Duration::from_millis(self.cron_interval_ms)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }

    pub fn replica_timeout(&self) -> Duration {
        Duration::from_secs(self.replica_timeout_secs)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
            multiplier: self.reconnect_multiplier,
        }
    }

    /// Parsed `replicaof` target
    pub fn replicaof_target(&self) -> Result<Option<(String, u16)>, ConfigError> {
        self.replicaof.as_deref().map(parse_host_port).transpose()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
    /// Log file; stdout when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("server.databases must be at least 1")]
    NoDatabases,

    #[error("persistence.wal_page_size must be greater than zero")]
    ZeroPageSize,

    #[error("persistence.wal_page_count must be at least 2, got {0}")]
    TooFewPages(usize),

    #[error("persistence.snapshot_file must not be empty")]
    EmptySnapshotFile,

    #[error("replication.backlog_size must be greater than zero")]
    ZeroBacklog,

    #[error("replication.chunk_size must be between 1 and backlog_size")]
    InvalidChunkSize,

    #[error("replication.cron_interval_ms must be greater than zero")]
    ZeroCronInterval,

    #[error("replication.reconnect_multiplier must be at least 1.0")]
    InvalidMultiplier,

    #[error("invalid host:port '{0}'")]
    InvalidAddress(String),
}

impl ServerConfig {
    /// Load configuration from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServerConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.databases == 0 {
            return Err(ConfigError::NoDatabases);
        }
        if self.persistence.wal_page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        if self.persistence.wal_page_count < 2 {
            return Err(ConfigError::TooFewPages(self.persistence.wal_page_count));
        }
        if self.persistence.snapshot_file.is_empty() {
            return Err(ConfigError::EmptySnapshotFile);
        }
        if self.replication.backlog_size == 0 {
            return Err(ConfigError::ZeroBacklog);
        }
        if self.replication.chunk_size == 0 || self.replication.chunk_size > self.replication.backlog_size {
            return Err(ConfigError::InvalidChunkSize);
        }
        if self.replication.cron_interval_ms == 0 {
            return Err(ConfigError::ZeroCronInterval);
        }
        if self.replication.reconnect_multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier);
        }
        self.replication.replicaof_target()?;
        Ok(())
    }

    /// Address the listener binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.persistence.dir.join(&self.persistence.snapshot_file)
    }

    pub fn wal_config(&self) -> WalConfig {
        WalConfig {
            dir: self.persistence.dir.clone(),
            page_size: self.persistence.wal_page_size,
            page_count: self.persistence.wal_page_count,
            fsync: self.persistence.fsync,
        }
    }
}

/// Parse `host:port`
pub fn parse_host_port(value: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(value.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ConfigError::InvalidAddress(value.to_string()))?;
    if host.is_empty() || port == 0 {
        return Err(ConfigError::InvalidAddress(value.to_string()));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.port, 6379);
        assert_eq!(config.server.databases, 16);
        assert_eq!(config.persistence.fsync, FsyncPolicy::Everysec);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ServerConfig::default();
        config.persistence.wal_page_count = 1;
        assert_eq!(config.validate(), Err(ConfigError::TooFewPages(1)));

        let mut config = ServerConfig::default();
        config.replication.chunk_size = config.replication.backlog_size + 1;
        assert_eq!(config.validate(), Err(ConfigError::InvalidChunkSize));

        let mut config = ServerConfig::default();
        config.replication.replicaof = Some("nowhere".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidAddress(_))));
    }

    #[test]
    fn test_load_partial_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tidekv.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 7000

[persistence]
fsync = "always"

[replication]
replicaof = "10.0.0.1:6379"

[logging]
format = "json"
"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.persistence.fsync, FsyncPolicy::Always);
        assert_eq!(
            config.replication.replicaof_target().unwrap(),
            Some(("10.0.0.1".to_string(), 6379))
        );
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig::load(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 6379);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        std::fs::write(&path, "[server]\ndatabases = 0\n").unwrap();
        assert!(ServerConfig::load(&path).is_err());
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(parse_host_port("localhost:6380").unwrap(), ("localhost".to_string(), 6380));
        assert!(parse_host_port(":6380").is_err());
        assert!(parse_host_port("host:0").is_err());
        assert!(parse_host_port("host:abc").is_err());
    }
}
