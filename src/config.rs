use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;
use crate::Error;

/// Which capacity limit triggers FIFO eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictOn {
    /// Creating a file past `max_files` evicts the oldest file. Writes past
    /// `max_bytes` are rejected.
    FileCount,
    /// Writing past `max_bytes` evicts the oldest files until the write
    /// fits. Creating past `max_files` is rejected.
    ByteSize,
    /// Both limits evict.
    Both,
}

impl EvictOn {
    pub fn on_file_count(self) -> bool {
        matches!(self, EvictOn::FileCount | EvictOn::Both)
    }

    pub fn on_byte_size(self) -> bool {
        matches!(self, EvictOn::ByteSize | EvictOn::Both)
    }
}

impl FromStr for EvictOn {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "file_count" => Ok(EvictOn::FileCount),
            "byte_size" => Ok(EvictOn::ByteSize),
            "both" => Ok(EvictOn::Both),
            other => Err(format!(
                "unknown eviction policy '{}', expected file_count, byte_size or both",
                other
            )),
        }
    }
}

/// Capacity limits of the storage engine
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Maximum number of files held at once (default: 100)
    pub max_files: usize,

    /// Maximum aggregate size of all file contents (default: 64MB)
    pub max_bytes: usize,

    /// Which limit triggers eviction (default: both)
    pub evict_on: EvictOn,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_files: 100,
            max_bytes: 64 * 1024 * 1024, // 64MB
            evict_on: EvictOn::Both,
        }
    }
}

impl StorageConfig {
    /// Set maximum file count
    pub fn max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /// Set maximum aggregate size in bytes
    pub fn max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set eviction policy
    pub fn evict_on(mut self, evict_on: EvictOn) -> Self {
        self.evict_on = evict_on;
        self
    }
}

/// Configuration for the file store server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Filesystem path of the listening Unix socket
    pub socket_path: PathBuf,

    /// Number of worker threads (default: 4)
    pub workers: usize,

    /// Storage capacity limits
    pub storage: StorageConfig,

    /// How often the lock manager scans for grantable locks when nothing
    /// wakes it (default: 50ms)
    pub lock_scan_interval: Duration,

    /// How often storage statistics are logged (default: 30s)
    pub stats_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("./fifostore.sock"),
            workers: 4,
            storage: StorageConfig::default(),
            lock_scan_interval: Duration::from_millis(50),
            stats_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Create a new config listening on the given socket path
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    /// Load a TOML config file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(file.apply(ServerConfig::default()))
    }

    /// Set the socket path
    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Set worker thread count
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Configure storage limits
    pub fn storage(mut self, config: StorageConfig) -> Self {
        self.storage = config;
        self
    }

    /// Set lock manager scan interval
    pub fn lock_scan_interval(mut self, interval: Duration) -> Self {
        self.lock_scan_interval = interval;
        self
    }

    /// Set statistics logging interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".into()));
        }
        if self.storage.max_files == 0 {
            return Err(Error::InvalidConfig("max_files must be at least 1".into()));
        }
        if self.storage.max_bytes == 0 {
            return Err(Error::InvalidConfig("max_bytes must be at least 1".into()));
        }
        if self.lock_scan_interval.is_zero() || self.stats_interval.is_zero() {
            return Err(Error::InvalidConfig("intervals must be non-zero".into()));
        }
        Ok(())
    }
}

/// On-disk shape of the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    socket_path: Option<PathBuf>,
    workers: Option<usize>,
    max_files: Option<usize>,
    max_bytes: Option<usize>,
    evict_on: Option<EvictOn>,
    lock_scan_interval_ms: Option<u64>,
    stats_interval_secs: Option<u64>,
}

impl ConfigFile {
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(path) = self.socket_path {
            config.socket_path = path;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(max_files) = self.max_files {
            config.storage.max_files = max_files;
        }
        if let Some(max_bytes) = self.max_bytes {
            config.storage.max_bytes = max_bytes;
        }
        if let Some(evict_on) = self.evict_on {
            config.storage.evict_on = evict_on;
        }
        if let Some(ms) = self.lock_scan_interval_ms {
            config.lock_scan_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.stats_interval_secs {
            config.stats_interval = Duration::from_secs(secs);
        }
        config
    }
}
