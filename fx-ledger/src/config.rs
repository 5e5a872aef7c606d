//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the snapshot
    pub data_dir: PathBuf,

    /// Snapshot file name inside `data_dir`
    pub snapshot_file: String,

    /// Snapshot encoding
    pub snapshot_format: SnapshotFormat,

    /// Initial accounts and rates, used only when no snapshot exists
    pub seed_file: Option<PathBuf>,

    /// Batching configuration
    pub batching: BatchingConfig,

    /// Worker pool configuration
    pub supervisor: SupervisorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/fx-ledger"),
            snapshot_file: "ledger.snapshot".to_string(),
            snapshot_format: SnapshotFormat::Json,
            seed_file: None,
            batching: BatchingConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// Snapshot encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    /// Human-readable JSON
    Json,
    /// Compact bincode
    Bincode,
}

impl SnapshotFormat {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(SnapshotFormat::Json),
            "bincode" => Some(SnapshotFormat::Bincode),
            _ => None,
        }
    }
}

/// Batching configuration
///
/// Disabled by default: every mutation is persisted before it is
/// acknowledged. When enabled, acknowledged mutations still pending in
/// the batch are lost if the writer crashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Maximum pending mutations before a flush
    pub max_batch_size: usize,

    /// Flush interval (milliseconds)
    pub batch_timeout_ms: u64,

    /// Enable batching
    pub enabled: bool,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            batch_timeout_ms: 10,
            enabled: false,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Number of worker instances
    pub pool_size: usize,

    /// Slot that holds the writer role at launch
    pub initial_writer: usize,

    /// Bound on a mutation routed to the writer (milliseconds)
    pub forward_timeout_ms: u64,

    /// Worker mailbox capacity
    pub mailbox_capacity: usize,

    /// Restart policy
    pub restart: RestartConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            pool_size: (cpus / 3).max(1),
            initial_writer: 0,
            forward_timeout_ms: 2_000,
            mailbox_capacity: 1_000,
            restart: RestartConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Forward timeout as a duration
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

/// Restart budget and backoff for crashed workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Restarts allowed per slot inside `window_secs`
    pub max_restarts: u32,

    /// Sliding window for the restart budget (seconds)
    pub window_secs: u64,

    /// Delay before the first restart (milliseconds)
    pub initial_backoff_ms: u64,

    /// Delay cap (milliseconds)
    pub max_backoff_ms: u64,

    /// Growth factor between consecutive restarts
    pub backoff_multiplier: f64,

    /// Random spread applied to each delay (0.1 = 10%)
    pub jitter_factor: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window_secs: 60,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl Config {
    /// Full path of the snapshot file
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file)
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("FX_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(format) = std::env::var("FX_SNAPSHOT_FORMAT") {
            self.snapshot_format = SnapshotFormat::parse(&format).ok_or_else(|| {
                crate::Error::Config(format!("Unknown snapshot format: {}", format))
            })?;
        }

        if let Ok(seed) = std::env::var("FX_SEED_FILE") {
            self.seed_file = Some(PathBuf::from(seed));
        }

        if let Ok(workers) = std::env::var("WORKERS") {
            self.supervisor.pool_size = parse_env("WORKERS", &workers)?;
        }

        if let Ok(writer) = std::env::var("STATE_WRITER") {
            self.supervisor.initial_writer = parse_env("STATE_WRITER", &writer)?;
        }

        if let Ok(timeout) = std::env::var("FX_FORWARD_TIMEOUT_MS") {
            self.supervisor.forward_timeout_ms = parse_env("FX_FORWARD_TIMEOUT_MS", &timeout)?;
        }

        if let Ok(batching) = std::env::var("FX_BATCHING") {
            self.batching.enabled = matches!(batching.as_str(), "1" | "true" | "yes");
        }

        self.validate()
    }

    /// Reject configurations that cannot keep exactly one writer
    pub fn validate(&self) -> crate::Result<()> {
        if self.supervisor.pool_size == 0 {
            return Err(crate::Error::Config("pool_size must be at least 1".to_string()));
        }
        if self.supervisor.initial_writer >= self.supervisor.pool_size {
            return Err(crate::Error::Config(format!(
                "initial_writer {} is outside a pool of {}",
                self.supervisor.initial_writer, self.supervisor.pool_size
            )));
        }
        if self.batching.enabled && self.batching.max_batch_size == 0 {
            return Err(crate::Error::Config(
                "max_batch_size must be at least 1 when batching".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| crate::Error::Config(format!("Invalid value for {}: {}", name, value)))
}
