//! Test configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::store::StoreOptions;

/// Invalid configuration parameter.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid config: {0}")]
pub struct ConfigError(pub String);

/// What the coordinator does with the writer after each completed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriterMode {
    /// One long-lived writer receives every write command.
    #[default]
    Continuous,
    /// The writer is stopped after every pass and a fresh one is spawned,
    /// exercising the store's close/reopen path.
    RestartEachPass,
}

/// Parameters of one torture run. Immutable once the run starts.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use cask_torture::TestConfig;
///
/// let config = TestConfig {
///     num_keys: 1_000,
///     readers: 4,
///     duration: Some(Duration::from_secs(30)),
///     ..TestConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Size of the key space; keys are `1..=num_keys`.
    ///
    /// Default: 16 384. Must be ≥ 1.
    pub num_keys: u32,

    /// Store directory. Destroyed and recreated at the start of the run.
    pub path: PathBuf,

    /// Options forwarded to the store on every open and merge.
    pub store: StoreOptions,

    /// Concurrent point-reader workers.
    pub readers: usize,

    /// Concurrent value-fold workers.
    pub folders: usize,

    /// Concurrent key-fold workers.
    pub key_folders: usize,

    /// Merger workers. Must be 0 or 1.
    pub mergers: usize,

    /// The writer asks the store whether a merge is needed every this many
    /// keys. `0` never asks.
    pub merge_check_interval: u32,

    pub writer_mode: WriterMode,

    /// Length of the steady-state phase. `None` runs a single pass: one
    /// more write pass and one round of every reading role.
    pub duration: Option<Duration>,

    /// Period of the status log line.
    pub status_interval: Duration,

    /// How long a stopping writer may take to exit before the run is
    /// declared stuck.
    pub writer_stop_timeout: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            num_keys: 16 * 1024,
            path: std::env::temp_dir().join("cask-torture"),
            store: StoreOptions::default(),
            readers: 1,
            folders: 1,
            key_folders: 1,
            mergers: 1,
            merge_check_interval: 1000,
            writer_mode: WriterMode::Continuous,
            duration: None,
            status_interval: Duration::from_secs(10),
            writer_stop_timeout: Duration::from_secs(60),
        }
    }
}

impl TestConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_keys < 1 {
            return Err(ConfigError("num_keys must be >= 1".into()));
        }
        if self.mergers > 1 {
            return Err(ConfigError("mergers must be 0 or 1".into()));
        }
        if self.status_interval.is_zero() {
            return Err(ConfigError("status_interval must be > 0".into()));
        }
        if self.writer_stop_timeout.is_zero() {
            return Err(ConfigError("writer_stop_timeout must be > 0".into()));
        }
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError("store path must not be empty".into()));
        }
        self.store.validate().map_err(ConfigError)
    }
}
