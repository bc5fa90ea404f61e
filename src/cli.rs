//! Command-line arguments.
//!
//! Flag names keep their underscore spelling (`--num_keys`) so existing
//! invocation scripts keep working. Every flag is optional; an absent flag
//! leaves the library default in place.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use cask_torture::{TestConfig, WriterMode};

#[derive(Debug, Parser)]
#[command(name = "cask-torture")]
#[command(about = "Concurrency torture test for a log-structured key-value store")]
#[command(version)]
pub struct Cli {
    /// Steady-state run time in milliseconds. Absent runs a single pass.
    #[arg(long)]
    pub duration: Option<u64>,

    /// Store directory. Destroyed and recreated at start.
    #[arg(long, value_name = "PATH")]
    pub cask: Option<PathBuf>,

    /// Number of keys in the key space.
    #[arg(long = "num_keys")]
    pub num_keys: Option<u32>,

    /// Concurrent point readers.
    #[arg(long)]
    pub readers: Option<usize>,

    /// Concurrent value folders.
    #[arg(long)]
    pub folders: Option<usize>,

    /// Concurrent key folders.
    #[arg(long)]
    pub foldkeys: Option<usize>,

    /// Merge workers (0 or 1).
    #[arg(long)]
    pub mergers: Option<usize>,

    /// Data file rotation size in bytes. 0 selects the store default.
    #[arg(long = "max_file_size")]
    pub max_file_size: Option<u64>,

    /// Seconds a writer open waits for the previous writer.
    #[arg(long = "open_timeout")]
    pub open_timeout: Option<u64>,

    /// Stop and respawn the writer after every pass.
    #[arg(long = "restart_writer", action = ArgAction::Set, value_name = "BOOL")]
    pub restart_writer: Option<bool>,

    /// Keys written between merge checks. 0 disables merging.
    #[arg(long = "needs_merge_freq")]
    pub needs_merge_freq: Option<u32>,

    /// Seconds between status lines.
    #[arg(long = "status_interval")]
    pub status_interval: Option<u64>,

    /// Fragmentation percentage that makes a merge necessary. Without
    /// --frag_threshold, the default threshold is lowered to fit under it.
    #[arg(long = "frag_merge_trigger")]
    pub frag_merge_trigger: Option<u32>,

    /// Dead bytes that make a merge necessary. Without
    /// --dead_bytes_threshold, the default threshold is lowered to fit
    /// under it.
    #[arg(long = "dead_bytes_merge_trigger")]
    pub dead_bytes_merge_trigger: Option<u64>,

    /// Must not exceed --frag_merge_trigger.
    #[arg(long = "frag_threshold")]
    pub frag_threshold: Option<u32>,

    /// Must not exceed --dead_bytes_merge_trigger.
    #[arg(long = "dead_bytes_threshold")]
    pub dead_bytes_threshold: Option<u64>,

    #[arg(long = "small_file_threshold")]
    pub small_file_threshold: Option<u64>,

    /// Milliseconds a fold may reuse a key-directory snapshot.
    #[arg(long = "max_fold_age")]
    pub max_fold_age: Option<u64>,

    /// Puts after which a fold snapshot is no longer reused.
    #[arg(long = "max_fold_puts")]
    pub max_fold_puts: Option<u64>,

    /// fdatasync after every put.
    #[arg(long = "sync_on_put", action = ArgAction::Set, value_name = "BOOL")]
    pub sync_on_put: Option<bool>,
}

impl Cli {
    /// Applies the given flags on top of [`TestConfig::default`].
    pub fn to_config(&self) -> TestConfig {
        let mut config = TestConfig::default();

        config.duration = self.duration.map(Duration::from_millis);
        if let Some(path) = &self.cask {
            config.path = path.clone();
        }
        set(&mut config.num_keys, self.num_keys);
        set(&mut config.readers, self.readers);
        set(&mut config.folders, self.folders);
        set(&mut config.key_folders, self.foldkeys);
        set(&mut config.mergers, self.mergers);
        set(&mut config.merge_check_interval, self.needs_merge_freq);
        if let Some(secs) = self.status_interval {
            config.status_interval = Duration::from_secs(secs);
        }
        if let Some(restart) = self.restart_writer {
            config.writer_mode = if restart {
                WriterMode::RestartEachPass
            } else {
                WriterMode::Continuous
            };
        }

        let store = &mut config.store;
        set(&mut store.max_file_size, self.max_file_size);
        if let Some(secs) = self.open_timeout {
            store.open_timeout = Duration::from_secs(secs);
        }
        set(&mut store.frag_merge_trigger, self.frag_merge_trigger);
        set(&mut store.dead_bytes_merge_trigger, self.dead_bytes_merge_trigger);
        // An explicit threshold is passed on as given; a default one follows
        // a lowered trigger.
        store.frag_threshold = self
            .frag_threshold
            .unwrap_or(store.frag_threshold.min(store.frag_merge_trigger));
        store.dead_bytes_threshold = self
            .dead_bytes_threshold
            .unwrap_or(store.dead_bytes_threshold.min(store.dead_bytes_merge_trigger));
        set(&mut store.small_file_threshold, self.small_file_threshold);
        if let Some(ms) = self.max_fold_age {
            store.max_fold_age = Duration::from_millis(ms);
        }
        set(&mut store.max_fold_puts, self.max_fold_puts);
        set(&mut store.sync_on_put, self.sync_on_put);

        config
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}
