//! # Torture harness
//!
//! One coordinator thread and a set of worker threads that talk to it only
//! through messages.
//!
//! ```text
//!                 ┌──────────── Event inbox ◄──────────────────────┐
//!                 ▼                                                │
//!          ┌─────────────┐  WriterCommand   ┌────────┐  MergeCommand  ┌────────┐
//!          │ Coordinator │ ───────────────► │ Writer │ ─────────────► │ Merger │
//!          │ (TestState) │                  └────────┘                └────────┘
//!          └─────────────┘  spawn(min_seq)  ┌──────────────────────────────┐
//!                         ────────────────► │ Readers / Folders / KeyFolders│
//!                                           └──────────────────────────────┘
//! ```
//!
//! - [`state::TestState`] is the pure state machine: it consumes an
//!   [`Event`] and returns the [`state::Action`]s to perform. It owns every
//!   counter of the run and is never shared.
//! - [`Harness`] is the runtime around it: it owns the channels and
//!   threads, executes actions, and feeds timer ticks and worker messages
//!   back into the state machine.
//! - Workers report every way they can end (done, stopped, failed, panicked)
//!   as an [`Event`] variant.

mod coordinator;
pub mod state;
mod workers;

#[cfg(test)]
mod tests;

pub use coordinator::{Harness, StopHandle};

use std::fmt;
use std::io;
use std::time::Duration;

use crossbeam::channel::Sender;
use thiserror::Error;

use crate::config::{ConfigError, TestConfig};
use crate::store::{FileSet, Store, StoreError};

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Fatal harness failures. Consistency violations and worker crashes are
/// not errors: they end up in the [`Report`].
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// The store could not be prepared for the run.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The initial population pass did not complete.
    #[error("initial population failed: {0}")]
    Bootstrap(String),

    /// A message broke the coordinator protocol. This is a harness bug.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The writer did not exit after being told to stop.
    #[error("writer did not stop within {0:?}")]
    WriterStuck(Duration),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// Every sender of the coordinator inbox is gone.
    #[error("coordinator inbox disconnected")]
    Disconnected,
}

// ------------------------------------------------------------------------------------------------
// Roles and messages
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Writer,
    Reader,
    Folder,
    KeyFolder,
    Merger,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::Folder => "folder",
            Role::KeyFolder => "key-folder",
            Role::Merger => "merger",
        })
    }
}

/// Identity of one spawned worker. Never reused within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything the coordinator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Status timer tick.
    Status,
    /// End of the run was requested (duration elapsed or [`StopHandle`]).
    Stop,
    /// The writer finished rewriting every key with `seq`.
    WriteDone { seq: u64 },
    /// The writer ended: stopped, failed to open, or panicked.
    WriterExited { worker: WorkerId },
    /// The writer forwarded a merge request to the merger.
    MergePending,
    /// The merger finished (or benignly skipped) one merge request.
    MergeDone,
    ReadDone { anomalies: u64 },
    FoldDone { anomalies: u64 },
    FoldKeysDone { anomalies: u64 },
    /// A reader, folder, key-folder or merger ended abnormally.
    WorkerCrashed {
        role: Role,
        worker: WorkerId,
        reason: String,
    },
}

/// One full rewrite of the key space.
#[derive(Debug, Clone)]
pub(crate) struct WritePass {
    pub seq: u64,
    pub num_keys: u32,
    pub merge_check_interval: u32,
    /// Inbox of the merger, if one is running.
    pub merger: Option<Sender<MergeCommand>>,
}

#[derive(Debug)]
pub(crate) enum WriterCommand {
    Write(WritePass),
    Stop,
}

#[derive(Debug)]
pub(crate) enum MergeCommand {
    Merge(FileSet),
    Stop,
}

// ------------------------------------------------------------------------------------------------
// Results
// ------------------------------------------------------------------------------------------------

/// Snapshot of the coordinator's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    /// Highest sequence number fully written (the current baseline).
    pub current_seq: u64,
    pub live_readers: usize,
    pub live_folders: usize,
    pub live_key_folders: usize,
    pub pending_merges: u64,
    pub reads: u64,
    pub folds: u64,
    pub key_folds: u64,
    pub merges: u64,
    /// Consistency violations reported by readers and folders.
    pub anomalies: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    /// A worker crashed; the reason of the first crash.
    Failed(String),
}

/// Final result of a run that was not aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub outcome: Outcome,
    pub counters: Counters,
}

impl Report {
    /// True when no worker crashed. Anomalies do not fail the run; check
    /// [`Counters::anomalies`] for them.
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Passed
    }
}

/// Runs one torture test against `store` to completion.
pub fn run<S: Store>(store: S, config: TestConfig) -> Result<Report, HarnessError> {
    Harness::new(store, config)?.run()
}
