//! # Store abstraction
//!
//! The harness drives the engine under test exclusively through two traits:
//!
//! - [`Store`]: the engine "module": opens handles on a directory and
//!   merges an explicit file set. Shared by every worker via `Arc`.
//! - [`StoreHandle`]: one open view of a store directory, owned by a single
//!   worker. Point reads, folds, writes and merge checks go through it.
//!
//! The contract the harness relies on:
//!
//! - many read-only handles may be open concurrently with one read-write
//!   handle on the same path;
//! - [`Store::merge`] may run concurrently with all open handles;
//! - [`Store::merge`] returns [`StoreError::NotReady`] when the engine cannot
//!   merge *yet* (e.g. its key directory is still loading). The harness
//!   treats that as a benign skip.
//!
//! [`CaskStore`] is the bundled implementation. The harness never names it:
//! `harness` is generic over [`Store`] and imports nothing but the two
//! traits, [`StoreOptions`], [`StoreError`], [`OpenMode`] and [`FileSet`]
//! from here. `CaskStore` is only the default engine for the binary and the
//! integration tests, and can be swapped for any other implementation.

pub mod cask;
mod datafile;

#[cfg(test)]
mod tests;

pub use cask::{CaskHandle, CaskStore};

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::encoding::EncodingError;

/// Data file names (relative to the store directory) selected for merging.
pub type FileSet = BTreeSet<String>;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record or header failed to encode or decode.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// On-disk data failed an integrity check.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// The store is not in a state that allows the operation yet.
    #[error("store not ready")]
    NotReady,

    /// Another read-write handle held the store for the whole open timeout.
    #[error("timed out after {0:?} waiting for write access")]
    WriterLocked(Duration),

    /// A write was attempted through a read-only handle.
    #[error("handle is read-only")]
    ReadOnly,

    /// The store directory is still open and cannot be destroyed.
    #[error("store at {0} is still open")]
    InUse(String),

    /// Internal invariant violation (poisoned lock, unexpected state, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// How a handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// Store tuning parameters, forwarded verbatim from the command line.
///
/// Fragmentation values are percentages of dead bytes in a data file.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOptions {
    /// Size at which the active data file is rotated. `0` selects
    /// [`StoreOptions::DEFAULT_MAX_FILE_SIZE`].
    pub max_file_size: u64,

    /// How long a read-write open waits for a previous writer to close.
    pub open_timeout: Duration,

    /// Any file at or above this fragmentation makes a merge necessary.
    pub frag_merge_trigger: u32,

    /// Any file with at least this many dead bytes makes a merge necessary.
    pub dead_bytes_merge_trigger: u64,

    /// Once a merge is necessary, files at or above this fragmentation are
    /// included.
    pub frag_threshold: u32,

    /// Once a merge is necessary, files with at least this many dead bytes
    /// are included.
    pub dead_bytes_threshold: u64,

    /// Once a merge is necessary, files smaller than this are included.
    pub small_file_threshold: u64,

    /// A fold may reuse a key-directory snapshot up to this old.
    /// `Duration::ZERO` disables reuse.
    pub max_fold_age: Duration,

    /// A fold may reuse a snapshot only if fewer than this many puts
    /// happened since it was taken.
    pub max_fold_puts: u64,

    /// `fdatasync` the active file after every put.
    pub sync_on_put: bool,
}

impl StoreOptions {
    /// Default data file rotation size (2 GiB).
    pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

    /// Effective rotation size after applying the `0 = default` rule.
    pub fn effective_max_file_size(&self) -> u64 {
        if self.max_file_size == 0 {
            Self::DEFAULT_MAX_FILE_SIZE
        } else {
            self.max_file_size
        }
    }

    /// Validates the option ranges.
    pub fn validate(&self) -> Result<(), String> {
        if self.frag_merge_trigger > 100 {
            return Err("frag_merge_trigger must be in [0, 100]".into());
        }
        if self.frag_threshold > 100 {
            return Err("frag_threshold must be in [0, 100]".into());
        }
        if self.frag_threshold > self.frag_merge_trigger {
            return Err("frag_threshold must be <= frag_merge_trigger".into());
        }
        if self.dead_bytes_threshold > self.dead_bytes_merge_trigger {
            return Err("dead_bytes_threshold must be <= dead_bytes_merge_trigger".into());
        }
        Ok(())
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_file_size: 0,
            open_timeout: Duration::from_secs(4),
            frag_merge_trigger: 60,
            dead_bytes_merge_trigger: 512 * 1024 * 1024,
            frag_threshold: 40,
            dead_bytes_threshold: 128 * 1024 * 1024,
            small_file_threshold: 10 * 1024 * 1024,
            max_fold_age: Duration::ZERO,
            max_fold_puts: 0,
            sync_on_put: false,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// An engine under test.
pub trait Store: Send + Sync + 'static {
    type Handle: StoreHandle;

    /// Opens a handle on the store at `path`, creating it if absent.
    fn open(
        &self,
        path: &Path,
        options: &StoreOptions,
        mode: OpenMode,
    ) -> Result<Self::Handle, StoreError>;

    /// Compacts the given data files of the store at `path`.
    ///
    /// Names that no longer exist (already merged) are ignored.
    fn merge(&self, path: &Path, options: &StoreOptions, files: &FileSet)
    -> Result<(), StoreError>;

    /// Removes every trace of the store at `path`. A missing directory is
    /// not an error.
    fn destroy(&self, path: &Path) -> Result<(), StoreError> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// One open view of a store.
pub trait StoreHandle: Send + 'static {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Returns `Ok(None)` when the key is not present.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Visits every live key/value pair once.
    fn fold<A, F>(&self, visitor: F, acc: A) -> Result<A, StoreError>
    where
        F: FnMut(&[u8], &[u8], A) -> A;

    /// Visits every live key once, without reading values.
    fn fold_keys<A, F>(&self, visitor: F, acc: A) -> Result<A, StoreError>
    where
        F: FnMut(&[u8], A) -> A;

    /// Returns the files worth merging, or `None` when no merge is needed.
    fn needs_merge(&self) -> Result<Option<FileSet>, StoreError>;

    fn close(self) -> Result<(), StoreError>;
}
