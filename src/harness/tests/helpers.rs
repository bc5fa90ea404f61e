use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::config::TestConfig;
use crate::record::{Record, decode_key};
use crate::store::{FileSet, OpenMode, Store, StoreError, StoreHandle, StoreOptions};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A small run: 100 keys, one worker per role, single pass.
pub fn small_config() -> TestConfig {
    init_tracing();
    TestConfig {
        num_keys: 100,
        path: PathBuf::from("/nonexistent/mem-store"),
        readers: 1,
        folders: 1,
        key_folders: 1,
        mergers: 1,
        merge_check_interval: 10,
        duration: None,
        status_interval: Duration::from_millis(50),
        writer_stop_timeout: Duration::from_secs(10),
        ..TestConfig::default()
    }
}

// ------------------------------------------------------------------------------------------------
// In-memory store with injectable faults
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeBehavior {
    #[default]
    Succeed,
    NotReady,
    Fail,
}

#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Reads of this key return sequence 0.
    pub stale_key: Option<u32>,
    /// This key is invisible to reads and folds.
    pub hidden_key: Option<u32>,
    pub panic_in_fold: bool,
    pub fail_writer_open: bool,
    /// `needs_merge` always recommends a merge.
    pub always_needs_merge: bool,
    /// `needs_merge` always fails.
    pub fail_needs_merge: bool,
    pub merge: MergeBehavior,
    /// Rewrites of this key past sequence 1 fail, so it keeps sequence 1.
    pub fail_put_key: Option<u32>,
    /// Point reads of this key fail.
    pub fail_get_key: Option<u32>,
    /// Every put after this many successful ones, across all handles,
    /// blocks forever.
    pub block_put_after: Option<u64>,
    /// Closing the writer handle blocks forever.
    pub block_writer_close: bool,
}

/// Parks the calling thread for good, like a store call that never returns.
fn hang() -> ! {
    loop {
        thread::park();
    }
}

type Data = Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// Store that keeps everything in one shared map and ignores its path.
#[derive(Debug, Default)]
pub struct MemStore {
    data: Data,
    faults: Faults,
    merges: AtomicU64,
    puts: Arc<AtomicU64>,
}

impl MemStore {
    pub fn with_faults(faults: Faults) -> Self {
        Self {
            faults,
            ..Self::default()
        }
    }

    pub fn merge_calls(&self) -> u64 {
        self.merges.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

impl Store for MemStore {
    type Handle = MemHandle;

    fn open(
        &self,
        _path: &Path,
        _options: &StoreOptions,
        mode: OpenMode,
    ) -> Result<MemHandle, StoreError> {
        if mode == OpenMode::ReadWrite && self.faults.fail_writer_open {
            return Err(StoreError::WriterLocked(Duration::ZERO));
        }
        Ok(MemHandle {
            data: Arc::clone(&self.data),
            faults: self.faults.clone(),
            puts: Arc::clone(&self.puts),
            writable: mode == OpenMode::ReadWrite,
        })
    }

    fn merge(
        &self,
        _path: &Path,
        _options: &StoreOptions,
        _files: &FileSet,
    ) -> Result<(), StoreError> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        match self.faults.merge {
            MergeBehavior::Succeed => Ok(()),
            MergeBehavior::NotReady => Err(StoreError::NotReady),
            MergeBehavior::Fail => Err(StoreError::Internal("injected merge failure".into())),
        }
    }

    fn destroy(&self, _path: &Path) -> Result<(), StoreError> {
        self.data.lock().unwrap().clear();
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemHandle {
    data: Data,
    faults: Faults,
    puts: Arc<AtomicU64>,
    writable: bool,
}

impl MemHandle {
    fn is(raw_key: &[u8], fault: Option<u32>) -> bool {
        fault.is_some() && decode_key(raw_key).ok() == fault
    }

    /// Applies the read-side faults to one stored pair.
    fn visible(&self, raw_key: &[u8], value: &[u8]) -> Option<Vec<u8>> {
        if Self::is(raw_key, self.faults.hidden_key) {
            return None;
        }
        if Self::is(raw_key, self.faults.stale_key) {
            let key = decode_key(raw_key).unwrap();
            return Some(Record::new(key, 0).to_value().unwrap());
        }
        Some(value.to_vec())
    }
}

impl StoreHandle for MemHandle {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if let Some(limit) = self.faults.block_put_after {
            if self.puts.load(Ordering::SeqCst) >= limit {
                hang();
            }
        }
        if Self::is(key, self.faults.fail_put_key) && Record::from_value(value).unwrap().seq > 1 {
            return Err(StoreError::Internal("injected put failure".into()));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.data.lock().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if Self::is(key, self.faults.fail_get_key) {
            return Err(StoreError::Internal("injected get failure".into()));
        }
        let data = self.data.lock().unwrap();
        Ok(data.get(key).and_then(|value| self.visible(key, value)))
    }

    fn fold<A, F>(&self, mut visitor: F, mut acc: A) -> Result<A, StoreError>
    where
        F: FnMut(&[u8], &[u8], A) -> A,
    {
        if self.faults.panic_in_fold {
            panic!("injected fold panic");
        }
        let snapshot = self.data.lock().unwrap().clone();
        for (key, value) in &snapshot {
            if let Some(value) = self.visible(key, value) {
                acc = visitor(key, &value, acc);
            }
        }
        Ok(acc)
    }

    fn fold_keys<A, F>(&self, mut visitor: F, mut acc: A) -> Result<A, StoreError>
    where
        F: FnMut(&[u8], A) -> A,
    {
        let snapshot = self.data.lock().unwrap().clone();
        for key in snapshot.keys() {
            if !Self::is(key, self.faults.hidden_key) {
                acc = visitor(key, acc);
            }
        }
        Ok(acc)
    }

    fn needs_merge(&self) -> Result<Option<FileSet>, StoreError> {
        if self.faults.fail_needs_merge {
            return Err(StoreError::Internal("injected merge check failure".into()));
        }
        if self.faults.always_needs_merge {
            return Ok(Some(FileSet::from(["000001.mem".to_string()])));
        }
        Ok(None)
    }

    fn close(self) -> Result<(), StoreError> {
        if self.writable && self.faults.block_writer_close {
            hang();
        }
        Ok(())
    }
}
