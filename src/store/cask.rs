//! # Cask store
//!
//! A small bitcask-style, log-structured key-value store used as the
//! default engine under torture.
//!
//! ## Design Overview
//!
//! - Every write is appended to the **active data file** of the single
//!   read-write handle. Files rotate at [`StoreOptions::max_file_size`].
//! - An in-memory **key directory** maps each key to the location of its
//!   newest record. It is built once per directory by scanning all data
//!   files, and then shared by every handle opened through the same
//!   [`CaskStore`].
//! - Each file tracks total and dead bytes. [`StoreHandle::needs_merge`]
//!   applies the trigger/threshold rules from [`StoreOptions`];
//!   [`Store::merge`] copies the live records of the chosen files into fresh
//!   files and retires the originals.
//!
//! ## Concurrency Model
//!
//! The key directory sits behind one `RwLock`. Puts and merges take the
//! write lock; gets and fold snapshots take the read lock only long enough
//! to clone a location. Locations hold an `Arc` to their data file, so a
//! merged-away file stays readable until the last in-flight read drops it.
//! Write access is exclusive: a second read-write open waits up to
//! [`StoreOptions::open_timeout`] for the first to close.

use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;

use tracing::{debug, info};

use super::datafile::{self, DataFile, HEADER_LEN};
use super::{FileSet, OpenMode, Store, StoreError, StoreHandle, StoreOptions};

fn poisoned(what: &str) -> StoreError {
    StoreError::Internal(format!("{what} lock poisoned"))
}

// ------------------------------------------------------------------------------------------------
// Key directory
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Location {
    file: Arc<DataFile>,
    offset: u64,
    len: u32,
    stamp: u64,
}

#[derive(Debug)]
struct FileStats {
    file: Arc<DataFile>,
    total_bytes: u64,
    dead_bytes: u64,
}

impl FileStats {
    fn fragmentation(&self) -> u64 {
        if self.total_bytes == 0 {
            0
        } else {
            self.dead_bytes * 100 / self.total_bytes
        }
    }
}

#[derive(Debug)]
struct Keydir {
    entries: BTreeMap<Vec<u8>, Location>,
    files: BTreeMap<u32, FileStats>,
    active: Option<u32>,
    next_file_id: u32,
    next_stamp: u64,
    puts: u64,
}

impl Keydir {
    /// Scans every data file under `dir`, creating the directory if needed.
    fn load(dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;

        let mut paths = Vec::new();
        for dirent in fs::read_dir(dir)? {
            let path = dirent?.path();
            let id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(datafile::parse_file_id);
            if let Some(id) = id {
                paths.push((id, path));
            }
        }
        paths.sort_by_key(|(id, _)| *id);

        let mut keydir = Self {
            entries: BTreeMap::new(),
            files: BTreeMap::new(),
            active: None,
            next_file_id: paths.last().map_or(1, |(id, _)| id + 1),
            next_stamp: 1,
            puts: 0,
        };

        for (id, path) in paths {
            let file = Arc::new(DataFile::open(&path)?);
            let records = file.scan()?;
            keydir.files.insert(
                id,
                FileStats {
                    file: Arc::clone(&file),
                    total_bytes: 0,
                    dead_bytes: 0,
                },
            );
            for rec in records {
                keydir.next_stamp = keydir.next_stamp.max(rec.stamp + 1);
                keydir.apply(
                    rec.key,
                    Location {
                        file: Arc::clone(&file),
                        offset: rec.offset,
                        len: rec.len,
                        stamp: rec.stamp,
                    },
                );
            }
        }
        Ok(keydir)
    }

    /// Records `loc` as a candidate for `key`; whichever of the old and new
    /// location has the lower stamp becomes dead bytes.
    fn apply(&mut self, key: Vec<u8>, loc: Location) {
        if let Some(stats) = self.files.get_mut(&loc.file.id()) {
            stats.total_bytes += u64::from(loc.len);
        }
        let (dead_file, dead_len) = match self.entries.entry(key) {
            MapEntry::Vacant(slot) => {
                slot.insert(loc);
                return;
            }
            MapEntry::Occupied(mut slot) => {
                if slot.get().stamp > loc.stamp {
                    (loc.file.id(), loc.len)
                } else {
                    let old = slot.insert(loc);
                    (old.file.id(), old.len)
                }
            }
        };
        if let Some(stats) = self.files.get_mut(&dead_file) {
            stats.dead_bytes += u64::from(dead_len);
        }
    }

    /// Allocates and registers a new, empty data file.
    fn fresh_file(&mut self, dir: &Path) -> Result<Arc<DataFile>, StoreError> {
        let id = self.next_file_id;
        let file = Arc::new(DataFile::create(dir, id)?);
        self.next_file_id += 1;
        self.files.insert(
            id,
            FileStats {
                file: Arc::clone(&file),
                total_bytes: 0,
                dead_bytes: 0,
            },
        );
        Ok(file)
    }

    fn active_file(&self) -> Result<Arc<DataFile>, StoreError> {
        let id = self.active.ok_or(StoreError::ReadOnly)?;
        self.files
            .get(&id)
            .map(|s| Arc::clone(&s.file))
            .ok_or_else(|| StoreError::Internal(format!("active file {id} not registered")))
    }

    fn put(
        &mut self,
        dir: &Path,
        max_file_size: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<Arc<DataFile>, StoreError> {
        let stamp = self.next_stamp;
        let frame = datafile::encode_frame(stamp, key, value)?;

        let mut active = self.active_file()?;
        if active.len() > HEADER_LEN && active.len() + frame.len() as u64 > max_file_size {
            let next = self.fresh_file(dir)?;
            debug!(from = active.id(), to = next.id(), "rotated active data file");
            self.active = Some(next.id());
            active = next;
        }

        let offset = active.append_frame(&frame)?;
        self.next_stamp += 1;
        self.puts += 1;
        self.apply(
            key.to_vec(),
            Location {
                file: Arc::clone(&active),
                offset,
                len: frame.len() as u32,
                stamp,
            },
        );
        Ok(active)
    }

    /// Applies the trigger and threshold rules to every non-active file.
    fn needs_merge(&self, options: &StoreOptions) -> Option<FileSet> {
        let candidates = || {
            self.files
                .iter()
                .filter(|(id, _)| Some(**id) != self.active)
                .map(|(_, stats)| stats)
        };

        let triggered = candidates().any(|s| {
            s.dead_bytes > 0
                && (s.fragmentation() >= u64::from(options.frag_merge_trigger)
                    || s.dead_bytes >= options.dead_bytes_merge_trigger)
        });
        if !triggered {
            return None;
        }

        let selected: FileSet = candidates()
            .filter(|s| {
                s.fragmentation() >= u64::from(options.frag_threshold)
                    || s.dead_bytes >= options.dead_bytes_threshold
                    || s.file.len() < options.small_file_threshold
            })
            .map(|s| s.file.name())
            .collect();
        (!selected.is_empty()).then_some(selected)
    }

    /// Copies live records out of `ids` and retires those files.
    /// Returns the number of records moved.
    fn merge(
        &mut self,
        dir: &Path,
        max_file_size: u64,
        ids: &BTreeSet<u32>,
    ) -> Result<usize, StoreError> {
        let ids: BTreeSet<u32> = ids
            .iter()
            .copied()
            .filter(|id| Some(*id) != self.active && self.files.contains_key(id))
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let moving: Vec<(Vec<u8>, Location)> = self
            .entries
            .iter()
            .filter(|(_, loc)| ids.contains(&loc.file.id()))
            .map(|(k, loc)| (k.clone(), loc.clone()))
            .collect();

        let mut output: Option<Arc<DataFile>> = None;
        let mut outputs = Vec::new();
        for (key, loc) in &moving {
            let frame = loc.file.read_frame(loc.offset, loc.len)?;
            let target = match output.take() {
                Some(file) if file.len() + frame.len() as u64 <= max_file_size => file,
                Some(file) if file.len() == HEADER_LEN => file,
                _ => {
                    let file = self.fresh_file(dir)?;
                    outputs.push(Arc::clone(&file));
                    file
                }
            };
            let offset = target.append_frame(&frame)?;
            if let Some(stats) = self.files.get_mut(&target.id()) {
                stats.total_bytes += u64::from(loc.len);
            }
            self.entries.insert(
                key.clone(),
                Location {
                    file: Arc::clone(&target),
                    offset,
                    len: loc.len,
                    stamp: loc.stamp,
                },
            );
            output = Some(target);
        }
        for file in &outputs {
            file.sync()?;
        }

        for id in &ids {
            if let Some(stats) = self.files.remove(id) {
                stats.file.retire();
            }
        }
        info!(
            merged = ids.len(),
            produced = outputs.len(),
            records = moving.len(),
            "merge complete"
        );
        Ok(moving.len())
    }
}

// ------------------------------------------------------------------------------------------------
// Shared per-directory state
// ------------------------------------------------------------------------------------------------

/// Key-directory snapshot that folds iterate over.
#[derive(Debug)]
struct Snapshot {
    taken_at: Instant,
    puts: u64,
    entries: Vec<(Vec<u8>, Location)>,
}

#[derive(Debug)]
struct Shared {
    dir: PathBuf,
    options: StoreOptions,
    keydir: RwLock<Keydir>,
    writer: Mutex<bool>,
    writer_released: Condvar,
    fold_cache: Mutex<Option<Arc<Snapshot>>>,
}

impl Shared {
    fn read(&self) -> Result<RwLockReadGuard<'_, Keydir>, StoreError> {
        self.keydir.read().map_err(|_| poisoned("keydir"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Keydir>, StoreError> {
        self.keydir.write().map_err(|_| poisoned("keydir"))
    }

    fn writer_slot(&self) -> Result<MutexGuard<'_, bool>, StoreError> {
        self.writer.lock().map_err(|_| poisoned("writer"))
    }

    /// Claims exclusive write access and opens a fresh active file.
    fn acquire_writer(&self) -> Result<(), StoreError> {
        let timeout = self.options.open_timeout;
        let deadline = Instant::now() + timeout;
        let mut held = self.writer_slot()?;
        while *held {
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::WriterLocked(timeout));
            }
            let (guard, _) = self
                .writer_released
                .wait_timeout(held, deadline - now)
                .map_err(|_| poisoned("writer"))?;
            held = guard;
        }

        let mut keydir = self.write()?;
        let file = keydir.fresh_file(&self.dir)?;
        keydir.active = Some(file.id());
        *held = true;
        debug!(dir = %self.dir.display(), active = file.id(), "writer attached");
        Ok(())
    }

    fn release_writer(&self) -> Result<(), StoreError> {
        let mut held = self.writer_slot()?;
        let active = self.write()?.active.take();
        let result = match active {
            Some(id) => match self.read()?.files.get(&id) {
                Some(stats) => stats.file.sync().map_err(StoreError::from),
                None => Ok(()),
            },
            None => Ok(()),
        };
        *held = false;
        self.writer_released.notify_all();
        debug!(dir = %self.dir.display(), "writer detached");
        result
    }

    /// Returns a cached snapshot if the staleness limits allow, or takes a
    /// new one.
    fn snapshot(&self) -> Result<Arc<Snapshot>, StoreError> {
        let keydir = self.read()?;
        let mut cache = self.fold_cache.lock().map_err(|_| poisoned("fold cache"))?;

        let max_age = self.options.max_fold_age;
        if !max_age.is_zero() {
            if let Some(snap) = cache.as_ref() {
                let fresh = snap.taken_at.elapsed() <= max_age
                    && keydir.puts - snap.puts < self.options.max_fold_puts;
                if fresh {
                    return Ok(Arc::clone(snap));
                }
            }
        }

        let snap = Arc::new(Snapshot {
            taken_at: Instant::now(),
            puts: keydir.puts,
            entries: keydir
                .entries
                .iter()
                .map(|(k, loc)| (k.clone(), loc.clone()))
                .collect(),
        });
        if !max_age.is_zero() {
            *cache = Some(Arc::clone(&snap));
        }
        Ok(snap)
    }
}

// ------------------------------------------------------------------------------------------------
// CaskStore
// ------------------------------------------------------------------------------------------------

/// The cask engine. One instance should be shared by every worker so that
/// all handles on a directory see the same key directory.
#[derive(Debug, Default)]
pub struct CaskStore {
    open: Mutex<HashMap<PathBuf, Weak<Shared>>>,
}

impl CaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> Result<MutexGuard<'_, HashMap<PathBuf, Weak<Shared>>>, StoreError> {
        self.open.lock().map_err(|_| poisoned("registry"))
    }

    /// Returns the live shared state for `path`, if any handle holds it.
    fn lookup(&self, path: &Path) -> Result<Option<Arc<Shared>>, StoreError> {
        Ok(self.registry()?.get(path).and_then(Weak::upgrade))
    }

    /// Loads the key directory on first use. Options given by later opens
    /// of an already-loaded directory are ignored.
    fn attach(&self, path: &Path, options: &StoreOptions) -> Result<Arc<Shared>, StoreError> {
        let mut open = self.registry()?;
        if let Some(shared) = open.get(path).and_then(Weak::upgrade) {
            return Ok(shared);
        }

        let keydir = Keydir::load(path)?;
        info!(
            path = %path.display(),
            keys = keydir.entries.len(),
            files = keydir.files.len(),
            "key directory loaded"
        );
        let shared = Arc::new(Shared {
            dir: path.to_path_buf(),
            options: options.clone(),
            keydir: RwLock::new(keydir),
            writer: Mutex::new(false),
            writer_released: Condvar::new(),
            fold_cache: Mutex::new(None),
        });
        open.retain(|_, weak| weak.strong_count() > 0);
        open.insert(path.to_path_buf(), Arc::downgrade(&shared));
        Ok(shared)
    }
}

impl Store for CaskStore {
    type Handle = CaskHandle;

    fn open(
        &self,
        path: &Path,
        options: &StoreOptions,
        mode: OpenMode,
    ) -> Result<CaskHandle, StoreError> {
        let shared = self.attach(path, options)?;
        let writable = mode == OpenMode::ReadWrite;
        if writable {
            shared.acquire_writer()?;
        }
        Ok(CaskHandle {
            shared,
            writable,
            released: false,
        })
    }

    fn merge(
        &self,
        path: &Path,
        options: &StoreOptions,
        files: &FileSet,
    ) -> Result<(), StoreError> {
        let shared = self.lookup(path)?.ok_or(StoreError::NotReady)?;
        let ids: BTreeSet<u32> = files
            .iter()
            .filter_map(|name| datafile::parse_file_id(name))
            .collect();

        let mut keydir = shared.write()?;
        keydir.merge(&shared.dir, options.effective_max_file_size(), &ids)?;
        Ok(())
    }

    fn destroy(&self, path: &Path) -> Result<(), StoreError> {
        if self.lookup(path)?.is_some() {
            return Err(StoreError::InUse(path.display().to_string()));
        }
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// CaskHandle
// ------------------------------------------------------------------------------------------------

/// An open handle on a cask directory.
///
/// Dropping a read-write handle without calling [`StoreHandle::close`]
/// still releases write access.
#[derive(Debug)]
pub struct CaskHandle {
    shared: Arc<Shared>,
    writable: bool,
    released: bool,
}

impl CaskHandle {
    /// Names of all data files currently part of the store.
    pub fn data_files(&self) -> Result<FileSet, StoreError> {
        Ok(self
            .shared
            .read()?
            .files
            .values()
            .map(|s| s.file.name())
            .collect())
    }

    fn release(&mut self) -> Result<(), StoreError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        if self.writable {
            self.shared.release_writer()?;
        }
        Ok(())
    }
}

impl StoreHandle for CaskHandle {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly);
        }
        let max_file_size = self.shared.options.effective_max_file_size();
        let active = self
            .shared
            .write()?
            .put(&self.shared.dir, max_file_size, key, value)?;
        if self.shared.options.sync_on_put {
            active.sync()?;
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let loc = match self.shared.read()?.entries.get(key) {
            Some(loc) => loc.clone(),
            None => return Ok(None),
        };
        let entry = loc.file.read_entry(loc.offset, loc.len)?;
        if entry.key != key {
            return Err(StoreError::Corrupt(format!(
                "keydir points at a record for another key in file {}",
                loc.file.id()
            )));
        }
        Ok(Some(entry.value))
    }

    fn fold<A, F>(&self, mut visitor: F, acc: A) -> Result<A, StoreError>
    where
        F: FnMut(&[u8], &[u8], A) -> A,
    {
        let snap = self.shared.snapshot()?;
        let mut acc = acc;
        for (key, loc) in &snap.entries {
            let entry = loc.file.read_entry(loc.offset, loc.len)?;
            acc = visitor(key, &entry.value, acc);
        }
        Ok(acc)
    }

    fn fold_keys<A, F>(&self, mut visitor: F, acc: A) -> Result<A, StoreError>
    where
        F: FnMut(&[u8], A) -> A,
    {
        let snap = self.shared.snapshot()?;
        let mut acc = acc;
        for (key, _) in &snap.entries {
            acc = visitor(key, acc);
        }
        Ok(acc)
    }

    fn needs_merge(&self) -> Result<Option<FileSet>, StoreError> {
        Ok(self.shared.read()?.needs_merge(&self.shared.options))
    }

    fn close(mut self) -> Result<(), StoreError> {
        self.release()
    }
}

impl Drop for CaskHandle {
    fn drop(&mut self) {
        let _ = self.release();
    }
}
