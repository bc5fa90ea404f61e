//! Worker threads.
//!
//! Every worker runs inside [`supervise`], which turns the way the body
//! ended into exactly one [`Event`] for the coordinator: its completion
//! message on success, `WriterExited` for any writer ending, and
//! `WorkerCrashed` for a store error or panic anywhere else.
//!
//! Readers, folders and key-folders are one-shot: they open a read-only
//! handle, check every key against the `min_seq` baseline they were spawned
//! with, report the number of anomalies and exit. The writer and the merger
//! are long-lived and driven by their own inbox.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, error, info, trace, warn};

use super::{Event, HarnessError, MergeCommand, Role, WorkerId, WritePass, WriterCommand};
use crate::config::TestConfig;
use crate::record::{Record, decode_key, encode_key};
use crate::store::{OpenMode, Store, StoreError, StoreHandle};
use crate::verify::{FoldCheck, check_sequence, verify_fold_keys};

/// What every worker needs: the store, the run configuration and the
/// coordinator inbox.
pub(crate) struct WorkerContext<S> {
    pub store: Arc<S>,
    pub config: Arc<TestConfig>,
    pub events: Sender<Event>,
}

impl<S> Clone for WorkerContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            events: self.events.clone(),
        }
    }
}

type WorkerResult = Result<Option<Event>, StoreError>;

// ------------------------------------------------------------------------------------------------
// Spawning
// ------------------------------------------------------------------------------------------------

pub(crate) fn spawn_writer<S: Store>(
    ctx: WorkerContext<S>,
    worker: WorkerId,
    commands: Receiver<WriterCommand>,
) -> Result<JoinHandle<()>, HarnessError> {
    spawn(ctx, Role::Writer, worker, move |ctx| {
        writer_loop(ctx, worker, commands)
    })
}

pub(crate) fn spawn_merger<S: Store>(
    ctx: WorkerContext<S>,
    worker: WorkerId,
    commands: Receiver<MergeCommand>,
) -> Result<JoinHandle<()>, HarnessError> {
    spawn(ctx, Role::Merger, worker, move |ctx| {
        merge_loop(ctx, worker, commands)
    })
}

/// Starts a one-shot reader, folder or key-folder.
pub(crate) fn spawn_checker<S: Store>(
    ctx: WorkerContext<S>,
    role: Role,
    worker: WorkerId,
    min_seq: u64,
) -> Result<JoinHandle<()>, HarnessError> {
    match role {
        Role::Reader => spawn(ctx, role, worker, move |ctx| read_round(ctx, worker, min_seq)),
        Role::Folder => spawn(ctx, role, worker, move |ctx| fold_round(ctx, worker, min_seq)),
        Role::KeyFolder => spawn(ctx, role, worker, move |ctx| {
            fold_keys_round(ctx, worker)
        }),
        Role::Writer | Role::Merger => Err(HarnessError::Protocol(format!(
            "{role} is not a one-shot role"
        ))),
    }
}

fn spawn<S, F>(
    ctx: WorkerContext<S>,
    role: Role,
    worker: WorkerId,
    body: F,
) -> Result<JoinHandle<()>, HarnessError>
where
    S: Store,
    F: FnOnce(&WorkerContext<S>) -> WorkerResult + Send + 'static,
{
    thread::Builder::new()
        .name(format!("torture-{role}-{}", worker.0))
        .spawn(move || supervise(&ctx, role, worker, body))
        .map_err(HarnessError::Spawn)
}

/// Runs `body` and reports how it ended.
pub(crate) fn supervise<S, F>(ctx: &WorkerContext<S>, role: Role, worker: WorkerId, body: F)
where
    F: FnOnce(&WorkerContext<S>) -> WorkerResult,
{
    let report = match panic::catch_unwind(AssertUnwindSafe(|| body(ctx))) {
        Ok(Ok(report)) => report,
        Ok(Err(e)) => Some(failure_event(role, worker, e.to_string())),
        Err(payload) => Some(failure_event(role, worker, panic_message(payload.as_ref()))),
    };
    if let Some(event) = report {
        if ctx.events.send(event).is_err() {
            debug!(%role, %worker, "coordinator gone; dropping report");
        }
    }
}

fn failure_event(role: Role, worker: WorkerId, reason: String) -> Event {
    if role == Role::Writer {
        warn!(%worker, %reason, "writer terminated abnormally");
        return Event::WriterExited { worker };
    }
    Event::WorkerCrashed {
        role,
        worker,
        reason,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic with non-string payload".to_string()
    }
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

fn writer_loop<S: Store>(
    ctx: &WorkerContext<S>,
    worker: WorkerId,
    commands: Receiver<WriterCommand>,
) -> WorkerResult {
    let mut handle = match ctx
        .store
        .open(&ctx.config.path, &ctx.config.store, OpenMode::ReadWrite)
    {
        Ok(handle) => handle,
        Err(e) => {
            error!(%worker, error = %e, "writer failed to open store");
            return Ok(Some(Event::WriterExited { worker }));
        }
    };
    debug!(%worker, "writer ready");

    while let Ok(command) = commands.recv() {
        match command {
            WriterCommand::Write(pass) => {
                write_pass(&ctx.events, &mut handle, worker, &pass);
                if ctx.events.send(Event::WriteDone { seq: pass.seq }).is_err() {
                    break;
                }
            }
            WriterCommand::Stop => break,
        }
    }

    if let Err(e) = handle.close() {
        warn!(%worker, error = %e, "writer failed to close store");
    }
    debug!(%worker, "writer exiting");
    Ok(Some(Event::WriterExited { worker }))
}

/// Rewrites keys `num_keys` down to `1` with `pass.seq`.
///
/// A failed put is logged and skipped. Keys are written in descending order
/// so that a reader running in ascending order crosses the writer midway.
pub(crate) fn write_pass<H: StoreHandle>(
    events: &Sender<Event>,
    handle: &mut H,
    worker: WorkerId,
    pass: &WritePass,
) {
    let mut written: u32 = 0;
    for key in (1..=pass.num_keys).rev() {
        written += 1;
        if pass.merge_check_interval > 0 && written % pass.merge_check_interval == 0 {
            request_merge(events, &*handle, worker, pass);
        }

        let value = match Record::new(key, pass.seq).to_value() {
            Ok(value) => value,
            Err(e) => {
                warn!(%worker, key, seq = pass.seq, error = %e, "cannot encode value; skipping key");
                continue;
            }
        };
        if let Err(e) = handle.put(&encode_key(key), &value) {
            warn!(%worker, key, seq = pass.seq, error = %e, "put failed; skipping key");
        }
    }
    trace!(%worker, seq = pass.seq, "pass written");
}

/// Asks the store whether a merge is due and forwards the file set.
///
/// The coordinator hears about the request before the merger does, so a
/// `MergeDone` can never overtake its `MergePending`.
fn request_merge<H: StoreHandle>(
    events: &Sender<Event>,
    handle: &H,
    worker: WorkerId,
    pass: &WritePass,
) {
    let files = match handle.needs_merge() {
        Ok(Some(files)) => files,
        Ok(None) => return,
        Err(e) => {
            warn!(%worker, error = %e, "merge check failed");
            return;
        }
    };
    let Some(merger) = &pass.merger else {
        trace!(%worker, files = files.len(), "merge needed but no merger is running");
        return;
    };
    debug!(%worker, files = files.len(), "requesting merge");
    if events.send(Event::MergePending).is_err() {
        return;
    }
    if merger.send(MergeCommand::Merge(files)).is_err() {
        debug!(%worker, "merger inbox closed; merge request dropped");
    }
}

// ------------------------------------------------------------------------------------------------
// Merger
// ------------------------------------------------------------------------------------------------

fn merge_loop<S: Store>(
    ctx: &WorkerContext<S>,
    worker: WorkerId,
    commands: Receiver<MergeCommand>,
) -> WorkerResult {
    debug!(%worker, "merger ready");
    while let Ok(command) = commands.recv() {
        match command {
            MergeCommand::Merge(files) => {
                match ctx.store.merge(&ctx.config.path, &ctx.config.store, &files) {
                    Ok(()) => debug!(%worker, files = files.len(), "merge complete"),
                    Err(StoreError::NotReady) => info!(%worker, "store not ready; merge skipped"),
                    Err(e) => return Err(e),
                }
                if ctx.events.send(Event::MergeDone).is_err() {
                    break;
                }
            }
            MergeCommand::Stop => break,
        }
    }
    debug!(%worker, "merger exiting");
    Ok(None)
}

// ------------------------------------------------------------------------------------------------
// Readers and folders
// ------------------------------------------------------------------------------------------------

fn read_round<S: Store>(ctx: &WorkerContext<S>, worker: WorkerId, min_seq: u64) -> WorkerResult {
    let handle = ctx
        .store
        .open(&ctx.config.path, &ctx.config.store, OpenMode::ReadOnly)?;

    let mut anomalies = 0;
    for key in 1..=ctx.config.num_keys {
        match handle.get(&encode_key(key)) {
            Ok(Some(value)) => {
                if !check_value(Role::Reader, worker, key, &value, min_seq) {
                    anomalies += 1;
                }
            }
            Ok(None) => {
                error!(%worker, key, min_seq, "key missing");
                anomalies += 1;
            }
            Err(e) => warn!(%worker, key, error = %e, "get failed; skipping key"),
        }
    }
    handle.close()?;

    trace!(%worker, min_seq, anomalies, "read round done");
    Ok(Some(Event::ReadDone { anomalies }))
}

fn fold_round<S: Store>(ctx: &WorkerContext<S>, worker: WorkerId, min_seq: u64) -> WorkerResult {
    let handle = ctx
        .store
        .open(&ctx.config.path, &ctx.config.store, OpenMode::ReadOnly)?;

    let initial = (Vec::with_capacity(ctx.config.num_keys as usize), 0u64);
    let (mut keys, mut anomalies) = handle.fold(
        |raw_key, value, acc: (Vec<u32>, u64)| {
            let (mut keys, mut anomalies) = acc;
            match decode_key(raw_key) {
                Ok(key) => {
                    if !check_value(Role::Folder, worker, key, value, min_seq) {
                        anomalies += 1;
                    }
                    keys.push(key);
                }
                Err(e) => {
                    error!(%worker, error = %e, "undecodable key in fold");
                    anomalies += 1;
                }
            }
            (keys, anomalies)
        },
        initial,
    )?;
    handle.close()?;

    anomalies += check_key_set(Role::Folder, worker, &mut keys, ctx.config.num_keys);
    trace!(%worker, min_seq, anomalies, "fold done");
    Ok(Some(Event::FoldDone { anomalies }))
}

fn fold_keys_round<S: Store>(ctx: &WorkerContext<S>, worker: WorkerId) -> WorkerResult {
    let handle = ctx
        .store
        .open(&ctx.config.path, &ctx.config.store, OpenMode::ReadOnly)?;

    let initial = (Vec::with_capacity(ctx.config.num_keys as usize), 0u64);
    let (mut keys, mut anomalies) = handle.fold_keys(
        |raw_key, acc: (Vec<u32>, u64)| {
            let (mut keys, mut anomalies) = acc;
            match decode_key(raw_key) {
                Ok(key) => keys.push(key),
                Err(e) => {
                    error!(%worker, error = %e, "undecodable key in key fold");
                    anomalies += 1;
                }
            }
            (keys, anomalies)
        },
        initial,
    )?;
    handle.close()?;

    anomalies += check_key_set(Role::KeyFolder, worker, &mut keys, ctx.config.num_keys);
    trace!(%worker, anomalies, "key fold done");
    Ok(Some(Event::FoldKeysDone { anomalies }))
}

/// Decodes a value read under `key` and applies the staleness check.
/// Returns `false` on any anomaly.
fn check_value(role: Role, worker: WorkerId, key: u32, value: &[u8], min_seq: u64) -> bool {
    let record = match Record::from_value(value) {
        Ok(record) => record,
        Err(e) => {
            error!(%role, %worker, key, error = %e, "undecodable value");
            return false;
        }
    };
    if record.key != key {
        error!(%role, %worker, key, found = record.key, "value stored under the wrong key");
        return false;
    }
    match check_sequence(min_seq, &record) {
        Ok(()) => true,
        Err(stale) => {
            error!(
                %role,
                %worker,
                key = stale.key,
                observed = stale.observed,
                expected = stale.expected,
                "stale read"
            );
            false
        }
    }
}

/// Sorts the keys a fold produced and checks them against `1..=num_keys`.
/// Returns the number of anomalies (0 or 1).
fn check_key_set(role: Role, worker: WorkerId, keys: &mut [u32], num_keys: u32) -> u64 {
    keys.sort_unstable();
    match verify_fold_keys(keys, num_keys) {
        FoldCheck::Complete => 0,
        problem => {
            error!(%role, %worker, %problem, folded = keys.len(), "fold consistency violation");
            1
        }
    }
}
