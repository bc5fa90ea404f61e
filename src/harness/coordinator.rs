//! Coordinator runtime: owns the threads and channels, executes the
//! [`Action`]s produced by [`TestState`] and feeds timer ticks and worker
//! reports back into it.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, after, at, never, tick, unbounded};
use crossbeam::select;
use tracing::{debug, error, info, warn};

use super::state::{Action, Phase, TestState};
use super::workers::{self, WorkerContext};
use super::{Event, HarnessError, MergeCommand, Report, WritePass, WriterCommand};
use crate::config::TestConfig;
use crate::store::Store;

/// Requests an early, orderly end of a running [`Harness`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    events: Sender<Event>,
}

impl StopHandle {
    /// Starts the shutdown drain. Calling it more than once is harmless.
    pub fn stop(&self) {
        if self.events.send(Event::Stop).is_err() {
            debug!("stop requested after the run ended");
        }
    }
}

/// One torture run.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use cask_torture::{CaskStore, Harness, TestConfig};
///
/// let config = TestConfig {
///     path: "/tmp/cask-torture".into(),
///     duration: Some(Duration::from_secs(10)),
///     ..TestConfig::default()
/// };
/// let report = Harness::new(CaskStore::new(), config)?.run()?;
/// assert!(report.passed());
/// # Ok::<(), cask_torture::HarnessError>(())
/// ```
pub struct Harness<S: Store> {
    ctx: WorkerContext<S>,
    inbox: Receiver<Event>,
    state: TestState,
    writer: Option<Sender<WriterCommand>>,
    merger: Option<Sender<MergeCommand>>,
    merger_thread: Option<JoinHandle<()>>,
    /// Set while a stopping or draining writer owes us its exit.
    writer_deadline: Option<Instant>,
}

impl<S: Store> Harness<S> {
    pub fn new(store: S, config: TestConfig) -> Result<Self, HarnessError> {
        Self::with_shared_store(Arc::new(store), config)
    }

    /// Like [`Harness::new`], for callers that keep their own reference to
    /// the store.
    pub fn with_shared_store(store: Arc<S>, config: TestConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        let (events, inbox) = unbounded();
        let state = TestState::new(&config);
        Ok(Self {
            ctx: WorkerContext {
                store,
                config: Arc::new(config),
                events,
            },
            inbox,
            state,
            writer: None,
            merger: None,
            merger_thread: None,
            writer_deadline: None,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            events: self.ctx.events.clone(),
        }
    }

    /// Runs the test to completion.
    pub fn run(mut self) -> Result<Report, HarnessError> {
        let config = Arc::clone(&self.ctx.config);
        info!(
            path = %config.path.display(),
            num_keys = config.num_keys,
            readers = config.readers,
            folders = config.folders,
            key_folders = config.key_folders,
            mergers = config.mergers,
            writer_mode = ?config.writer_mode,
            duration = ?config.duration,
            "starting torture run"
        );

        self.ctx.store.destroy(&config.path)?;
        let actions = self.state.start();
        if let Some(report) = self.execute_all(actions)? {
            return Ok(report);
        }

        // Initial population: nothing but the writer can make progress.
        while self.state.phase() == Phase::Bootstrap {
            let event = self.inbox.recv().map_err(|_| HarnessError::Disconnected)?;
            if let Some(report) = self.dispatch(event)? {
                return Ok(report);
            }
        }

        let status = tick(config.status_interval);
        let stop_timer = match config.duration {
            Some(duration) => after(duration),
            None => never(),
        };

        loop {
            let writer_timer = match self.writer_deadline {
                Some(deadline) => at(deadline),
                None => never(),
            };
            let event = select! {
                recv(self.inbox) -> msg => msg.map_err(|_| HarnessError::Disconnected)?,
                recv(status) -> _ => Event::Status,
                recv(stop_timer) -> _ => {
                    info!("run duration elapsed");
                    Event::Stop
                }
                recv(writer_timer) -> _ => {
                    error!(
                        timeout = ?config.writer_stop_timeout,
                        writer = ?self.state.writer(),
                        state = ?self.state.counters(),
                        "writer did not stop in time; aborting"
                    );
                    return Err(HarnessError::WriterStuck(config.writer_stop_timeout));
                }
            };
            if let Some(report) = self.dispatch(event)? {
                return Ok(report);
            }
        }
    }

    fn dispatch(&mut self, event: Event) -> Result<Option<Report>, HarnessError> {
        if let Event::WriterExited { worker } = &event {
            if *worker == self.state.writer().0 {
                self.writer_deadline = None;
            }
        }
        match self.state.handle(event) {
            Ok(actions) => self.execute_all(actions),
            Err(e) => {
                error!(
                    error = %e,
                    phase = ?self.state.phase(),
                    writer = ?self.state.writer(),
                    merger = ?self.state.merger(),
                    state = ?self.state.counters(),
                    "fatal coordinator error"
                );
                Err(e)
            }
        }
    }

    fn execute_all(&mut self, actions: Vec<Action>) -> Result<Option<Report>, HarnessError> {
        let mut report = None;
        for action in actions {
            if let Some(done) = self.execute(action)? {
                report = Some(done);
            }
        }
        Ok(report)
    }

    fn execute(&mut self, action: Action) -> Result<Option<Report>, HarnessError> {
        match action {
            Action::SpawnWriter { worker } => {
                let (tx, rx) = unbounded();
                // Dropping the previous inbox releases a writer that never
                // saw its stop command.
                self.writer = Some(tx);
                workers::spawn_writer(self.ctx.clone(), worker, rx)?;
            }
            Action::Write { seq } => {
                let pass = WritePass {
                    seq,
                    num_keys: self.ctx.config.num_keys,
                    merge_check_interval: self.ctx.config.merge_check_interval,
                    merger: self.merger.clone(),
                };
                self.send_writer(WriterCommand::Write(pass));
            }
            Action::StopWriter => {
                self.send_writer(WriterCommand::Stop);
                self.writer_deadline = Some(Instant::now() + self.ctx.config.writer_stop_timeout);
            }
            Action::ArmWriterDeadline => {
                if self.writer_deadline.is_none() {
                    self.writer_deadline =
                        Some(Instant::now() + self.ctx.config.writer_stop_timeout);
                }
            }
            Action::SpawnMerger { worker } => {
                if self.merger.is_some() {
                    return Err(HarnessError::Protocol("more than one merger".into()));
                }
                let (tx, rx) = unbounded();
                self.merger = Some(tx);
                self.merger_thread = Some(workers::spawn_merger(self.ctx.clone(), worker, rx)?);
            }
            Action::StopMerger => self.stop_merger(),
            Action::Spawn {
                role,
                worker,
                min_seq,
            } => {
                workers::spawn_checker(self.ctx.clone(), role, worker, min_seq)?;
            }
            Action::Status(counters) => info!(
                seq = counters.current_seq,
                readers = counters.live_readers,
                folders = counters.live_folders,
                key_folders = counters.live_key_folders,
                pending_merges = counters.pending_merges,
                reads = counters.reads,
                folds = counters.folds,
                key_folds = counters.key_folds,
                merges = counters.merges,
                anomalies = counters.anomalies,
                "status"
            ),
            Action::Finish(report) => {
                self.writer = None;
                return Ok(Some(report));
            }
        }
        Ok(None)
    }

    fn send_writer(&self, command: WriterCommand) {
        match &self.writer {
            Some(writer) => {
                if writer.send(command).is_err() {
                    debug!("writer inbox closed; its exit report is on the way");
                }
            }
            None => warn!(?command, "no writer to send to"),
        }
    }

    /// Tells the merger to exit and waits for it. Any merge it is running
    /// finishes first.
    fn stop_merger(&mut self) {
        if let Some(merger) = self.merger.take() {
            let _ = merger.send(MergeCommand::Stop);
        }
        if let Some(thread) = self.merger_thread.take() {
            if thread.join().is_err() {
                warn!("merger thread panicked while stopping");
            }
        }
    }
}
