//! Coordinator state machine.
//!
//! [`TestState`] decides everything and does nothing: every [`Event`] is
//! turned into a list of [`Action`]s for the runtime to carry out. This
//! keeps the bookkeeping (sequence baseline, live worker counts, pending
//! merges, the drain condition) testable without threads or a store.
//!
//! # Lifecycle
//!
//! ```text
//! Bootstrap ──write-done(1)──► Running ──stop / crash──► Draining ──quiescent──► Finished
//!     │                                                     ▲
//!     └───────────── single pass: immediately ──────────────┘
//! ```
//!
//! While `Running`, every completed reader, folder or key-folder is
//! replaced by a fresh one that checks against the baseline current at
//! spawn time. While `Draining` nothing new is started and the run ends
//! once the writer has exited and no worker or merge is outstanding.

use tracing::{debug, error, info, warn};

use super::{Counters, Event, HarnessError, Outcome, Report, Role, WorkerId};
use crate::config::{TestConfig, WriterMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the initial population pass (sequence 1).
    Bootstrap,
    Running,
    Draining,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStatus {
    /// A pass with this sequence number is in flight.
    Writing(u64),
    /// Told to stop so that a fresh writer can take over.
    Restarting,
    /// Told to stop for good.
    Stopping,
    Exited,
}

/// What the runtime must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start a writer thread. Any previous writer inbox is dropped.
    SpawnWriter { worker: WorkerId },
    /// Send a write pass to the current writer.
    Write { seq: u64 },
    /// Tell the current writer to close its handle and exit.
    StopWriter,
    /// Start the writer stop deadline unless one is already running. The
    /// writer owes either the write-done of its pass or its exit.
    ArmWriterDeadline,
    SpawnMerger { worker: WorkerId },
    /// Tell the merger to exit and wait for it.
    StopMerger,
    /// Start a one-shot reader, folder or key-folder.
    Spawn {
        role: Role,
        worker: WorkerId,
        min_seq: u64,
    },
    /// Log a status line.
    Status(Counters),
    /// The run is over.
    Finish(Report),
}

#[derive(Debug, Clone, Copy, Default)]
struct RoleSlots {
    target: usize,
    live: usize,
    completed: u64,
}

impl RoleSlots {
    fn new(target: usize) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// Marks every free slot as live and returns how many were filled.
    fn fill(&mut self) -> usize {
        let free = self.target.saturating_sub(self.live);
        self.live += free;
        free
    }

    /// Frees one live slot. Returns `false` if none was live.
    fn retire(&mut self) -> bool {
        if self.live == 0 {
            return false;
        }
        self.live -= 1;
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct WriterSlot {
    worker: WorkerId,
    status: WriterStatus,
}

/// All coordinator state of one run.
#[derive(Debug)]
pub struct TestState {
    writer_mode: WriterMode,
    single_pass: bool,
    with_merger: bool,

    phase: Phase,
    current_seq: u64,
    writer: WriterSlot,
    merger: Option<WorkerId>,
    readers: RoleSlots,
    folders: RoleSlots,
    key_folders: RoleSlots,
    pending_merges: u64,
    merges: u64,
    anomalies: u64,
    next_worker: u64,
    stop_requested: bool,
    failure: Option<String>,
}

impl TestState {
    pub fn new(config: &TestConfig) -> Self {
        Self {
            writer_mode: config.writer_mode,
            single_pass: config.duration.is_none(),
            with_merger: config.mergers > 0,
            phase: Phase::Bootstrap,
            current_seq: 0,
            writer: WriterSlot {
                worker: WorkerId(0),
                status: WriterStatus::Exited,
            },
            merger: None,
            readers: RoleSlots::new(config.readers),
            folders: RoleSlots::new(config.folders),
            key_folders: RoleSlots::new(config.key_folders),
            pending_merges: 0,
            merges: 0,
            anomalies: 0,
            next_worker: 0,
            stop_requested: false,
            failure: None,
        }
    }

    /// Starts the initial population pass.
    pub fn start(&mut self) -> Vec<Action> {
        let worker = self.allocate();
        self.writer = WriterSlot {
            worker,
            status: WriterStatus::Writing(1),
        };
        info!(%worker, "starting initial population");
        vec![Action::SpawnWriter { worker }, Action::Write { seq: 1 }]
    }

    /// Feeds one event through the state machine.
    ///
    /// An error is fatal: the runtime aborts the run.
    pub fn handle(&mut self, event: Event) -> Result<Vec<Action>, HarnessError> {
        let mut actions = match self.phase {
            Phase::Bootstrap => self.handle_bootstrap(event)?,
            Phase::Running | Phase::Draining => self.handle_steady(event)?,
            Phase::Finished => {
                debug!(?event, "ignoring event after finish");
                return Ok(Vec::new());
            }
        };
        self.maybe_finish(&mut actions);
        Ok(actions)
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_seq(&self) -> u64 {
        self.current_seq
    }

    pub fn writer(&self) -> (WorkerId, WriterStatus) {
        (self.writer.worker, self.writer.status)
    }

    pub fn merger(&self) -> Option<WorkerId> {
        self.merger
    }

    pub fn live(&self, role: Role) -> usize {
        match role {
            Role::Reader => self.readers.live,
            Role::Folder => self.folders.live,
            Role::KeyFolder => self.key_folders.live,
            Role::Merger => usize::from(self.merger.is_some()),
            Role::Writer => usize::from(self.writer.status != WriterStatus::Exited),
        }
    }

    pub fn counters(&self) -> Counters {
        Counters {
            current_seq: self.current_seq,
            live_readers: self.readers.live,
            live_folders: self.folders.live,
            live_key_folders: self.key_folders.live,
            pending_merges: self.pending_merges,
            reads: self.readers.completed,
            folds: self.folders.completed,
            key_folds: self.key_folders.completed,
            merges: self.merges,
            anomalies: self.anomalies,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Phases
    // --------------------------------------------------------------------------------------------

    fn handle_bootstrap(&mut self, event: Event) -> Result<Vec<Action>, HarnessError> {
        match event {
            Event::WriteDone { seq: 1 } => self.enter_steady_state(),
            Event::Status => Ok(vec![Action::Status(self.counters())]),
            Event::Stop => {
                self.stop_requested = true;
                Ok(Vec::new())
            }
            // No merger exists yet, so the writer never forwards anything.
            Event::MergePending => Ok(Vec::new()),
            Event::WriterExited { worker } => Err(HarnessError::Bootstrap(format!(
                "writer {worker} exited before completing sequence 1"
            ))),
            other => Err(HarnessError::Bootstrap(format!(
                "unexpected {other:?} during initial population"
            ))),
        }
    }

    fn enter_steady_state(&mut self) -> Result<Vec<Action>, HarnessError> {
        self.current_seq = 1;
        self.phase = Phase::Running;
        info!("initial population complete");

        let mut actions = Vec::new();
        if self.with_merger {
            let worker = self.allocate();
            self.merger = Some(worker);
            actions.push(Action::SpawnMerger { worker });
        }

        // The bootstrap writer always carries on with the first steady pass.
        self.writer.status = WriterStatus::Writing(2);
        actions.push(Action::Write { seq: 2 });
        if self.single_pass || self.stop_requested {
            actions.extend(self.begin_drain());
        }

        for role in [Role::Reader, Role::Folder, Role::KeyFolder] {
            let count = self.slots_mut(role)?.fill();
            for _ in 0..count {
                let worker = self.allocate();
                actions.push(Action::Spawn {
                    role,
                    worker,
                    min_seq: self.current_seq,
                });
            }
        }
        Ok(actions)
    }

    fn handle_steady(&mut self, event: Event) -> Result<Vec<Action>, HarnessError> {
        match event {
            Event::Status => Ok(vec![Action::Status(self.counters())]),
            Event::Stop => Ok(self.begin_drain()),
            Event::WriteDone { seq } => self.on_write_done(seq),
            Event::WriterExited { worker } => self.on_writer_exited(worker),
            Event::MergePending => {
                if self.merger.is_some() {
                    self.pending_merges += 1;
                } else {
                    debug!("merge request raced with merger loss; ignoring");
                }
                Ok(Vec::new())
            }
            Event::MergeDone => {
                if self.pending_merges == 0 {
                    return Err(HarnessError::Protocol(
                        "merge-done without a pending merge".into(),
                    ));
                }
                self.pending_merges -= 1;
                self.merges += 1;
                Ok(Vec::new())
            }
            Event::ReadDone { anomalies } => self.on_complete(Role::Reader, anomalies),
            Event::FoldDone { anomalies } => self.on_complete(Role::Folder, anomalies),
            Event::FoldKeysDone { anomalies } => self.on_complete(Role::KeyFolder, anomalies),
            Event::WorkerCrashed {
                role,
                worker,
                reason,
            } => self.on_crash(role, worker, reason),
        }
    }

    // --------------------------------------------------------------------------------------------
    // Writer
    // --------------------------------------------------------------------------------------------

    fn on_write_done(&mut self, seq: u64) -> Result<Vec<Action>, HarnessError> {
        let expected = self.current_seq + 1;
        match self.writer.status {
            WriterStatus::Writing(in_flight) if in_flight == seq && seq == expected => {}
            status => {
                return Err(HarnessError::Protocol(format!(
                    "write-done({seq}) with current sequence {} and writer {status:?}",
                    self.current_seq
                )));
            }
        }
        self.current_seq = seq;
        debug!(seq, "write pass complete");
        Ok(self.after_pass())
    }

    /// Decides what the writer does once `current_seq` is fully written.
    fn after_pass(&mut self) -> Vec<Action> {
        if self.phase == Phase::Draining {
            self.writer.status = WriterStatus::Stopping;
            return vec![Action::StopWriter];
        }
        match self.writer_mode {
            WriterMode::Continuous => {
                let next = self.current_seq + 1;
                self.writer.status = WriterStatus::Writing(next);
                vec![Action::Write { seq: next }]
            }
            WriterMode::RestartEachPass => {
                self.writer.status = WriterStatus::Restarting;
                vec![Action::StopWriter]
            }
        }
    }

    fn on_writer_exited(&mut self, worker: WorkerId) -> Result<Vec<Action>, HarnessError> {
        if worker != self.writer.worker {
            debug!(%worker, current = %self.writer.worker, "ignoring exit of a replaced writer");
            return Ok(Vec::new());
        }

        match self.writer.status {
            WriterStatus::Exited => Err(HarnessError::Protocol(format!(
                "writer {worker} reported exit twice"
            ))),
            WriterStatus::Stopping => {
                debug!(%worker, "writer stopped");
                self.writer.status = WriterStatus::Exited;
                Ok(Vec::new())
            }
            status if self.phase == Phase::Draining => {
                if let WriterStatus::Writing(seq) = status {
                    warn!(%worker, seq, "writer exited during drain with a pass in flight");
                }
                self.writer.status = WriterStatus::Exited;
                Ok(Vec::new())
            }
            WriterStatus::Restarting => Ok(self.replace_writer()),
            WriterStatus::Writing(seq) => {
                warn!(%worker, seq, "writer exited mid-pass; restarting the pass");
                Ok(self.replace_writer())
            }
        }
    }

    /// Spawns a fresh writer that redoes the next pass from the top.
    fn replace_writer(&mut self) -> Vec<Action> {
        let worker = self.allocate();
        let seq = self.current_seq + 1;
        self.writer = WriterSlot {
            worker,
            status: WriterStatus::Writing(seq),
        };
        debug!(%worker, seq, "spawning writer");
        vec![Action::SpawnWriter { worker }, Action::Write { seq }]
    }

    // --------------------------------------------------------------------------------------------
    // Readers, folders, key-folders, merger
    // --------------------------------------------------------------------------------------------

    fn on_complete(&mut self, role: Role, anomalies: u64) -> Result<Vec<Action>, HarnessError> {
        let slots = self.slots_mut(role)?;
        if !slots.retire() {
            return Err(HarnessError::Protocol(format!(
                "{role} completion with no live {role}"
            )));
        }
        slots.completed += 1;
        self.anomalies += anomalies;

        if self.phase != Phase::Running {
            return Ok(Vec::new());
        }
        self.slots_mut(role)?.live += 1;
        let worker = self.allocate();
        Ok(vec![Action::Spawn {
            role,
            worker,
            min_seq: self.current_seq,
        }])
    }

    fn on_crash(
        &mut self,
        role: Role,
        worker: WorkerId,
        reason: String,
    ) -> Result<Vec<Action>, HarnessError> {
        if role == Role::Writer {
            warn!(%worker, %reason, "writer crashed");
            return self.on_writer_exited(worker);
        }

        error!(%role, %worker, %reason, state = ?self.counters(), "worker crashed; draining");
        if role == Role::Merger {
            if self.merger == Some(worker) {
                self.merger = None;
                if self.pending_merges > 0 {
                    warn!(pending = self.pending_merges, "dropping merges owed by crashed merger");
                }
                self.pending_merges = 0;
            } else {
                warn!(%worker, "crash report from unknown merger");
            }
        } else if !self.slots_mut(role)?.retire() {
            return Err(HarnessError::Protocol(format!(
                "{role} {worker} crashed with no live {role}"
            )));
        }

        if self.failure.is_none() {
            self.failure = Some(format!("{role} {worker} crashed: {reason}"));
        }
        Ok(self.begin_drain())
    }

    // --------------------------------------------------------------------------------------------
    // Draining
    // --------------------------------------------------------------------------------------------

    /// Stops issuing new work. A pass already in flight is bounded by the
    /// writer stop deadline from here on.
    fn begin_drain(&mut self) -> Vec<Action> {
        match self.phase {
            Phase::Running => {
                info!(current_seq = self.current_seq, "draining: no new work will be issued");
                self.phase = Phase::Draining;
                match self.writer.status {
                    WriterStatus::Writing(_) => vec![Action::ArmWriterDeadline],
                    _ => Vec::new(),
                }
            }
            Phase::Bootstrap => {
                self.stop_requested = true;
                Vec::new()
            }
            Phase::Draining | Phase::Finished => Vec::new(),
        }
    }

    fn is_quiescent(&self) -> bool {
        self.writer.status == WriterStatus::Exited
            && self.readers.live == 0
            && self.folders.live == 0
            && self.key_folders.live == 0
            && self.pending_merges == 0
    }

    fn maybe_finish(&mut self, actions: &mut Vec<Action>) {
        if self.phase != Phase::Draining || !self.is_quiescent() {
            return;
        }
        if let Some(worker) = self.merger.take() {
            debug!(%worker, "stopping merger");
            actions.push(Action::StopMerger);
        }
        self.phase = Phase::Finished;

        let outcome = match self.failure.clone() {
            Some(reason) => Outcome::Failed(reason),
            None => Outcome::Passed,
        };
        let counters = self.counters();
        info!(?outcome, ?counters, "run finished");
        actions.push(Action::Finish(Report { outcome, counters }));
    }

    // --------------------------------------------------------------------------------------------
    // Helpers
    // --------------------------------------------------------------------------------------------

    fn allocate(&mut self) -> WorkerId {
        self.next_worker += 1;
        WorkerId(self.next_worker)
    }

    fn slots_mut(&mut self, role: Role) -> Result<&mut RoleSlots, HarnessError> {
        match role {
            Role::Reader => Ok(&mut self.readers),
            Role::Folder => Ok(&mut self.folders),
            Role::KeyFolder => Ok(&mut self.key_folders),
            Role::Writer | Role::Merger => Err(HarnessError::Protocol(format!(
                "{role} has no worker slots"
            ))),
        }
    }
}
