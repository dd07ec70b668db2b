//! One worksheet's execution context and the state machine around it.
//!
//! ```text
//! NotStarted --start--> Idle --execute--> Computing --poll(done)--> Idle
//!                        |                   |
//!                        |                   +--interrupt--> Idle
//!                        +------- quit / process death -------> Stopped
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, ResourceLimits};
use crate::engine::{Backend, BackendCapabilities, Cell};
use crate::errors::{EngineError, Result};
use crate::monitor;
use crate::output::{Drained, OutputChannel};
use crate::snapshot::{OutputSnapshot, ScratchDir};

pub(crate) const RESTART_NOTICE: &str =
    "\n[interrupted: worker restarted, session state was lost]\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    NotStarted,
    Idle,
    Computing,
    Stopped,
}

impl WorkerState {
    pub fn is_started(&self) -> bool {
        matches!(self, WorkerState::Idle | WorkerState::Computing)
    }

    fn to_u8(self) -> u8 {
        match self {
            WorkerState::NotStarted => 0,
            WorkerState::Idle => 1,
            WorkerState::Computing => 2,
            WorkerState::Stopped => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => WorkerState::NotStarted,
            1 => WorkerState::Idle,
            2 => WorkerState::Computing,
            _ => WorkerState::Stopped,
        }
    }
}

/// Read-only view of a worker's state that never waits on the worker
#[derive(Debug, Clone)]
pub struct StateView(Arc<AtomicU8>);

impl StateView {
    fn new(state: WorkerState) -> Self {
        Self(Arc::new(AtomicU8::new(state.to_u8())))
    }

    pub fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state.to_u8(), Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptOutcome {
    /// Nothing was running
    NotComputing,
    /// The cell stopped after a keyboard interrupt; session state is intact
    Interrupted,
    /// The context was replaced and session state was lost
    Restarted,
    /// The context died while stopping; the worker is `Stopped`
    Exited,
    /// The cell ignored every interrupt and escalation was not allowed
    StillRunning,
}

impl InterruptOutcome {
    /// Whether nothing is running any more
    pub fn stopped(&self) -> bool {
        !matches!(self, InterruptOutcome::StillRunning)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub scratch_root: PathBuf,
    pub startup_timeout: Duration,
    pub interrupt_wait: Duration,
    pub monitor_interval: Duration,
    /// Run after every start and restart; its output is discarded
    pub preamble: Option<String>,
    pub max_output_bytes: usize,
}

impl From<&EngineConfig> for WorkerOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            scratch_root: config.scratch_root.clone(),
            startup_timeout: config.startup_timeout(),
            interrupt_wait: config.interrupt_wait(),
            monitor_interval: config.monitor_interval(),
            preamble: config.preamble.clone(),
            max_output_bytes: config.max_output_bytes(),
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

struct Execution {
    generation: u64,
    scratch: ScratchDir,
    artifacts: Vec<String>,
    watchdog: Option<JoinHandle<()>>,
}

impl Execution {
    /// New files are appended; names already reported keep their position.
    fn refresh_artifacts(&mut self) {
        match self.scratch.list_files() {
            Ok(names) => {
                for name in names {
                    if !self.artifacts.contains(&name) {
                        self.artifacts.push(name);
                    }
                }
            }
            Err(e) => debug!("[WORKER] Could not list scratch dir: {}", e),
        }
    }

    fn into_parts(self) -> (ScratchDir, Vec<String>) {
        if let Some(watchdog) = self.watchdog {
            watchdog.abort();
        }
        (self.scratch, self.artifacts)
    }
}

/// Owns one execution context and runs cells in it one at a time.
///
/// All operations take `&mut self`; callers that share a worker serialize
/// access with a lock (see [`crate::supervisor::WorkerSupervisor`]).
/// [`ExecutionWorker::poll`] never waits on the context.
pub struct ExecutionWorker {
    id: Uuid,
    backend: Box<dyn Backend>,
    limits: ResourceLimits,
    options: WorkerOptions,
    channel: Arc<OutputChannel>,
    state: StateView,
    current: Option<Execution>,
    parked: Option<OutputSnapshot>,
    preamble_pending: bool,
    last_activity: Instant,
}

impl ExecutionWorker {
    pub fn new(backend: Box<dyn Backend>, limits: ResourceLimits, options: WorkerOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            limits,
            channel: Arc::new(OutputChannel::with_limit(options.max_output_bytes)),
            options,
            state: StateView::new(WorkerState::NotStarted),
            current: None,
            parked: None,
            preamble_pending: false,
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn state_view(&self) -> StateView {
        self.state.clone()
    }

    pub fn channel(&self) -> Arc<OutputChannel> {
        self.channel.clone()
    }

    pub fn is_computing(&self) -> bool {
        self.state() == WorkerState::Computing
    }

    pub fn is_started(&self) -> bool {
        self.state().is_started()
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Takes effect when the context is next launched
    pub fn set_limits(&mut self, limits: ResourceLimits) {
        self.limits = limits;
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.backend.capabilities()
    }

    /// Time since the last start, execute, poll with output, or interrupt
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn set_state(&self, state: WorkerState) {
        self.state.set(state);
    }

    /// Launch the context and wait until it accepts code. Idempotent while running.
    pub async fn start(&mut self) -> Result<()> {
        match self.state() {
            WorkerState::Idle | WorkerState::Computing => return Ok(()),
            WorkerState::Stopped => {
                return Err(EngineError::StartupError("worker has been stopped".into()))
            }
            WorkerState::NotStarted => {}
        }

        if let Err(e) = std::fs::create_dir_all(&self.options.scratch_root) {
            return Err(EngineError::StartupError(format!(
                "cannot create scratch root {:?}: {}",
                self.options.scratch_root, e
            )));
        }
        if let Err(e) = self.boot().await {
            self.backend.kill();
            warn!(worker = %self.id, "[WORKER] Start failed: {}", e);
            return Err(e);
        }
        self.set_state(WorkerState::Idle);
        self.touch();
        info!(worker = %self.id, backend = %self.backend.capabilities().name, "[WORKER] Started");
        Ok(())
    }

    async fn boot(&mut self) -> Result<()> {
        self.backend.launch(&self.limits, self.channel.clone())?;
        if !self.channel.wait_ready(self.options.startup_timeout).await {
            let reason = if self.channel.has_exited() {
                "worker exited during startup"
            } else {
                "timed out waiting for worker to become ready"
            };
            self.backend.kill();
            return Err(EngineError::StartupError(reason.into()));
        }
        self.preamble_pending = self.options.preamble.is_some();
        self.run_preamble().await
    }

    async fn run_preamble(&mut self) -> Result<()> {
        if !self.preamble_pending {
            return Ok(());
        }
        self.preamble_pending = false;
        let Some(code) = self.options.preamble.clone() else {
            return Ok(());
        };

        let scratch = ScratchDir::create(&self.options.scratch_root)?;
        let generation = self.channel.begin();
        let submitted = self
            .backend
            .submit(Cell {
                code,
                scratch_dir: scratch.path().to_path_buf(),
                generation,
            })
            .await;
        let finished =
            submitted.is_ok() && self.channel.wait_finished(self.options.startup_timeout).await;
        let drained = self.channel.drain();
        self.channel.settle();
        submitted?;

        if !finished {
            return Err(EngineError::StartupError(
                "preamble did not finish within the startup timeout".into(),
            ));
        }
        if drained.exited {
            return Err(EngineError::StartupError(
                "worker exited while running the preamble".into(),
            ));
        }
        debug!(worker = %self.id, discarded = drained.cumulative.len(), "[WORKER] Ran preamble");
        Ok(())
    }

    /// Submit a cell. Returns as soon as the context has accepted it.
    pub async fn execute(&mut self, code: &str) -> Result<()> {
        match self.state() {
            WorkerState::NotStarted | WorkerState::Stopped => return Err(EngineError::NotStarted),
            WorkerState::Computing => return Err(EngineError::AlreadyComputing),
            WorkerState::Idle => {}
        }

        if self.parked.take().is_some() {
            debug!(worker = %self.id, "[WORKER] Discarding undelivered output of previous cell");
        }
        if let Err(e) = self.run_preamble().await {
            self.backend.kill();
            self.set_state(WorkerState::Stopped);
            return Err(e);
        }

        let scratch = ScratchDir::create(&self.options.scratch_root)?;
        let generation = self.channel.begin();
        let cell = Cell {
            code: code.to_string(),
            scratch_dir: scratch.path().to_path_buf(),
            generation,
        };
        if let Err(e) = self.backend.submit(cell).await {
            self.channel.settle();
            if !self.backend.is_alive() {
                warn!(worker = %self.id, "[WORKER] Worker process is gone: {}", e);
                self.backend.kill();
                self.set_state(WorkerState::Stopped);
            }
            return Err(e);
        }

        let watchdog = if self.limits.needs_watchdog() {
            self.backend.enforcer().map(|enforcer| {
                monitor::spawn_watchdog(
                    self.limits,
                    enforcer,
                    self.channel.clone(),
                    generation,
                    self.options.monitor_interval,
                )
            })
        } else {
            None
        };

        self.current = Some(Execution {
            generation,
            scratch,
            artifacts: Vec::new(),
            watchdog,
        });
        self.set_state(WorkerState::Computing);
        self.touch();
        debug!(worker = %self.id, generation, "[WORKER] Executing cell");
        Ok(())
    }

    /// Report progress of the current cell without waiting.
    ///
    /// `output` is only what arrived since the previous poll. The poll that
    /// reports `done` carries the scratch directory and moves the worker back
    /// to `Idle` (or `Stopped` if the process died).
    pub fn poll(&mut self) -> Result<OutputSnapshot> {
        if let Some(snapshot) = self.parked.take() {
            return Ok(snapshot);
        }
        match self.state() {
            WorkerState::NotStarted => return Err(EngineError::NotStarted),
            WorkerState::Idle | WorkerState::Stopped => return Ok(OutputSnapshot::idle()),
            WorkerState::Computing => {}
        }

        let drained = self.channel.drain();
        if drained.finished {
            return Ok(self.conclude(drained));
        }

        let Some(execution) = self.current.as_mut() else {
            self.set_state(WorkerState::Idle);
            return Ok(OutputSnapshot::idle());
        };
        execution.refresh_artifacts();
        let artifacts = execution.artifacts.clone();
        if !drained.fresh.is_empty() {
            self.touch();
        }
        Ok(OutputSnapshot::running(
            drained.fresh,
            drained.cumulative,
            artifacts,
        ))
    }

    fn conclude(&mut self, drained: Drained) -> OutputSnapshot {
        self.channel.settle();
        let (scratch, artifacts) = match self.current.take() {
            Some(mut execution) => {
                execution.refresh_artifacts();
                debug!(worker = %self.id, generation = execution.generation, "[WORKER] Cell finished");
                let (scratch, artifacts) = execution.into_parts();
                (Some(scratch), artifacts)
            }
            None => (None, Vec::new()),
        };

        if let Some(kind) = drained.breach {
            warn!(worker = %self.id, "[WORKER] {} limit exceeded, relaunching", kind);
            self.relaunch_in_place();
        } else if drained.exited {
            warn!(worker = %self.id, "[WORKER] Worker process died");
            self.backend.kill();
            self.set_state(WorkerState::Stopped);
        } else {
            self.set_state(WorkerState::Idle);
        }
        self.touch();

        OutputSnapshot::finished(drained.fresh, drained.cumulative, artifacts, scratch)
    }

    /// Replace the context without waiting for it; the preamble runs before the next cell.
    fn relaunch_in_place(&mut self) {
        self.backend.kill();
        match self.backend.launch(&self.limits, self.channel.clone()) {
            Ok(()) => {
                self.preamble_pending = self.options.preamble.is_some();
                self.set_state(WorkerState::Idle);
            }
            Err(e) => {
                warn!(worker = %self.id, "[WORKER] Relaunch failed: {}", e);
                self.set_state(WorkerState::Stopped);
            }
        }
    }

    /// Stop the running cell.
    ///
    /// Sends up to `tries` keyboard interrupts, waiting between each. If the
    /// cell is still running afterwards and `escalate` is set, the context is
    /// replaced and session state is lost.
    pub async fn interrupt(&mut self, tries: u32, escalate: bool) -> Result<InterruptOutcome> {
        match self.state() {
            WorkerState::NotStarted => return Err(EngineError::NotStarted),
            WorkerState::Idle | WorkerState::Stopped => return Ok(InterruptOutcome::NotComputing),
            WorkerState::Computing => {}
        }
        self.touch();

        for attempt in 1..=tries.max(1) {
            if !self.channel.is_running() {
                break;
            }
            if let Err(e) = self.backend.request_interrupt() {
                warn!(worker = %self.id, "[WORKER] Interrupt failed: {}", e);
                break;
            }
            if self.channel.wait_finished(self.options.interrupt_wait).await {
                break;
            }
            debug!(worker = %self.id, attempt, "[WORKER] Cell still running after interrupt");
        }

        if !self.channel.is_running() {
            let drained = self.channel.drain();
            let breached = drained.breach.is_some();
            let snapshot = self.conclude(drained);
            self.parked = Some(snapshot);
            let outcome = match self.state() {
                WorkerState::Stopped => InterruptOutcome::Exited,
                _ if breached => InterruptOutcome::Restarted,
                _ => InterruptOutcome::Interrupted,
            };
            info!(worker = %self.id, ?outcome, "[WORKER] Interrupted cell");
            return Ok(outcome);
        }
        if !escalate {
            return Ok(InterruptOutcome::StillRunning);
        }

        warn!(worker = %self.id, "[WORKER] Cell ignored interrupts, restarting worker");
        self.restart_discarding(RESTART_NOTICE).await?;
        Ok(InterruptOutcome::Restarted)
    }

    /// Replace the context with a fresh one, abandoning any running cell
    pub async fn restart(&mut self) -> Result<()> {
        if !self.is_started() {
            return Err(EngineError::NotStarted);
        }
        info!(worker = %self.id, "[WORKER] Restarting");
        self.restart_discarding(RESTART_NOTICE).await
    }

    async fn restart_discarding(&mut self, notice: &str) -> Result<()> {
        self.channel.abort(notice);
        let drained = self.channel.drain();
        self.channel.settle();
        let execution = self.current.take();

        self.backend.kill();
        let booted = self.boot().await;

        if let Some(mut execution) = execution {
            execution.refresh_artifacts();
            let (scratch, artifacts) = execution.into_parts();
            self.parked = Some(OutputSnapshot::finished(
                drained.fresh,
                drained.cumulative,
                artifacts,
                Some(scratch),
            ));
        }

        match booted {
            Ok(()) => {
                self.set_state(WorkerState::Idle);
                self.touch();
                Ok(())
            }
            Err(e) => {
                self.backend.kill();
                self.set_state(WorkerState::Stopped);
                Err(e)
            }
        }
    }

    /// Release the context and all scratch directories. Safe to call repeatedly.
    pub async fn quit(&mut self) -> Result<()> {
        if self.state() == WorkerState::Stopped {
            return Ok(());
        }
        if let Some(execution) = self.current.take() {
            drop(execution.into_parts());
        }
        self.parked = None;
        self.channel.settle();
        self.backend.shutdown().await;
        self.set_state(WorkerState::Stopped);
        info!(worker = %self.id, "[WORKER] Quit");
        Ok(())
    }
}

impl Drop for ExecutionWorker {
    fn drop(&mut self) {
        if let Some(execution) = self.current.take() {
            drop(execution.into_parts());
        }
        self.backend.kill();
    }
}

/// Poll until done, returning the concatenated fresh output and the final snapshot
#[cfg(test)]
pub(crate) async fn poll_until_done(
    worker: &mut ExecutionWorker,
    timeout: Duration,
) -> (String, OutputSnapshot) {
    let deadline = Instant::now() + timeout;
    let mut fresh = String::new();
    loop {
        let snapshot = worker.poll().expect("poll failed");
        fresh.push_str(snapshot.output());
        if snapshot.is_done() {
            return (fresh, snapshot);
        }
        assert!(Instant::now() < deadline, "cell did not finish within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inprocess::toy;

    const DEADLINE: Duration = Duration::from_secs(10);

    fn options(scratch: &std::path::Path) -> WorkerOptions {
        WorkerOptions {
            scratch_root: scratch.to_path_buf(),
            startup_timeout: Duration::from_secs(5),
            interrupt_wait: Duration::from_millis(100),
            monitor_interval: Duration::from_millis(10),
            preamble: None,
            max_output_bytes: 1 << 20,
        }
    }

    fn worker_with(options: WorkerOptions, limits: ResourceLimits) -> ExecutionWorker {
        ExecutionWorker::new(Box::new(toy::backend()), limits, options)
    }

    async fn started(scratch: &std::path::Path) -> ExecutionWorker {
        let mut worker = worker_with(options(scratch), ResourceLimits::unlimited());
        worker.start().await.unwrap();
        worker
    }

    async fn run(worker: &mut ExecutionWorker, code: &str) -> String {
        worker.execute(code).await.unwrap();
        poll_until_done(worker, DEADLINE).await.0
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = worker_with(options(scratch.path()), ResourceLimits::unlimited());
        assert_eq!(worker.state(), WorkerState::NotStarted);
        assert!(matches!(worker.execute("x").await, Err(EngineError::NotStarted)));
        assert!(matches!(worker.poll(), Err(EngineError::NotStarted)));
        assert!(matches!(worker.interrupt(1, false).await, Err(EngineError::NotStarted)));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        run(&mut worker, "let a = 1").await;
        worker.start().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(run(&mut worker, "a").await, "1\n");
    }

    #[tokio::test]
    async fn test_execute_and_poll_transitions() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        assert_eq!(worker.state(), WorkerState::Idle);

        worker.execute("print hi").await.unwrap();
        assert_eq!(worker.state(), WorkerState::Computing);
        let (fresh, snapshot) = poll_until_done(&mut worker, DEADLINE).await;
        assert_eq!(fresh, "hi\n");
        assert_eq!(snapshot.cumulative(), "hi\n");
        assert!(snapshot.scratch_dir().is_some());
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_execute_while_computing_is_rejected() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        worker.execute("sleep 200\nprint first").await.unwrap();
        assert!(matches!(
            worker.execute("print second").await,
            Err(EngineError::AlreadyComputing)
        ));
        let (fresh, _) = poll_until_done(&mut worker, DEADLINE).await;
        assert_eq!(fresh, "first\n");
    }

    #[tokio::test]
    async fn test_fresh_output_concatenates_to_cumulative() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        worker.execute("emit 40").await.unwrap();

        let mut polls = 0;
        let mut fresh = String::new();
        let snapshot = loop {
            let snapshot = worker.poll().unwrap();
            polls += 1;
            fresh.push_str(snapshot.output());
            if snapshot.is_done() {
                break snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let expected: String = (0..40).map(|i| format!("line {i}\n")).collect();
        assert_eq!(fresh, expected);
        assert_eq!(snapshot.cumulative(), expected);
        assert!(polls > 1);
    }

    #[tokio::test]
    async fn test_done_is_reported_once() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        run(&mut worker, "print once").await;

        let after = worker.poll().unwrap();
        assert!(after.is_done());
        assert_eq!(after.output(), "");
        assert_eq!(after.cumulative(), "");
        assert!(after.scratch_dir().is_none());
    }

    #[tokio::test]
    async fn test_running_snapshots_have_no_scratch_dir() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        worker.execute("sleep 200").await.unwrap();
        let snapshot = worker.poll().unwrap();
        assert!(!snapshot.is_done());
        assert!(snapshot.scratch_dir().is_none());
        poll_until_done(&mut worker, DEADLINE).await;
    }

    #[tokio::test]
    async fn test_artifacts_are_append_only() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        worker
            .execute("file b.txt\nsleep 300\nfile a.txt")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let early = worker.poll().unwrap();
        assert!(!early.is_done());
        assert_eq!(early.filenames(), ["b.txt"]);

        let (_, done) = poll_until_done(&mut worker, DEADLINE).await;
        assert_eq!(done.filenames(), ["b.txt", "a.txt"]);
        let dir = done.scratch_dir().unwrap().to_path_buf();
        assert!(dir.join("a.txt").exists());

        drop(done);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_interrupt_when_idle() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        let outcome = worker.interrupt(3, true).await.unwrap();
        assert_eq!(outcome, InterruptOutcome::NotComputing);
        assert!(outcome.stopped());
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_cooperative_interrupt_keeps_session() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        run(&mut worker, "let k = 1").await;

        worker.execute("spin").await.unwrap();
        let outcome = worker.interrupt(3, false).await.unwrap();
        assert_eq!(outcome, InterruptOutcome::Interrupted);
        assert_eq!(worker.state(), WorkerState::Idle);

        let (_, snapshot) = poll_until_done(&mut worker, DEADLINE).await;
        assert_eq!(snapshot.cumulative(), "KeyboardInterrupt\n");
        assert_eq!(run(&mut worker, "k").await, "1\n");
    }

    #[tokio::test]
    async fn test_interrupt_without_escalation_leaves_cell_running() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        worker.execute("stubborn").await.unwrap();

        let outcome = worker.interrupt(2, false).await.unwrap();
        assert_eq!(outcome, InterruptOutcome::StillRunning);
        assert!(!outcome.stopped());
        assert_eq!(worker.state(), WorkerState::Computing);

        worker.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_escalated_interrupt_restarts_session() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        run(&mut worker, "let k = 1").await;

        worker.execute("print before\nstubborn").await.unwrap();
        let outcome = worker.interrupt(2, true).await.unwrap();
        assert_eq!(outcome, InterruptOutcome::Restarted);
        assert_eq!(worker.state(), WorkerState::Idle);

        let (_, snapshot) = poll_until_done(&mut worker, DEADLINE).await;
        assert_eq!(snapshot.cumulative(), format!("before\n{RESTART_NOTICE}"));
        assert_eq!(run(&mut worker, "k").await, "NameError: k\n");
    }

    #[tokio::test]
    async fn test_wall_time_breach_relaunches() {
        let scratch = tempfile::tempdir().unwrap();
        let limits = ResourceLimits::builder().max_wall_seconds(0.1).build().unwrap();
        let mut worker = worker_with(options(scratch.path()), limits);
        worker.start().await.unwrap();
        run(&mut worker, "let k = 1").await;

        worker.execute("stubborn").await.unwrap();
        let (_, snapshot) = poll_until_done(&mut worker, DEADLINE).await;
        assert!(snapshot.cumulative().contains("terminated: wall time limit exceeded"));
        assert_eq!(worker.state(), WorkerState::Idle);

        assert_eq!(run(&mut worker, "k").await, "NameError: k\n");
    }

    #[tokio::test]
    async fn test_breach_during_interrupt_reports_restart() {
        let scratch = tempfile::tempdir().unwrap();
        let mut opts = options(scratch.path());
        opts.interrupt_wait = Duration::from_secs(3);
        let limits = ResourceLimits::builder().max_wall_seconds(0.2).build().unwrap();
        let mut worker = worker_with(opts, limits);
        worker.start().await.unwrap();
        run(&mut worker, "let k = 1").await;

        worker.execute("stubborn").await.unwrap();
        let outcome = worker.interrupt(1, false).await.unwrap();
        assert_eq!(outcome, InterruptOutcome::Restarted);
        assert!(outcome.stopped());
        assert_eq!(worker.state(), WorkerState::Idle);

        let (_, snapshot) = poll_until_done(&mut worker, DEADLINE).await;
        assert!(snapshot.cumulative().contains("wall time limit exceeded"));
        assert_eq!(run(&mut worker, "k").await, "NameError: k\n");
    }

    #[tokio::test]
    async fn test_output_is_truncated_at_limit() {
        let scratch = tempfile::tempdir().unwrap();
        let mut opts = options(scratch.path());
        opts.max_output_bytes = 64;
        let mut worker = worker_with(opts, ResourceLimits::unlimited());
        worker.start().await.unwrap();

        worker.execute("emit 50").await.unwrap();
        let mut fresh = String::new();
        let snapshot = loop {
            let snapshot = worker.poll().unwrap();
            fresh.push_str(snapshot.output());
            if snapshot.is_done() {
                break snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let all: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let expected = format!("{}{}", &all[..64], crate::output::TRUNCATED_NOTICE);
        assert_eq!(snapshot.cumulative(), expected);
        assert_eq!(fresh, expected);

        assert_eq!(run(&mut worker, "print small").await, "small\n");
    }

    #[tokio::test]
    async fn test_unusable_scratch_root_is_startup_error() {
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let mut worker = worker_with(
            options(&blocker.path().join("scratch")),
            ResourceLimits::unlimited(),
        );
        assert!(matches!(worker.start().await, Err(EngineError::StartupError(_))));
        assert_eq!(worker.state(), WorkerState::NotStarted);
    }

    #[tokio::test]
    async fn test_quit_is_idempotent() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        worker.execute("spin").await.unwrap();

        worker.quit().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);
        worker.quit().await.unwrap();
        assert_eq!(worker.state(), WorkerState::Stopped);

        assert!(matches!(worker.execute("x").await, Err(EngineError::NotStarted)));
        assert!(worker.poll().unwrap().is_done());
        assert!(worker.start().await.is_err());
    }

    #[tokio::test]
    async fn test_quit_removes_scratch_dirs() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = started(scratch.path()).await;
        worker.execute("file out.txt\nspin").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        worker.quit().await.unwrap();
        let leftover: Vec<_> = std::fs::read_dir(scratch.path()).unwrap().collect();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_preamble_runs_on_start_and_restart() {
        let scratch = tempfile::tempdir().unwrap();
        let mut opts = options(scratch.path());
        opts.preamble = Some("let p = 7\nprint preamble output".into());
        let mut worker = worker_with(opts, ResourceLimits::unlimited());
        worker.start().await.unwrap();

        assert_eq!(run(&mut worker, "p").await, "7\n");
        worker.restart().await.unwrap();
        assert_eq!(run(&mut worker, "p").await, "7\n");
    }

    #[tokio::test]
    async fn test_restart_requires_start() {
        let scratch = tempfile::tempdir().unwrap();
        let mut worker = worker_with(options(scratch.path()), ResourceLimits::unlimited());
        assert!(matches!(worker.restart().await, Err(EngineError::NotStarted)));
    }

    #[test]
    fn test_state_view_round_trips() {
        let view = StateView::new(WorkerState::NotStarted);
        for state in [
            WorkerState::Idle,
            WorkerState::Computing,
            WorkerState::Stopped,
            WorkerState::NotStarted,
        ] {
            view.set(state);
            assert_eq!(view.get(), state);
        }
    }
}
