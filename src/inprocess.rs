//! Execution context that runs an [`Interpreter`] on a blocking thread inside
//! the host process.
//!
//! There is no process boundary. Only wall time is enforced, by abandoning the
//! running cell and starting a fresh interpreter; other limits are accepted
//! and ignored. It exists for embedding interpreters
//! that need no isolation and for exercising the worker state machine.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{LimitKind, ResourceLimits};
use crate::engine::{Backend, BackendCapabilities, Cell, Enforcer};
use crate::errors::{EngineError, Result};
use crate::output::OutputChannel;

/// A persistent interpreter session
pub trait Interpreter: Send + 'static {
    /// Run one cell to completion, writing its output to `io`.
    ///
    /// Long-running code should check [`CellIo::interrupt_requested`] and
    /// return promptly once it is set.
    fn run(&mut self, code: &str, io: &mut CellIo);
}

#[derive(Debug, Default)]
struct CancelFlags {
    interrupt: AtomicBool,
    terminate: AtomicBool,
}

/// A running cell's view of its context
pub struct CellIo {
    channel: Arc<OutputChannel>,
    epoch: u64,
    scratch_dir: PathBuf,
    cancel: Arc<CancelFlags>,
}

impl CellIo {
    pub fn write(&mut self, text: &str) {
        self.channel.push(self.epoch, text);
    }

    /// Working directory for files the cell produces
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn interrupt_requested(&self) -> bool {
        self.cancel.interrupt.load(Ordering::SeqCst) || self.is_terminated()
    }

    /// The context was torn down; nothing the cell does is observed any more
    pub fn is_terminated(&self) -> bool {
        self.cancel.terminate.load(Ordering::SeqCst)
    }
}

struct Session<I> {
    interpreter: Arc<Mutex<I>>,
    channel: Arc<OutputChannel>,
    epoch: u64,
    cancel: Arc<CancelFlags>,
}

pub struct InProcessBackend<I> {
    factory: Box<dyn Fn() -> I + Send + Sync>,
    session: Option<Session<I>>,
}

impl<I: Interpreter> InProcessBackend<I> {
    /// `factory` builds a fresh interpreter for every launch
    pub fn new(factory: impl Fn() -> I + Send + Sync + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            session: None,
        }
    }
}

struct FlagEnforcer {
    cancel: Arc<CancelFlags>,
}

impl Enforcer for FlagEnforcer {
    fn cpu_time(&self) -> Option<Duration> {
        None
    }

    fn terminate(&self) {
        self.cancel.terminate.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl<I: Interpreter> Backend for InProcessBackend<I> {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            name: "in-process".to_string(),
            enforced_limits: vec![LimitKind::WallTime],
            isolated_process: false,
            auto_print: false,
        }
    }

    fn launch(&mut self, limits: &ResourceLimits, channel: Arc<OutputChannel>) -> Result<()> {
        self.kill();
        if limits.configured().iter().any(|k| *k != LimitKind::WallTime) {
            debug!(limits = %limits, "[INPROCESS] Resource limits are not enforced in-process");
        }
        let epoch = channel.attach();
        channel.mark_ready(epoch);
        self.session = Some(Session {
            interpreter: Arc::new(Mutex::new((self.factory)())),
            channel,
            epoch,
            cancel: Arc::new(CancelFlags::default()),
        });
        Ok(())
    }

    async fn submit(&mut self, cell: Cell) -> Result<()> {
        let session = self.session.as_mut().ok_or(EngineError::NotStarted)?;
        session.cancel = Arc::new(CancelFlags::default());

        let interpreter = session.interpreter.clone();
        let mut io = CellIo {
            channel: session.channel.clone(),
            epoch: session.epoch,
            scratch_dir: cell.scratch_dir,
            cancel: session.cancel.clone(),
        };
        let code = cell.code;

        tokio::task::spawn_blocking(move || {
            let mut guard = interpreter
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| guard.run(&code, &mut io)));
            if outcome.is_err() {
                warn!("[INPROCESS] Interpreter panicked while running a cell");
                io.write("\n[interpreter panicked]\n");
            }
            io.channel.finish(io.epoch);
        });
        Ok(())
    }

    fn request_interrupt(&mut self) -> Result<()> {
        let session = self.session.as_ref().ok_or(EngineError::NotStarted)?;
        session.cancel.interrupt.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.terminate.store(true, Ordering::SeqCst);
        }
    }

    fn enforcer(&self) -> Option<Arc<dyn Enforcer>> {
        self.session.as_ref().map(|s| {
            Arc::new(FlagEnforcer {
                cancel: s.cancel.clone(),
            }) as Arc<dyn Enforcer>
        })
    }

    fn is_alive(&mut self) -> bool {
        self.session.is_some()
    }

    async fn shutdown(&mut self) {
        self.kill();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn cell(code: &str, dir: &Path, generation: u64) -> Cell {
        Cell {
            code: code.to_string(),
            scratch_dir: dir.to_path_buf(),
            generation,
        }
    }

    #[tokio::test]
    async fn test_runs_cells_and_reports_output() {
        let scratch = tempfile::tempdir().unwrap();
        let channel = Arc::new(OutputChannel::new());
        let mut backend = toy::backend();
        backend
            .launch(&ResourceLimits::unlimited(), channel.clone())
            .unwrap();
        assert!(channel.is_ready());

        let generation = channel.begin();
        backend
            .submit(cell("let x = 4\nx", scratch.path(), generation))
            .await
            .unwrap();
        assert!(channel.wait_finished(Duration::from_secs(5)).await);
        assert_eq!(channel.drain().cumulative, "4\n");
    }

    #[tokio::test]
    async fn test_interrupt_flag_reaches_cell() {
        let scratch = tempfile::tempdir().unwrap();
        let channel = Arc::new(OutputChannel::new());
        let mut backend = toy::backend();
        backend
            .launch(&ResourceLimits::unlimited(), channel.clone())
            .unwrap();

        let generation = channel.begin();
        backend
            .submit(cell("spin", scratch.path(), generation))
            .await
            .unwrap();
        assert!(!channel.wait_finished(Duration::from_millis(50)).await);

        backend.request_interrupt().unwrap();
        assert!(channel.wait_finished(Duration::from_secs(5)).await);
        assert_eq!(channel.drain().cumulative, "KeyboardInterrupt\n");
    }

    #[tokio::test]
    async fn test_panic_finishes_cell() {
        let scratch = tempfile::tempdir().unwrap();
        let channel = Arc::new(OutputChannel::new());
        let mut backend = toy::backend();
        backend
            .launch(&ResourceLimits::unlimited(), channel.clone())
            .unwrap();

        let generation = channel.begin();
        backend
            .submit(cell("panic", scratch.path(), generation))
            .await
            .unwrap();
        assert!(channel.wait_finished(Duration::from_secs(5)).await);
        assert!(channel.drain().cumulative.contains("interpreter panicked"));
    }

    #[tokio::test]
    async fn test_relaunch_discards_state() {
        let scratch = tempfile::tempdir().unwrap();
        let channel = Arc::new(OutputChannel::new());
        let mut backend = toy::backend();
        let limits = ResourceLimits::unlimited();
        backend.launch(&limits, channel.clone()).unwrap();

        let generation = channel.begin();
        backend
            .submit(cell("let y = 1", scratch.path(), generation))
            .await
            .unwrap();
        assert!(channel.wait_finished(Duration::from_secs(5)).await);

        backend.launch(&limits, channel.clone()).unwrap();
        let generation = channel.begin();
        backend
            .submit(cell("y", scratch.path(), generation))
            .await
            .unwrap();
        assert!(channel.wait_finished(Duration::from_secs(5)).await);
        assert_eq!(channel.drain().cumulative, "NameError: y\n");
    }

    #[tokio::test]
    async fn test_submit_before_launch_fails() {
        let scratch = tempfile::tempdir().unwrap();
        let mut backend = toy::backend();
        let result = backend.submit(cell("x", scratch.path(), 1)).await;
        assert!(matches!(result, Err(EngineError::NotStarted)));
    }
}
