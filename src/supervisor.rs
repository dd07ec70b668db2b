//! Registry of workers, one per worksheet.
//!
//! Each worksheet's worker sits behind its own async lock, so operations on
//! one worksheet are serialized without holding up any other. Callers address
//! workers through a [`WorkerHandle`]; a handle outlives the worker it was
//! issued for only as a stale token that is rejected with `NotStarted`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{EngineConfig, ResourceLimits};
use crate::engine::{Backend, BackendCapabilities};
use crate::errors::{EngineError, Result};
use crate::output::OutputChannel;
use crate::snapshot::OutputSnapshot;
use crate::worker::{ExecutionWorker, InterruptOutcome, StateView, WorkerOptions, WorkerState};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorksheetId(String);

impl WorksheetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorksheetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for WorksheetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for WorksheetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one worker incarnation for one worksheet
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub worksheet: WorksheetId,
    pub session: Uuid,
}

/// Builds the execution context for each new worker
pub trait BackendFactory: Send + Sync {
    fn create(&self, config: &EngineConfig) -> Result<Box<dyn Backend>>;
}

impl<F> BackendFactory for F
where
    F: Fn(&EngineConfig) -> Result<Box<dyn Backend>> + Send + Sync,
{
    fn create(&self, config: &EngineConfig) -> Result<Box<dyn Backend>> {
        self(config)
    }
}

/// Persistent Python subprocess per worker
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativePythonFactory;

#[cfg(unix)]
impl BackendFactory for NativePythonFactory {
    fn create(&self, config: &EngineConfig) -> Result<Box<dyn Backend>> {
        Ok(Box::new(crate::native::NativePythonBackend::from_config(
            config,
        )?))
    }
}

#[derive(Clone)]
struct Slot {
    worker: Arc<tokio::sync::Mutex<ExecutionWorker>>,
    state: StateView,
    channel: Arc<OutputChannel>,
    session: Uuid,
}

impl Slot {
    fn new(worker: ExecutionWorker) -> Self {
        Self {
            state: worker.state_view(),
            channel: worker.channel(),
            session: worker.id(),
            worker: Arc::new(tokio::sync::Mutex::new(worker)),
        }
    }

    fn handle(&self, worksheet: WorksheetId) -> WorkerHandle {
        WorkerHandle {
            worksheet,
            session: self.session,
        }
    }
}

pub struct WorkerSupervisor {
    config: EngineConfig,
    factory: Box<dyn BackendFactory>,
    slots: Mutex<HashMap<WorksheetId, Slot>>,
}

impl WorkerSupervisor {
    pub fn new(config: EngineConfig, factory: impl BackendFactory + 'static) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.scratch_root)?;
        Ok(Self {
            config,
            factory: Box::new(factory),
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Supervisor whose workers run python subprocesses
    #[cfg(unix)]
    pub fn native(config: EngineConfig) -> Result<Self> {
        // Fail early rather than on the first start
        config.resolve_python()?;
        Self::new(config, NativePythonFactory)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<WorksheetId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, handle: &WorkerHandle) -> Result<Slot> {
        self.lock_slots()
            .get(&handle.worksheet)
            .filter(|slot| slot.session == handle.session)
            .cloned()
            .ok_or(EngineError::NotStarted)
    }

    /// Start the worksheet's worker if it is not already running.
    ///
    /// `limits` applies only when a worker is actually launched; otherwise the
    /// engine default is used. A stopped worker is replaced by a new one.
    pub async fn start(
        &self,
        worksheet: impl Into<WorksheetId>,
        limits: Option<ResourceLimits>,
    ) -> Result<WorkerHandle> {
        let worksheet = worksheet.into();
        let slot = {
            let mut slots = self.lock_slots();
            match slots.get(&worksheet) {
                Some(slot) if slot.state.get() != WorkerState::Stopped => slot.clone(),
                _ => {
                    let backend = self.factory.create(&self.config)?;
                    let worker = ExecutionWorker::new(
                        backend,
                        limits.unwrap_or(self.config.default_limits),
                        WorkerOptions::from(&self.config),
                    );
                    let slot = Slot::new(worker);
                    slots.insert(worksheet.clone(), slot.clone());
                    slot
                }
            }
        };

        let mut worker = slot.worker.lock().await;
        if !worker.is_started() {
            if let Some(limits) = limits {
                worker.set_limits(limits);
            }
            worker.start().await?;
            info!(worksheet = %worksheet, session = %slot.session, "[SUPERVISOR] Worker started");
        }
        Ok(slot.handle(worksheet))
    }

    pub async fn execute(&self, handle: &WorkerHandle, code: &str) -> Result<()> {
        let slot = self.slot(handle)?;
        let mut worker = slot.worker.lock().await;
        worker.execute(code).await
    }

    /// Never waits: if another operation holds the worker, reports the
    /// cumulative output so far with nothing consumed.
    pub fn poll(&self, handle: &WorkerHandle) -> Result<OutputSnapshot> {
        let slot = self.slot(handle)?;
        let snapshot = match slot.worker.try_lock() {
            Ok(mut worker) => worker.poll()?,
            Err(_) => {
                debug!(worksheet = %handle.worksheet, "[SUPERVISOR] Worker busy, poll skipped");
                OutputSnapshot::running(String::new(), slot.channel.peek_cumulative(), Vec::new())
            }
        };
        Ok(snapshot)
    }

    /// True once nothing is running any more
    pub async fn interrupt(&self, handle: &WorkerHandle, tries: u32, escalate: bool) -> Result<bool> {
        Ok(self
            .interrupt_with_outcome(handle, tries, escalate)
            .await?
            .stopped())
    }

    pub async fn interrupt_with_outcome(
        &self,
        handle: &WorkerHandle,
        tries: u32,
        escalate: bool,
    ) -> Result<InterruptOutcome> {
        let slot = self.slot(handle)?;
        let mut worker = slot.worker.lock().await;
        worker.interrupt(tries, escalate).await
    }

    /// Fresh context for the worksheet; session state is lost
    pub async fn restart(&self, handle: &WorkerHandle) -> Result<()> {
        let slot = self.slot(handle)?;
        let mut worker = slot.worker.lock().await;
        worker.restart().await
    }

    /// Stop and forget the worker. Unknown or stale handles are ignored.
    pub async fn quit(&self, handle: &WorkerHandle) -> Result<()> {
        let slot = {
            let mut slots = self.lock_slots();
            match slots.get(&handle.worksheet) {
                Some(slot) if slot.session == handle.session => slots.remove(&handle.worksheet),
                _ => None,
            }
        };
        if let Some(slot) = slot {
            slot.worker.lock().await.quit().await?;
            info!(worksheet = %handle.worksheet, "[SUPERVISOR] Worker quit");
        }
        Ok(())
    }

    /// Takes effect the next time the worker's context is launched
    pub async fn set_limits(&self, handle: &WorkerHandle, limits: ResourceLimits) -> Result<()> {
        let slot = self.slot(handle)?;
        slot.worker.lock().await.set_limits(limits);
        Ok(())
    }

    pub async fn limits(&self, handle: &WorkerHandle) -> Result<ResourceLimits> {
        let slot = self.slot(handle)?;
        let worker = slot.worker.lock().await;
        Ok(*worker.limits())
    }

    pub async fn capabilities(&self, handle: &WorkerHandle) -> Result<BackendCapabilities> {
        let slot = self.slot(handle)?;
        let worker = slot.worker.lock().await;
        Ok(worker.capabilities())
    }

    /// Never waits on the worker
    pub fn is_computing(&self, handle: &WorkerHandle) -> bool {
        self.state(handle) == Some(WorkerState::Computing)
    }

    /// Never waits on the worker
    pub fn is_started(&self, handle: &WorkerHandle) -> bool {
        self.state(handle).is_some_and(|s| s.is_started())
    }

    pub fn state(&self, handle: &WorkerHandle) -> Option<WorkerState> {
        self.slot(handle).ok().map(|slot| slot.state.get())
    }

    /// Every known worksheet and its worker's state
    pub fn worksheets(&self) -> Vec<(WorksheetId, WorkerState)> {
        let mut all: Vec<_> = self
            .lock_slots()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.state.get()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Quit every worker untouched for longer than `timeout`, computing or
    /// not. Workers busy with another operation are skipped.
    pub async fn quit_idle(&self, timeout: Duration) -> Vec<WorksheetId> {
        let candidates: Vec<(WorksheetId, Slot)> = self
            .lock_slots()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut reaped = Vec::new();
        for (worksheet, slot) in candidates {
            let Ok(mut worker) = slot.worker.try_lock() else {
                continue;
            };
            if !worker.is_started() || worker.idle_for() < timeout {
                continue;
            }
            info!(worksheet = %worksheet, idle = ?worker.idle_for(), "[SUPERVISOR] Reaping idle worker");
            // Only fails for usage errors, which cannot happen here
            let _ = worker.quit().await;
            drop(worker);

            let mut slots = self.lock_slots();
            if slots.get(&worksheet).is_some_and(|s| s.session == slot.session) {
                slots.remove(&worksheet);
            }
            reaped.push(worksheet);
        }
        reaped
    }

    /// Reap with the configured idle timeout, if any
    pub async fn quit_idle_configured(&self) -> Vec<WorksheetId> {
        match self.config.idle_timeout() {
            Some(timeout) => self.quit_idle(timeout).await,
            None => Vec::new(),
        }
    }

    pub async fn quit_all(&self) {
        let slots: Vec<(WorksheetId, Slot)> = self.lock_slots().drain().collect();
        for (worksheet, slot) in slots {
            let _ = slot.worker.lock().await.quit().await;
            debug!(worksheet = %worksheet, "[SUPERVISOR] Worker quit");
        }
    }
}
