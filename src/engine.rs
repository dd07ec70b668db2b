use crate::config::{LimitKind, ResourceLimits};
use crate::errors::Result;
use crate::output::OutputChannel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One block of code handed to an execution context
#[derive(Debug, Clone)]
pub struct Cell {
    /// Source as the user submitted it; backends apply their own rewrites
    pub code: String,
    /// Working directory for the run; artifacts are collected from here
    pub scratch_dir: PathBuf,
    /// Execution generation from the output channel
    pub generation: u64,
}

/// What a backend can and cannot do
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// Backend name
    pub name: String,
    /// Limit kinds this backend actually enforces; others are accepted and ignored
    pub enforced_limits: Vec<LimitKind>,
    /// Whether each context runs in its own OS process
    pub isolated_process: bool,
    /// Whether trailing expressions are echoed
    pub auto_print: bool,
}

impl BackendCapabilities {
    pub fn enforces(&self, kind: LimitKind) -> bool {
        self.enforced_limits.contains(&kind)
    }
}

/// Handle the watchdog uses to measure and stop a running context
pub trait Enforcer: Send + Sync {
    /// CPU time consumed by the context, when the platform can tell
    fn cpu_time(&self) -> Option<Duration>;

    /// Forcibly stop the context. Safe to call more than once.
    fn terminate(&self);
}

/// An execution context: a persistent interpreter session that runs cells
/// one at a time and reports through an [`OutputChannel`].
#[async_trait]
pub trait Backend: Send {
    /// Get backend capabilities
    fn capabilities(&self) -> BackendCapabilities;

    /// Allocate a fresh context, discarding any previous one.
    ///
    /// Must not block: readiness is reported later through the channel.
    fn launch(&mut self, limits: &ResourceLimits, channel: Arc<OutputChannel>) -> Result<()>;

    /// Start running a cell; returns once the context has accepted it
    async fn submit(&mut self, cell: Cell) -> Result<()>;

    /// Ask the running cell to stop, the way a keyboard interrupt would
    fn request_interrupt(&mut self) -> Result<()>;

    /// Hard stop, releasing the context immediately
    fn kill(&mut self);

    /// Measurement and termination handle for the current context
    fn enforcer(&self) -> Option<Arc<dyn Enforcer>>;

    /// Whether a context is currently allocated and running
    fn is_alive(&mut self) -> bool;

    /// Graceful stop, falling back to [`Backend::kill`]
    async fn shutdown(&mut self);
}
