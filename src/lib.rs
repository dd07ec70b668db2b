//! Sandboxed execution engine for notebook worksheets.
//!
//! Every worksheet gets its own [`ExecutionWorker`]: a persistent interpreter
//! context whose namespace survives from one cell to the next. Cells run in
//! the background; callers [`poll`](WorkerSupervisor::poll) for incremental
//! output, interrupt runaway code, and quit the worker when the worksheet
//! session ends.
//!
//! ```no_run
//! use std::time::Duration;
//! use nbworker::{EngineConfig, WorkerSupervisor};
//!
//! # async fn demo() -> nbworker::Result<()> {
//! let supervisor = WorkerSupervisor::native(EngineConfig::from_env()?)?;
//! let handle = supervisor.start("worksheet-1", None).await?;
//!
//! supervisor.execute(&handle, "x = 2\nx + 2").await?;
//! loop {
//!     let snapshot = supervisor.poll(&handle)?;
//!     print!("{}", snapshot.output());
//!     if snapshot.is_done() {
//!         break;
//!     }
//!     tokio::time::sleep(Duration::from_millis(50)).await;
//! }
//!
//! supervisor.quit(&handle).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod errors;
pub mod inprocess;
mod monitor;
#[cfg(unix)]
pub mod native;
pub mod output;
pub mod snapshot;
pub mod supervisor;
pub mod transform;
pub mod worker;

pub use config::{EngineConfig, LimitKind, ResourceLimits, ResourceLimitsBuilder};
pub use engine::{Backend, BackendCapabilities, Cell, Enforcer};
pub use errors::{EngineError, Result};
pub use inprocess::{CellIo, InProcessBackend, Interpreter};
#[cfg(unix)]
pub use native::NativePythonBackend;
pub use output::OutputChannel;
pub use snapshot::{OutputSnapshot, ScratchDir};
#[cfg(unix)]
pub use supervisor::NativePythonFactory;
pub use supervisor::{BackendFactory, WorkerHandle, WorkerSupervisor, WorksheetId};
pub use transform::{auto_print, AutoPrint};
pub use worker::{ExecutionWorker, InterruptOutcome, StateView, WorkerOptions, WorkerState};
