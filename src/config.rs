use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A resource a worker can be capped on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    VirtualMemory,
    CpuTime,
    WallTime,
    Processes,
}

impl LimitKind {
    /// Whether the engine enforces this limit itself rather than the OS
    pub fn is_watchdog_enforced(&self) -> bool {
        matches!(self, LimitKind::CpuTime | LimitKind::WallTime)
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LimitKind::VirtualMemory => "virtual memory",
            LimitKind::CpuTime => "cpu time",
            LimitKind::WallTime => "wall time",
            LimitKind::Processes => "process count",
        };
        f.write_str(name)
    }
}

/// Resource caps applied to one worker process.
///
/// Every field is independently optional; `None` means "no limit". A present
/// field is always strictly positive, which is checked when the value is
/// built or deserialized, so a `ResourceLimits` that exists is valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawLimits")]
pub struct ResourceLimits {
    max_virtual_memory_mb: Option<u64>,
    max_cpu_seconds: Option<f64>,
    max_wall_seconds: Option<f64>,
    max_processes: Option<u64>,
}

/// Unvalidated wire form of [`ResourceLimits`]
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawLimits {
    max_virtual_memory_mb: Option<u64>,
    max_cpu_seconds: Option<f64>,
    max_wall_seconds: Option<f64>,
    max_processes: Option<u64>,
}

impl TryFrom<RawLimits> for ResourceLimits {
    type Error = EngineError;

    fn try_from(raw: RawLimits) -> Result<Self> {
        ResourceLimits::new(
            raw.max_virtual_memory_mb,
            raw.max_cpu_seconds,
            raw.max_wall_seconds,
            raw.max_processes,
        )
    }
}

impl ResourceLimits {
    /// Build validated limits; any present field must be > 0
    pub fn new(
        max_virtual_memory_mb: Option<u64>,
        max_cpu_seconds: Option<f64>,
        max_wall_seconds: Option<f64>,
        max_processes: Option<u64>,
    ) -> Result<Self> {
        check_count("max_virtual_memory_mb", max_virtual_memory_mb)?;
        check_seconds("max_cpu_seconds", max_cpu_seconds)?;
        check_seconds("max_wall_seconds", max_wall_seconds)?;
        check_count("max_processes", max_processes)?;

        Ok(Self {
            max_virtual_memory_mb,
            max_cpu_seconds,
            max_wall_seconds,
            max_processes,
        })
    }

    /// No caps at all
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn builder() -> ResourceLimitsBuilder {
        ResourceLimitsBuilder::default()
    }

    pub fn max_virtual_memory_mb(&self) -> Option<u64> {
        self.max_virtual_memory_mb
    }

    /// Virtual memory cap in bytes, saturating on overflow
    pub fn max_virtual_memory_bytes(&self) -> Option<u64> {
        self.max_virtual_memory_mb
            .map(|mb| mb.saturating_mul(1024 * 1024))
    }

    pub fn max_cpu_seconds(&self) -> Option<f64> {
        self.max_cpu_seconds
    }

    pub fn max_wall_seconds(&self) -> Option<f64> {
        self.max_wall_seconds
    }

    pub fn max_processes(&self) -> Option<u64> {
        self.max_processes
    }

    pub fn max_cpu_time(&self) -> Option<Duration> {
        self.max_cpu_seconds.map(Duration::from_secs_f64)
    }

    pub fn max_wall_time(&self) -> Option<Duration> {
        self.max_wall_seconds.map(Duration::from_secs_f64)
    }

    /// Whether a watchdog is needed to enforce these limits
    pub fn needs_watchdog(&self) -> bool {
        self.max_cpu_seconds.is_some() || self.max_wall_seconds.is_some()
    }

    /// The kinds of limit that are actually set
    pub fn configured(&self) -> Vec<LimitKind> {
        let mut kinds = Vec::new();
        if self.max_virtual_memory_mb.is_some() {
            kinds.push(LimitKind::VirtualMemory);
        }
        if self.max_cpu_seconds.is_some() {
            kinds.push(LimitKind::CpuTime);
        }
        if self.max_wall_seconds.is_some() {
            kinds.push(LimitKind::WallTime);
        }
        if self.max_processes.is_some() {
            kinds.push(LimitKind::Processes);
        }
        kinds
    }
}

impl fmt::Display for ResourceLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show<T: fmt::Display>(v: Option<T>, unit: &str) -> String {
            v.map(|v| format!("{v}{unit}"))
                .unwrap_or_else(|| "unlimited".to_string())
        }
        write!(
            f,
            "vmem={} cpu={} wall={} processes={}",
            show(self.max_virtual_memory_mb, "MB"),
            show(self.max_cpu_seconds, "s"),
            show(self.max_wall_seconds, "s"),
            show(self.max_processes, ""),
        )
    }
}

fn check_count(field: &str, value: Option<u64>) -> Result<()> {
    match value {
        Some(0) => Err(EngineError::InvalidConfiguration(format!(
            "{field} must be greater than zero"
        ))),
        _ => Ok(()),
    }
}

fn check_seconds(field: &str, value: Option<f64>) -> Result<()> {
    let Some(v) = value else { return Ok(()) };
    if !v.is_finite() || v <= 0.0 {
        return Err(EngineError::InvalidConfiguration(format!(
            "{field} must be a positive number of seconds, got {v}"
        )));
    }
    if Duration::try_from_secs_f64(v).is_err() {
        return Err(EngineError::InvalidConfiguration(format!(
            "{field} is out of range: {v}"
        )));
    }
    Ok(())
}

/// Builder for [`ResourceLimits`]; validation happens in [`build`](Self::build)
#[derive(Debug, Clone, Default)]
pub struct ResourceLimitsBuilder {
    max_virtual_memory_mb: Option<u64>,
    max_cpu_seconds: Option<f64>,
    max_wall_seconds: Option<f64>,
    max_processes: Option<u64>,
}

impl ResourceLimitsBuilder {
    pub fn max_virtual_memory_mb(mut self, mb: u64) -> Self {
        self.max_virtual_memory_mb = Some(mb);
        self
    }

    pub fn max_cpu_seconds(mut self, seconds: f64) -> Self {
        self.max_cpu_seconds = Some(seconds);
        self
    }

    pub fn max_wall_seconds(mut self, seconds: f64) -> Self {
        self.max_wall_seconds = Some(seconds);
        self
    }

    pub fn max_processes(mut self, count: u64) -> Self {
        self.max_processes = Some(count);
        self
    }

    pub fn build(self) -> Result<ResourceLimits> {
        ResourceLimits::new(
            self.max_virtual_memory_mb,
            self.max_cpu_seconds,
            self.max_wall_seconds,
            self.max_processes,
        )
    }
}

/// Engine-wide settings shared by every worker the supervisor creates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interpreter used by the process backend; `None` searches PATH
    pub python_path: Option<PathBuf>,
    /// Base directory for per-execution scratch directories
    pub scratch_root: PathBuf,
    /// How long a new worker may take to report readiness
    pub startup_timeout_ms: u64,
    /// How long each interrupt attempt waits for the cell to stop
    pub interrupt_wait_ms: u64,
    /// Watchdog sampling period for cpu/wall limits
    pub monitor_interval_ms: u64,
    /// Grace period between closing a worker's input and killing it
    pub shutdown_grace_ms: u64,
    /// Limits for workers started without explicit limits
    pub default_limits: ResourceLimits,
    /// Code run once after every (re)start, output discarded
    pub preamble: Option<String>,
    /// Workers idle longer than this are reaped by `quit_idle`
    pub idle_timeout_secs: Option<u64>,
    /// Output kept per execution; anything past it is dropped
    pub max_output_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            python_path: None,
            scratch_root: std::env::temp_dir().join("nbworker-scratch"),
            startup_timeout_ms: 10_000,
            interrupt_wait_ms: 500,
            monitor_interval_ms: 100,
            shutdown_grace_ms: 1_000,
            default_limits: ResourceLimits::default(),
            preamble: None,
            idle_timeout_secs: None,
            max_output_bytes: 8 * 1024 * 1024,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `NBWORKER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(path) = get("NBWORKER_PYTHON") {
            config.python_path = Some(PathBuf::from(path));
        }
        if let Some(root) = get("NBWORKER_SCRATCH_ROOT") {
            config.scratch_root = PathBuf::from(root);
        }
        if let Some(v) = get("NBWORKER_STARTUP_TIMEOUT_MS") {
            config.startup_timeout_ms = parse_env("NBWORKER_STARTUP_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("NBWORKER_INTERRUPT_WAIT_MS") {
            config.interrupt_wait_ms = parse_env("NBWORKER_INTERRUPT_WAIT_MS", &v)?;
        }
        if let Some(v) = get("NBWORKER_IDLE_TIMEOUT_SECS") {
            config.idle_timeout_secs = Some(parse_env("NBWORKER_IDLE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = get("NBWORKER_MAX_OUTPUT_BYTES") {
            config.max_output_bytes = parse_env("NBWORKER_MAX_OUTPUT_BYTES", &v)?;
        }
        if let Some(code) = get("NBWORKER_PREAMBLE") {
            config.preamble = Some(code);
        }

        let vmem = get("NBWORKER_MAX_VMEM_MB")
            .map(|v| parse_env("NBWORKER_MAX_VMEM_MB", &v))
            .transpose()?;
        let cpu = get("NBWORKER_MAX_CPU_SECONDS")
            .map(|v| parse_env("NBWORKER_MAX_CPU_SECONDS", &v))
            .transpose()?;
        let wall = get("NBWORKER_MAX_WALL_SECONDS")
            .map(|v| parse_env("NBWORKER_MAX_WALL_SECONDS", &v))
            .transpose()?;
        let procs = get("NBWORKER_MAX_PROCESSES")
            .map(|v| parse_env("NBWORKER_MAX_PROCESSES", &v))
            .transpose()?;
        config.default_limits = ResourceLimits::new(vmem, cpu, wall, procs)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("startup_timeout_ms", self.startup_timeout_ms),
            ("interrupt_wait_ms", self.interrupt_wait_ms),
            ("monitor_interval_ms", self.monitor_interval_ms),
            ("max_output_bytes", self.max_output_bytes),
        ] {
            if value == 0 {
                return Err(EngineError::InvalidConfiguration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.idle_timeout_secs == Some(0) {
            return Err(EngineError::InvalidConfiguration(
                "idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Interpreter to launch: the configured path, else python3/python on PATH
    pub fn resolve_python(&self) -> Result<PathBuf> {
        match &self.python_path {
            Some(path) if path.exists() => Ok(path.clone()),
            Some(path) => which::which(path).map_err(|_| EngineError::PythonNotFound),
            None => which::which("python3")
                .or_else(|_| which::which("python"))
                .map_err(|_| EngineError::PythonNotFound),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn interrupt_wait(&self) -> Duration {
        Duration::from_millis(self.interrupt_wait_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn max_output_bytes(&self) -> usize {
        usize::try_from(self.max_output_bytes).unwrap_or(usize::MAX)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        EngineError::InvalidConfiguration(format!("{key} has an invalid value: {value:?}"))
    })
}
