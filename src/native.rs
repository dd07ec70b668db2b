use crate::{
    config::{EngineConfig, LimitKind, ResourceLimits},
    engine::{Backend, BackendCapabilities, Cell, Enforcer},
    errors::{EngineError, Result},
    output::{MarkerScanner, OutputChannel, ScanEvent},
    transform::{self, AutoPrint},
};
use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Driver loop run inside the worker process.
///
/// Requests arrive as JSON lines on a private copy of stdin; the cell itself
/// sees an empty stdin. stderr is folded into stdout so the worker observes a
/// single ordered stream. Completion is signalled with in-band markers taken
/// from the environment, which the driver removes before any user code runs.
///
/// SIGINT only raises `KeyboardInterrupt` while a cell is executing. One that
/// arrives while a request is being read is held and raised as the cell
/// starts; one left over once a cell has finished is dropped.
const DRIVER: &str = r#"
import ast, json, os, signal, sys, traceback, warnings

_ready = os.environ.pop("NBWORKER_READY_MARKER")
_done = os.environ.pop("NBWORKER_DONE_MARKER")

_requests = os.fdopen(os.dup(0), "r", encoding="utf-8")
_null = open(os.devnull, "r")
os.dup2(_null.fileno(), 0)
sys.stdin = _null
os.dup2(1, 2)
sys.stderr = sys.stdout

_namespace = {"__name__": "__main__", "__builtins__": __builtins__}
_armed = False
_held = False

def _on_sigint(signum, frame):
    global _held
    if _armed:
        raise KeyboardInterrupt
    _held = True

def _emit(marker):
    sys.stdout.write(marker)
    sys.stdout.flush()

def _finish():
    global _held
    sys.stdout.flush()
    _emit(_done)
    _held = False
    signal.signal(signal.SIGINT, _on_sigint)

def _is_expression(source):
    try:
        with warnings.catch_warnings():
            warnings.simplefilter("ignore")
            compile(source + "\n", "<cell>", "single")
            tree = ast.parse(source + "\n", mode="single")
    except Exception:
        return False
    return len(tree.body) == 1 and isinstance(tree.body[0], ast.Expr)

def _run(code):
    global _armed, _held
    try:
        try:
            _armed = True
            if _held:
                _held = False
                raise KeyboardInterrupt
            exec(compile(code, "<cell>", "exec"), _namespace)
        finally:
            _armed = False
    except SystemExit:
        return False
    except BaseException:
        etype, value, tb = sys.exc_info()
        traceback.print_exception(etype, value, tb.tb_next if tb else None)
    return True

def _handle(line):
    try:
        request = json.loads(line)
        code = request["code"]
        cwd = request["cwd"]
        display = request.get("display")
    except Exception as exc:
        print("[malformed request: %s]" % exc)
        _finish()
        return True
    try:
        os.chdir(cwd)
    except OSError as exc:
        print("[cannot enter scratch dir: %s]" % exc)
    if display and _is_expression(display["candidate"]):
        code = display["rewritten"]
    if not _run(code):
        return False
    _finish()
    return True

signal.signal(signal.SIGINT, _on_sigint)
_emit(_ready)
while True:
    line = _requests.readline()
    if not line or not _handle(line):
        break
"#;

const READY_MARKER: usize = 0;

struct Markers {
    ready: String,
    done: String,
}

impl Markers {
    /// Fresh per launch so user output cannot forge them
    fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple();
        Self {
            ready: format!("\u{1e}nbworker-ready-{id}\u{1e}"),
            done: format!("\u{1e}nbworker-done-{id}\u{1e}"),
        }
    }
}

#[derive(Serialize)]
struct DriverRequest<'a> {
    code: &'a str,
    cwd: &'a Path,
    /// Applied by the driver only if its parser accepts the candidate
    display: Option<AutoPrint>,
}

struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    pid: u32,
    reader: JoinHandle<()>,
    stderr_logger: JoinHandle<()>,
}

/// Execution context backed by a persistent Python subprocess.
///
/// Resource limits are applied with `setrlimit` in the child before exec; the
/// child also leads its own process group so a forced stop reaches anything
/// it spawned.
pub struct NativePythonBackend {
    python_path: PathBuf,
    shutdown_grace: Duration,
    process: Option<WorkerProcess>,
}

impl NativePythonBackend {
    /// Create a backend using python3 (or python) from PATH
    pub fn new() -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| EngineError::PythonNotFound)?;
        Ok(Self::with_resolved_path(python_path))
    }

    /// Create with an explicit interpreter path (for bundled Python)
    pub fn with_python_path(python_path: PathBuf) -> Result<Self> {
        if !python_path.exists() {
            return Err(EngineError::PythonNotFound);
        }
        Ok(Self::with_resolved_path(python_path))
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut backend = Self::with_resolved_path(config.resolve_python()?);
        backend.shutdown_grace = config.shutdown_grace();
        Ok(backend)
    }

    fn with_resolved_path(python_path: PathBuf) -> Self {
        Self {
            python_path,
            shutdown_grace: Duration::from_secs(1),
            process: None,
        }
    }

    /// Get the Python executable path being used
    pub fn python_path(&self) -> &Path {
        &self.python_path
    }

    /// OS pid of the current worker process
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    fn build_command(&self, markers: &Markers) -> Command {
        let mut cmd = Command::new(&self.python_path);
        cmd.arg("-u")
            .arg("-c")
            .arg(DRIVER)
            .env("NBWORKER_READY_MARKER", &markers.ready)
            .env("NBWORKER_DONE_MARKER", &markers.done)
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONUNBUFFERED", "1")
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Backend for NativePythonBackend {
    fn capabilities(&self) -> BackendCapabilities {
        let mut enforced_limits = vec![LimitKind::WallTime];
        if cfg!(not(target_os = "macos")) {
            enforced_limits.push(LimitKind::VirtualMemory);
            enforced_limits.push(LimitKind::Processes);
        }
        if cfg!(target_os = "linux") {
            enforced_limits.push(LimitKind::CpuTime);
        }
        BackendCapabilities {
            name: "native-python".to_string(),
            enforced_limits,
            isolated_process: true,
            auto_print: true,
        }
    }

    fn launch(&mut self, limits: &ResourceLimits, channel: Arc<OutputChannel>) -> Result<()> {
        self.kill();

        let epoch = channel.attach();
        let markers = Markers::generate();
        let mut cmd = self.build_command(&markers);
        apply_resource_limits(&mut cmd, limits);

        let mut child = cmd.spawn().map_err(|e| {
            EngineError::StartupError(format!("failed to spawn {:?}: {}", self.python_path, e))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| EngineError::StartupError("worker exited during spawn".into()))?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(EngineError::StartupError("worker pipes unavailable".into()));
        };

        let reader = tokio::spawn(pump_stdout(stdout, markers, channel, epoch));
        let stderr_logger = tokio::spawn(log_stderr(stderr, pid));

        info!(pid, limits = %limits, "[WORKER] Launched python worker {:?}", self.python_path);
        self.process = Some(WorkerProcess {
            child,
            stdin,
            pid,
            reader,
            stderr_logger,
        });
        Ok(())
    }

    async fn submit(&mut self, cell: Cell) -> Result<()> {
        let process = self.process.as_mut().ok_or(EngineError::NotStarted)?;
        let mut line = serde_json::to_vec(&DriverRequest {
            code: &cell.code,
            cwd: &cell.scratch_dir,
            display: transform::plan(&cell.code),
        })?;
        line.push(b'\n');
        process.stdin.write_all(&line).await?;
        process.stdin.flush().await?;
        debug!(pid = process.pid, generation = cell.generation, "[WORKER] Submitted cell");
        Ok(())
    }

    fn request_interrupt(&mut self) -> Result<()> {
        let process = self.process.as_ref().ok_or(EngineError::NotStarted)?;
        signal::kill(Pid::from_raw(process.pid as i32), Signal::SIGINT).map_err(|e| {
            EngineError::InternalError(format!("failed to interrupt worker {}: {}", process.pid, e))
        })
    }

    fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            signal_group(process.pid, Signal::SIGKILL);
            let _ = process.child.start_kill();
            process.reader.abort();
            process.stderr_logger.abort();
            info!(pid = process.pid, "[WORKER] Killed python worker");
        }
    }

    fn enforcer(&self) -> Option<Arc<dyn Enforcer>> {
        self.process
            .as_ref()
            .map(|p| Arc::new(ProcessEnforcer { pid: p.pid }) as Arc<dyn Enforcer>)
    }

    fn is_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    async fn shutdown(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        // Closing stdin ends the driver loop
        drop(process.stdin);
        match tokio::time::timeout(self.shutdown_grace, process.child.wait()).await {
            Ok(Ok(status)) => info!(pid = process.pid, %status, "[WORKER] Python worker exited"),
            _ => {
                warn!(pid = process.pid, "[WORKER] Worker ignored shutdown, killing");
                let _ = process.child.start_kill();
                let _ = process.child.wait().await;
            }
        }
        signal_group(process.pid, Signal::SIGKILL);
        process.reader.abort();
        process.stderr_logger.abort();
    }
}

impl Drop for NativePythonBackend {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn pump_stdout(
    mut stdout: ChildStdout,
    markers: Markers,
    channel: Arc<OutputChannel>,
    epoch: u64,
) {
    let mut scanner = MarkerScanner::new([markers.ready, markers.done]);
    let mut buf = vec![0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for event in scanner.feed(&buf[..n]) {
                    match event {
                        ScanEvent::Text(text) => {
                            channel.push(epoch, &text);
                        }
                        ScanEvent::Marker(READY_MARKER) => channel.mark_ready(epoch),
                        ScanEvent::Marker(_) => channel.finish(epoch),
                    }
                }
            }
            Err(e) => {
                warn!("[WORKER] Failed reading worker output: {}", e);
                break;
            }
        }
    }
    if let Some(rest) = scanner.flush() {
        channel.push(epoch, &rest);
    }
    channel.close(epoch);
}

async fn log_stderr(stderr: ChildStderr, pid: u32) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(pid, "[WORKER] stderr: {}", line);
    }
}

fn signal_group(pid: u32, sig: Signal) {
    match signal::killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pid, "[WORKER] Failed to signal process group: {}", e),
    }
}

struct ProcessEnforcer {
    pid: u32,
}

impl Enforcer for ProcessEnforcer {
    fn cpu_time(&self) -> Option<Duration> {
        process_cpu_time(self.pid)
    }

    fn terminate(&self) {
        signal_group(self.pid, Signal::SIGKILL);
    }
}

/// User plus system time of the process and its reaped children
#[cfg(target_os = "linux")]
fn process_cpu_time(pid: u32) -> Option<Duration> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name may contain spaces; fields are counted from the closing paren.
    let fields: Vec<&str> = stat[stat.rfind(')')? + 1..].split_whitespace().collect();
    // utime, stime, cutime, cstime are fields 14 to 17 of the full line
    let ticks = fields
        .get(11..15)?
        .iter()
        .map(|f| f.parse::<u64>().ok())
        .sum::<Option<u64>>()?;
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if hz <= 0 {
        return None;
    }
    Some(Duration::from_secs_f64(ticks as f64 / hz as f64))
}

#[cfg(not(target_os = "linux"))]
fn process_cpu_time(_pid: u32) -> Option<Duration> {
    None
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(not(target_os = "macos"), not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

/// Lower a limit to `value`, never above the inherited hard limit
#[cfg(not(target_os = "macos"))]
fn lower_rlimit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe {
        if libc::getrlimit(resource, &mut current) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let wanted = value as libc::rlim_t;
        let capped = if current.rlim_max == libc::RLIM_INFINITY {
            wanted
        } else {
            wanted.min(current.rlim_max)
        };
        let rlimit = libc::rlimit {
            rlim_cur: capped,
            rlim_max: capped,
        };
        if libc::setrlimit(resource, &rlimit) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Apply OS-enforced limits to the command
fn apply_resource_limits(cmd: &mut Command, limits: &ResourceLimits) {
    #[cfg(not(target_os = "macos"))]
    let memory_bytes = limits.max_virtual_memory_bytes();
    #[cfg(not(target_os = "macos"))]
    let max_processes = limits.max_processes();
    #[cfg(target_os = "macos")]
    let _ = limits;

    unsafe {
        cmd.pre_exec(move || {
            // New process group for easier cleanup
            libc::setpgid(0, 0);

            // macOS doesn't support RLIMIT_AS properly, and RLIMIT_NPROC is per user there
            #[cfg(not(target_os = "macos"))]
            {
                if let Some(bytes) = memory_bytes {
                    lower_rlimit(libc::RLIMIT_AS, bytes)?;
                }
                if let Some(count) = max_processes {
                    lower_rlimit(libc::RLIMIT_NPROC, count)?;
                }
            }

            Ok(())
        });
    }
}
