use nbworker::{
    EngineConfig, EngineError, OutputSnapshot, ResourceLimits, WorkerHandle, WorkerSupervisor,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

type RpcResult = std::result::Result<Value, Value>;

struct RpcConfig {
    engine: EngineConfig,
    export_dir: Option<PathBuf>,
}

impl RpcConfig {
    fn from_env_and_args() -> anyhow::Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut engine = EngineConfig::from_env()?;
        let export_dir = std::env::var("NBWORKER_EXPORT_DIR").ok().map(PathBuf::from);

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--python-path" => {
                    if let Some(v) = args.get(i + 1) {
                        engine.python_path = Some(PathBuf::from(v));
                    }
                    i += 2;
                }
                "--scratch-root" => {
                    if let Some(v) = args.get(i + 1) {
                        engine.scratch_root = PathBuf::from(v);
                    }
                    i += 2;
                }
                "--idle-timeout" => {
                    if let Some(v) = args.get(i + 1) {
                        let secs = v
                            .parse::<u64>()
                            .map_err(|e| anyhow::anyhow!("--idle-timeout {}: {}", v, e))?;
                        engine.idle_timeout_secs = Some(secs);
                    }
                    i += 2;
                }
                _ => i += 1,
            }
        }

        engine.validate()?;
        Ok(Self { engine, export_dir })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "nbworker_rpc=info,nbworker=info".to_string()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cfg = RpcConfig::from_env_and_args()?;
    tracing::info!(
        "nbworker-rpc starting (scratch_root={:?})",
        cfg.engine.scratch_root
    );
    let export_dir = cfg.export_dir.clone();
    let supervisor = Arc::new(WorkerSupervisor::native(cfg.engine)?);

    // Requests for different worksheets run concurrently; responses are
    // written by a single task so lines never interleave.
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(resp) = rx.recv().await {
            let s = serde_json::to_string(&resp)?;
            stdout.write_all(s.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let stdin = BufReader::new(io::stdin());
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("invalid json-rpc line: {} | err={}", line, e);
                continue;
            }
        };

        let method = parsed.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let id = parsed.get("id").cloned();

        // Notifications have no id: ignore all but "exit".
        if id.is_none() {
            if method == "exit" {
                break;
            }
            continue;
        }

        if method == "shutdown" {
            supervisor.quit_all().await;
            let _ = tx.send(json!({ "jsonrpc": "2.0", "result": {}, "id": id }));
            break;
        }

        let supervisor = supervisor.clone();
        let export_dir = export_dir.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = handle_message(&supervisor, export_dir.as_ref(), parsed).await;
            let _ = tx.send(response);
        });
    }

    supervisor.quit_all().await;
    drop(tx);
    writer.await??;
    tracing::info!("nbworker-rpc stopped");
    Ok(())
}

async fn handle_message(
    supervisor: &WorkerSupervisor,
    export_dir: Option<&PathBuf>,
    msg: Value,
) -> Value {
    let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");
    let id = msg.get("id").cloned();
    let params = msg.get("params").cloned().unwrap_or_else(|| json!({}));

    let result = match method {
        "initialize" => Ok(json!({
            "serverInfo": {
                "name": "nbworker",
                "version": env!("CARGO_PKG_VERSION")
            },
            "defaultLimits": supervisor.config().default_limits,
            "idleTimeoutSecs": supervisor.config().idle_timeout_secs,
        })),
        "worker/start" => start(supervisor, &params).await,
        "worker/execute" => execute(supervisor, &params).await,
        "worker/poll" => poll(supervisor, export_dir, &params),
        "worker/interrupt" => interrupt(supervisor, &params).await,
        "worker/restart" => restart(supervisor, &params).await,
        "worker/quit" => quit(supervisor, &params).await,
        "worker/status" => status(supervisor, &params),
        "worker/setLimits" => set_limits(supervisor, &params).await,
        "worker/reapIdle" => reap_idle(supervisor, &params).await,
        _ => Err(json!({
            "code": -32601,
            "message": format!("Method not found: {}", method)
        })),
    };

    match result {
        Ok(v) => json!({ "jsonrpc": "2.0", "result": v, "id": id }),
        Err(err_obj) => json!({ "jsonrpc": "2.0", "error": err_obj, "id": id }),
    }
}

fn engine_error(e: EngineError) -> Value {
    json!({
        "code": -32000,
        "message": e.to_string(),
        "data": { "usage": e.is_usage_error() }
    })
}

fn invalid_params(message: String) -> Value {
    json!({ "code": -32602, "message": message })
}

fn required<T: DeserializeOwned>(params: &Value, key: &str) -> std::result::Result<T, Value> {
    let raw = params
        .get(key)
        .cloned()
        .ok_or_else(|| invalid_params(format!("Missing required argument: {}", key)))?;
    serde_json::from_value(raw).map_err(|e| invalid_params(format!("Invalid {}: {}", key, e)))
}

fn optional<T: DeserializeOwned>(
    params: &Value,
    key: &str,
) -> std::result::Result<Option<T>, Value> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => required(params, key).map(Some),
    }
}

async fn start(supervisor: &WorkerSupervisor, params: &Value) -> RpcResult {
    let worksheet: String = required(params, "worksheet")?;
    let limits: Option<ResourceLimits> = optional(params, "limits")?;

    let handle = supervisor
        .start(worksheet, limits)
        .await
        .map_err(engine_error)?;
    let capabilities = supervisor
        .capabilities(&handle)
        .await
        .map_err(engine_error)?;
    Ok(json!({
        "handle": handle,
        "state": supervisor.state(&handle),
        "capabilities": capabilities,
    }))
}

async fn execute(supervisor: &WorkerSupervisor, params: &Value) -> RpcResult {
    let handle: WorkerHandle = required(params, "handle")?;
    let code: String = required(params, "code")?;
    supervisor
        .execute(&handle, &code)
        .await
        .map_err(engine_error)?;
    Ok(json!({}))
}

fn poll(
    supervisor: &WorkerSupervisor,
    default_export: Option<&PathBuf>,
    params: &Value,
) -> RpcResult {
    let handle: WorkerHandle = required(params, "handle")?;
    let export_dir: Option<PathBuf> = optional(params, "export_dir")?;
    let snapshot = supervisor.poll(&handle).map_err(engine_error)?;
    Ok(snapshot_result(
        snapshot,
        export_dir.as_deref().or(default_export.map(PathBuf::as_path)),
    ))
}

/// Output is always reported. Export failures land in `exportError`, and a
/// done snapshot's scratch files are gone once this returns.
fn snapshot_result(snapshot: OutputSnapshot, export_dir: Option<&Path>) -> Value {
    let mut exported = Vec::new();
    let mut export_error = None;
    if snapshot.is_done() && !snapshot.filenames().is_empty() {
        if let Some(dest) = export_dir {
            match snapshot.copy_artifacts_to(dest) {
                Ok(paths) => exported = paths,
                Err(e) => {
                    tracing::warn!("artifact export to {:?} failed: {}", dest, e);
                    export_error = Some(e.to_string());
                }
            }
        }
    }

    let done = snapshot.is_done();
    let result = json!({
        "output": snapshot.output(),
        "cumulative": snapshot.cumulative(),
        "filenames": snapshot.filenames(),
        "done": done,
        "exported": exported,
        "exportError": export_error,
        "scratchRemoved": done,
    });
    if let Err(e) = snapshot.close() {
        tracing::warn!("scratch cleanup failed: {}", e);
    }
    result
}

async fn interrupt(supervisor: &WorkerSupervisor, params: &Value) -> RpcResult {
    let handle: WorkerHandle = required(params, "handle")?;
    let tries: u32 = optional(params, "tries")?.unwrap_or(3);
    let escalate: bool = optional(params, "escalate")?.unwrap_or(true);

    let outcome = supervisor
        .interrupt_with_outcome(&handle, tries, escalate)
        .await
        .map_err(engine_error)?;
    Ok(json!({ "stopped": outcome.stopped(), "outcome": outcome }))
}

async fn restart(supervisor: &WorkerSupervisor, params: &Value) -> RpcResult {
    let handle: WorkerHandle = required(params, "handle")?;
    supervisor.restart(&handle).await.map_err(engine_error)?;
    Ok(json!({ "state": supervisor.state(&handle) }))
}

async fn quit(supervisor: &WorkerSupervisor, params: &Value) -> RpcResult {
    let handle: WorkerHandle = required(params, "handle")?;
    supervisor.quit(&handle).await.map_err(engine_error)?;
    Ok(json!({}))
}

fn status(supervisor: &WorkerSupervisor, params: &Value) -> RpcResult {
    let handle: Option<WorkerHandle> = optional(params, "handle")?;
    match handle {
        Some(handle) => Ok(json!({
            "started": supervisor.is_started(&handle),
            "computing": supervisor.is_computing(&handle),
            "state": supervisor.state(&handle),
        })),
        None => {
            let workers: Vec<Value> = supervisor
                .worksheets()
                .into_iter()
                .map(|(worksheet, state)| json!({ "worksheet": worksheet, "state": state }))
                .collect();
            Ok(json!({ "workers": workers }))
        }
    }
}

async fn set_limits(supervisor: &WorkerSupervisor, params: &Value) -> RpcResult {
    let handle: WorkerHandle = required(params, "handle")?;
    let limits: ResourceLimits = required(params, "limits")?;
    supervisor
        .set_limits(&handle, limits)
        .await
        .map_err(engine_error)?;
    Ok(json!({ "limits": limits }))
}

async fn reap_idle(supervisor: &WorkerSupervisor, params: &Value) -> RpcResult {
    let timeout_secs: Option<u64> = optional(params, "timeout_secs")?;
    let reaped = match timeout_secs {
        Some(secs) => supervisor.quit_idle(Duration::from_secs(secs)).await,
        None => supervisor.quit_idle_configured().await,
    };
    Ok(json!({ "reaped": reaped }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbworker::{Backend, CellIo, InProcessBackend, Interpreter};

    /// Writes each line of the cell to a scratch file of that name
    struct FileWriter;

    impl Interpreter for FileWriter {
        fn run(&mut self, code: &str, io: &mut CellIo) {
            for name in code.lines() {
                let _ = std::fs::write(io.scratch_dir().join(name), name);
                io.write(&format!("wrote {name}\n"));
            }
        }
    }

    fn supervisor(scratch: &Path) -> WorkerSupervisor {
        let config = EngineConfig {
            scratch_root: scratch.to_path_buf(),
            ..Default::default()
        };
        WorkerSupervisor::new(config, |_: &EngineConfig| -> nbworker::Result<Box<dyn Backend>> {
            Ok(Box::new(InProcessBackend::new(|| FileWriter)))
        })
        .unwrap()
    }

    async fn finished(supervisor: &WorkerSupervisor, code: &str) -> OutputSnapshot {
        let handle = supervisor.start("sheet", None).await.unwrap();
        supervisor.execute(&handle, code).await.unwrap();
        for _ in 0..500 {
            let snapshot = supervisor.poll(&handle).unwrap();
            if snapshot.is_done() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cell did not finish");
    }

    #[tokio::test]
    async fn test_failed_export_still_reports_output() {
        let scratch = tempfile::tempdir().unwrap();
        let blocker = tempfile::NamedTempFile::new().unwrap();
        let supervisor = supervisor(scratch.path());

        let snapshot = finished(&supervisor, "plot.png").await;
        let dir = snapshot.scratch_dir().unwrap().to_path_buf();
        let result = snapshot_result(snapshot, Some(&blocker.path().join("out")));

        assert_eq!(result["output"], "wrote plot.png\n");
        assert_eq!(result["cumulative"], "wrote plot.png\n");
        assert_eq!(result["done"], true);
        assert_eq!(result["filenames"], json!(["plot.png"]));
        assert!(result["exportError"].is_string());
        assert_eq!(result["exported"], json!([]));
        assert_eq!(result["scratchRemoved"], true);
        assert!(!dir.exists());
        supervisor.quit_all().await;
    }

    #[tokio::test]
    async fn test_export_copies_artifacts() {
        let scratch = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let supervisor = supervisor(scratch.path());

        let snapshot = finished(&supervisor, "a.txt").await;
        let result = snapshot_result(snapshot, Some(dest.path()));

        assert!(result["exportError"].is_null());
        assert_eq!(std::fs::read_to_string(dest.path().join("a.txt")).unwrap(), "a.txt");
        supervisor.quit_all().await;
    }
}
