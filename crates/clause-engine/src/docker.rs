//! Container engine adapter driving the `docker` CLI.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clause_core::engine::{ContainerEngine, EngineError, InspectState};
use clause_core::instance::{AuthMode, ContainerSpec};
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// Captured result of one CLI invocation.
#[derive(Debug)]
struct CommandOutput {
    stdout: String,
    stderr: String,
    success: bool,
}

/// [`ContainerEngine`] backed by the `docker` binary.
pub struct DockerCli {
    binary: String,
    timeout: Duration,
    pull_timeout: Duration,
}

impl DockerCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "docker".into(),
            timeout,
            pull_timeout: timeout.max(Duration::from_secs(600)),
        }
    }

    /// Use a different CLI binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn run(&self, op: &str, args: &[String], timeout: Duration) -> Result<CommandOutput, EngineError> {
        let start = Instant::now();
        let mut cmd = tokio::process::Command::new(&self.binary);
        let _ = cmd
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(op, binary = %self.binary, "running engine command");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::Unavailable(format!("{} binary not found", self.binary))
            } else {
                EngineError::Unavailable(format!("failed to spawn {}: {e}", self.binary))
            }
        })?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stdout_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| EngineError::Command {
                    op: op.to_owned(),
                    message: format!("wait failed: {e}"),
                })?;
                let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
                let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();
                debug!(op, code = status.code().unwrap_or(-1), elapsed_ms = start.elapsed().as_millis() as u64, "engine command finished");
                Ok(CommandOutput { stdout, stderr, success: status.success() })
            }
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                warn!(op, timeout_ms = timeout.as_millis() as u64, "engine command timed out");
                Err(EngineError::Timeout { op: op.to_owned(), timeout_ms: timeout.as_millis() as u64 })
            }
        }
    }

    /// Run and turn a non-zero exit into a classified error.
    async fn run_ok(&self, op: &str, args: Vec<String>) -> Result<String, EngineError> {
        let out = self.run(op, &args, self.timeout).await?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(classify_failure(op, &out.stderr))
        }
    }
}

/// Map CLI stderr to an [`EngineError`].
pub fn classify_failure(op: &str, stderr: &str) -> EngineError {
    let msg = stderr.trim().to_owned();
    let lower = msg.to_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("error during connect")
        || lower.contains("is the docker daemon running")
    {
        EngineError::Unavailable(msg)
    } else if lower.contains("no such container") || lower.contains("no such object") {
        EngineError::NotFound(msg)
    } else if lower.contains("already in use") || lower.contains("conflict") {
        EngineError::Conflict(msg)
    } else {
        EngineError::Command {
            op: op.to_owned(),
            message: if msg.is_empty() { "exited with failure".into() } else { msg },
        }
    }
}

/// Arguments for `docker create`.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "-p".to_string(),
        format!("{}:{}", spec.host_port, spec.container_port),
    ];
    for m in &spec.mounts {
        let mut v = format!("{}:{}", m.host_path.display(), m.container_path);
        if m.read_only {
            v.push_str(":ro");
        }
        args.push("-v".into());
        args.push(v);
    }
    if let Some(owner) = spec.owner {
        args.push("--user".into());
        args.push(format!("{}:{}", owner.uid, owner.gid));
    }
    for (k, v) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{k}={v}"));
    }
    if let Some(mem) = &spec.memory_limit {
        args.push("--memory".into());
        args.push(mem.clone());
    }
    if let Some(cpus) = spec.cpus {
        args.push("--cpus".into());
        args.push(cpus.to_string());
    }
    args.push(spec.image.clone());
    if spec.auth_mode != AuthMode::Anon {
        args.push("--auth".into());
        args.push(spec.auth_mode.as_str().into());
    }
    if spec.https {
        args.push("--https".into());
    }
    args
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerState {
    #[serde(default)]
    status: String,
    #[serde(default)]
    running: bool,
    #[serde(default)]
    exit_code: Option<i64>,
}

fn parse_inspect(stdout: &str) -> Result<InspectState, EngineError> {
    let state: DockerState = serde_json::from_str(stdout.trim()).map_err(|e| EngineError::Command {
        op: "inspect".into(),
        message: format!("unparseable state: {e}"),
    })?;
    Ok(InspectState {
        running: state.running,
        exit_code: if state.running { None } else { state.exit_code },
        status: state.status,
    })
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn ping(&self) -> Result<(), EngineError> {
        let args = vec!["version".into(), "--format".into(), "{{.Server.Version}}".into()];
        let out = match self.run("ping", &args, self.timeout.min(Duration::from_secs(10))).await {
            Ok(out) => out,
            Err(EngineError::Timeout { timeout_ms, .. }) => {
                return Err(EngineError::Unavailable(format!(
                    "daemon did not answer within {timeout_ms}ms"
                )))
            }
            Err(e) => return Err(e),
        };
        if out.success {
            Ok(())
        } else {
            Err(EngineError::Unavailable(out.stderr.trim().to_owned()))
        }
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        let args = vec!["pull".into(), "--quiet".into(), image.to_owned()];
        let out = self.run("pull", &args, self.pull_timeout).await?;
        if out.success {
            Ok(())
        } else {
            Err(classify_failure("pull", &out.stderr))
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let out = self.run_ok("create", create_args(spec)).await?;
        let id = out.trim().to_owned();
        if id.is_empty() {
            return Err(EngineError::Command {
                op: "create".into(),
                message: "engine returned no container id".into(),
            });
        }
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.run_ok("start", vec!["start".into(), id.to_owned()]).await.map(|_| ())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), EngineError> {
        let args = vec!["stop".into(), "--time".into(), grace.as_secs().to_string(), id.to_owned()];
        let out = self.run("stop", &args, self.timeout + grace).await?;
        if out.success {
            Ok(())
        } else {
            Err(classify_failure("stop", &out.stderr))
        }
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        self.run_ok("remove", vec!["rm".into(), "--force".into(), id.to_owned()])
            .await
            .map(|_| ())
    }

    async fn inspect(&self, id: &str) -> Result<InspectState, EngineError> {
        let out = self
            .run_ok(
                "inspect",
                vec![
                    "container".into(),
                    "inspect".into(),
                    "--format".into(),
                    "{{json .State}}".into(),
                    id.to_owned(),
                ],
            )
            .await?;
        parse_inspect(&out)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<String>, EngineError> {
        let out = self
            .run_ok(
                "find",
                vec![
                    "ps".into(),
                    "--all".into(),
                    "--quiet".into(),
                    "--no-trunc".into(),
                    "--filter".into(),
                    format!("name=^/{name}$"),
                ],
            )
            .await?;
        Ok(out.lines().map(str::trim).find(|l| !l.is_empty()).map(str::to_owned))
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, EngineError> {
        let args = vec!["logs".into(), "--tail".into(), tail.to_string(), id.to_owned()];
        let out = self.run("logs", &args, self.timeout).await?;
        if !out.success {
            return Err(classify_failure("logs", &out.stderr));
        }
        // Container stdout and stderr arrive on the matching CLI streams.
        let mut text = out.stdout;
        if !out.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&out.stderr);
        }
        Ok(text)
    }
}
