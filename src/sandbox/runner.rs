//! Sandboxed script execution.
//!
//! One `run()` walks the phases
//! `Created → Spawned → Draining → Exited → CleanedUp | CleanupFailed`:
//! the code is written to a uniquely named temp file in the project's
//! scripts directory, the interpreter is spawned with the rendered
//! capability flags, both pipes are drained concurrently into an
//! [`OutputBuffer`], and debounced progress is pushed to the caller.
//! The temp file is removed on every path once it exists.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capabilities::CapabilitySet;
use super::output::{OutputBuffer, RenderLimits, StreamKind, DEFAULT_SCROLLBACK};
use crate::config::ExecutionConfig;
use crate::debounce::Debouncer;
use crate::error::{ToolError, ToolResult};

/// Environment variable cleared for every child: the interpreter's own
/// permission checks do not cover dynamic-library search paths.
const CLEARED_ENV_VAR: &str = "LD_LIBRARY_PATH";

/// Length of the random part of temp script names.
const TEMP_ID_LEN: usize = 21;

const READ_CHUNK: usize = 8192;

/// Receives the bounded combined transcript while a script runs.
pub type ProgressSink = Arc<dyn Fn(String) + Send + Sync>;

/// Lifecycle phase of one execution, used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Created,
    Spawned,
    Draining,
    Exited,
    CleanedUp,
    CleanupFailed,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionPhase::Created => "created",
            ExecutionPhase::Spawned => "spawned",
            ExecutionPhase::Draining => "draining",
            ExecutionPhase::Exited => "exited",
            ExecutionPhase::CleanedUp => "cleaned-up",
            ExecutionPhase::CleanupFailed => "cleanup-failed",
        };
        f.write_str(name)
    }
}

/// Everything needed for one script execution.
pub struct ExecutionRequest {
    pub code: String,
    pub capabilities: CapabilitySet,
    /// Directory the temp script is written to.
    pub scripts_dir: PathBuf,
    pub workdir: Option<PathBuf>,
    pub cancel: Option<CancellationToken>,
    pub on_progress: Option<ProgressSink>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, capabilities: CapabilitySet, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            code: code.into(),
            capabilities,
            scripts_dir: scripts_dir.into(),
            workdir: None,
            cancel: None,
            on_progress: None,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.on_progress = Some(sink);
        self
    }
}

/// Bounded outcome of a script that ran to completion.
///
/// A non-zero `exit_code` is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub merged: String,
    pub exit_code: i32,
}

/// Spawns the script interpreter under a capability set.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: PathBuf,
    /// Arguments placed before the permission flags (`["run"]` for deno).
    interpreter_args: Vec<String>,
    script_extension: String,
    limits: RenderLimits,
    scrollback: usize,
    progress_interval: Duration,
    progress_max_wait: Option<Duration>,
}

impl ScriptRunner {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            interpreter_args: vec!["run".to_string()],
            script_extension: "ts".to_string(),
            limits: RenderLimits::default(),
            scrollback: DEFAULT_SCROLLBACK,
            progress_interval: Duration::from_millis(250),
            progress_max_wait: None,
        }
    }

    pub fn from_config(
        interpreter: impl Into<PathBuf>,
        interpreter_args: Vec<String>,
        execution: &ExecutionConfig,
    ) -> Self {
        Self {
            interpreter_args,
            limits: execution.render_limits(),
            scrollback: execution.scrollback_lines,
            progress_interval: Duration::from_millis(execution.progress_interval_ms),
            progress_max_wait: execution.progress_max_wait_ms.map(Duration::from_millis),
            ..Self::new(interpreter)
        }
    }

    pub fn with_interpreter_args(mut self, args: Vec<String>) -> Self {
        self.interpreter_args = args;
        self
    }

    pub fn with_script_extension(mut self, extension: &str) -> Self {
        self.script_extension = extension.to_string();
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn limits(&self) -> RenderLimits {
        self.limits
    }

    /// Runs one script and returns its bounded output.
    ///
    /// Fails with `ToolError::Spawn` when the script cannot be written or
    /// the interpreter cannot be started, and with `ToolError::Cancelled`
    /// when the request's token fires before the process exits.
    pub async fn run(&self, request: ExecutionRequest) -> ToolResult<ExecutionResult> {
        request.capabilities.validate()?;

        let script_path = self.write_temp_script(&request).await?;
        debug!("Execution {}: {}", script_path.display(), ExecutionPhase::Created);

        let result = self.execute(&script_path, &request).await;

        let phase = match tokio::fs::remove_file(&script_path).await {
            Ok(()) => ExecutionPhase::CleanedUp,
            Err(e) => {
                warn!("Failed to remove temp script {}: {e}", script_path.display());
                ExecutionPhase::CleanupFailed
            }
        };
        debug!("Execution {}: {phase}", script_path.display());

        result
    }

    async fn write_temp_script(&self, request: &ExecutionRequest) -> ToolResult<PathBuf> {
        tokio::fs::create_dir_all(&request.scripts_dir)
            .await
            .map_err(|e| {
                ToolError::Spawn(format!(
                    "cannot create scripts directory {}: {e}",
                    request.scripts_dir.display()
                ))
            })?;

        let path = request
            .scripts_dir
            .join(format!("temp_{}.{}", temp_id(), self.script_extension));
        tokio::fs::write(&path, &request.code).await.map_err(|e| {
            ToolError::Spawn(format!("cannot write temp script {}: {e}", path.display()))
        })?;
        Ok(path)
    }

    async fn execute(&self, script_path: &Path, request: &ExecutionRequest) -> ToolResult<ExecutionResult> {
        let flags = request.capabilities.to_flags();
        debug!("Permission flags: {}", flags.join(" "));

        let mut command = Command::new(&self.interpreter);
        command
            .args(&self.interpreter_args)
            .args(&flags)
            .arg(script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env(CLEARED_ENV_VAR, "")
            .kill_on_drop(true);
        if let Some(ref workdir) = request.workdir {
            command.current_dir(workdir);
        }

        let mut child = command.spawn().map_err(|e| {
            ToolError::Spawn(format!("{}: {e}", self.interpreter.display()))
        })?;
        info!(
            "Spawned {} (pid {:?}) for {}",
            self.interpreter.display(),
            child.id(),
            script_path.display()
        );

        let output = Arc::new(Mutex::new(OutputBuffer::new(self.scrollback)));
        let debouncer = self.progress_debouncer(&output, request.on_progress.clone());

        let mut drains = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drains.push(spawn_drain(stdout, StreamKind::Stdout, &output, &debouncer));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(spawn_drain(stderr, StreamKind::Stderr, &output, &debouncer));
        }
        debug!("Execution {}: {}", script_path.display(), ExecutionPhase::Draining);

        let aborts: Vec<AbortHandle> = drains.iter().map(|d| d.abort_handle()).collect();
        let cancel = request.cancel.as_ref();

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancelled(cancel) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill cancelled script: {e}");
                }
                return Err(abandon(script_path, &debouncer, &aborts));
            }
        };
        debug!("Execution {}: {}", script_path.display(), ExecutionPhase::Exited);

        // Exit does not mean the pipes are empty: a background child may
        // still hold them open.
        tokio::select! {
            results = join_all(drains) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("Output drain task failed: {e}");
                    }
                }
            }
            _ = cancelled(cancel) => {
                return Err(abandon(script_path, &debouncer, &aborts));
            }
        }
        debouncer.flush();

        let exit_code = status.code().unwrap_or(-1);
        info!("Script {} exited with {exit_code}", script_path.display());

        let output = lock(&output);
        Ok(ExecutionResult {
            stdout: output.stdout().render(self.limits),
            stderr: output.stderr().render(self.limits),
            merged: output.combined().render(self.limits),
            exit_code,
        })
    }

    fn progress_debouncer(
        &self,
        output: &Arc<Mutex<OutputBuffer>>,
        sink: Option<ProgressSink>,
    ) -> Debouncer {
        let output = Arc::clone(output);
        let limits = self.limits;
        let callback = move || {
            if let Some(ref sink) = sink {
                let rendered = lock(&output).combined().render(limits);
                sink(rendered);
            }
        };
        match self.progress_max_wait {
            Some(max_wait) => Debouncer::with_max_wait(self.progress_interval, max_wait, callback),
            None => Debouncer::new(self.progress_interval, callback),
        }
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Stops progress and output collection for a cancelled execution.
fn abandon(script_path: &Path, debouncer: &Debouncer, drains: &[AbortHandle]) -> ToolError {
    debouncer.cancel();
    for drain in drains {
        drain.abort();
    }
    info!("Execution of {} cancelled", script_path.display());
    ToolError::Cancelled
}

fn lock(output: &Mutex<OutputBuffer>) -> MutexGuard<'_, OutputBuffer> {
    output.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn temp_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TEMP_ID_LEN)
        .map(char::from)
        .collect()
}

/// Copies one pipe into the shared buffer until EOF, debouncing progress
/// after every chunk.
fn spawn_drain<R>(
    mut reader: R,
    stream: StreamKind,
    output: &Arc<Mutex<OutputBuffer>>,
    debouncer: &Debouncer,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let output = Arc::clone(output);
    let debouncer = debouncer.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    lock(&output).write(stream, &buf[..n]);
                    debouncer.debounce();
                }
                Err(e) => {
                    warn!("Error reading {}: {e}", stream.as_str());
                    break;
                }
            }
        }
        lock(&output).finish(stream);
    })
}
