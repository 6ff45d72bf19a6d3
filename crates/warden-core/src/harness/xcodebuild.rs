//! xcodebuild harness adapter.
//!
//! Runs `xcodebuild test-without-building` against one device and streams
//! both of its pipes line by line.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::trait_def::{Harness, OutputStreamBox};
use super::types::{HarnessHandle, OutputChunk, OutputStream};
use crate::Device;
use crate::project::XcodeProject;

/// Per-process bookkeeping, keyed by OS pid.
struct ProcessState {
    /// `None` while a `wait` call owns the child.
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    /// Cancelled by `kill` to make a pending `wait` terminate the child.
    kill: CancellationToken,
}

/// Harness adapter that drives `xcodebuild test-without-building`.
///
/// The device's parameters are appended as `key=value` arguments after the
/// fixed flags, which the UI test bundle reads from its launch arguments.
#[derive(Clone)]
pub struct XcodebuildHarness {
    project: XcodeProject,
    root_path: PathBuf,
    destination_timeout: Duration,
    kill_grace: Duration,
    processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
}

impl std::fmt::Debug for XcodebuildHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XcodebuildHarness")
            .field("binary", &self.project.binary)
            .field("root_path", &self.root_path)
            .field("scheme", &self.project.scheme)
            .finish()
    }
}

impl XcodebuildHarness {
    pub fn new(project: XcodeProject, root_path: impl Into<PathBuf>, destination_timeout: Duration) -> Self {
        Self {
            project,
            root_path: root_path.into(),
            destination_timeout,
            kill_grace: Duration::from_secs(5),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// How long `kill` waits after SIGTERM before sending SIGKILL.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Full argument list for one device.
    pub fn invocation_args(&self, device: &Device) -> Vec<String> {
        let mut args = vec![
            "test-without-building".to_string(),
            "-workspace".to_string(),
            self.project
                .workspace_path(&self.root_path)
                .display()
                .to_string(),
            "-scheme".to_string(),
            self.project.scheme.clone(),
            "-destination".to_string(),
            format!("id={}", device.udid),
            "-allowProvisioningUpdates".to_string(),
            "-destination-timeout".to_string(),
            self.destination_timeout.as_secs().to_string(),
            format!("name={}", device.name),
        ];
        args.extend(device.param_args());
        args
    }
}

/// Read one pipe line by line, dropping whitespace-only lines.
fn pipe_chunks<R>(reader: R, stream: OutputStream) -> impl Stream<Item = OutputChunk> + Send
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async_stream::stream! {
        let mut lines = LinesStream::new(BufReader::new(reader).lines());
        while let Some(line) = lines.next().await {
            match line {
                Ok(text) => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    yield OutputChunk { stream, text };
                }
                Err(e) => {
                    warn!(%stream, error = %e, "error reading harness output");
                    break;
                }
            }
        }
    }
}

/// SIGTERM, then SIGKILL once `grace` has passed.
async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> Result<ExitStatus> {
    #[cfg(unix)]
    {
        // SAFETY: pid belongs to a child we spawned and have not reaped yet.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            debug!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid, "harness exited after SIGTERM");
            Ok(status)
        }
        _ => {
            debug!(pid, "harness ignored SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
            child.wait().await.context("failed to reap killed harness")
        }
    }
}

#[async_trait]
impl Harness for XcodebuildHarness {
    fn name(&self) -> &str {
        "xcodebuild"
    }

    async fn spawn(&self, device: &Device) -> Result<HarnessHandle> {
        let mut cmd = Command::new(&self.project.binary);
        cmd.args(self.invocation_args(device))
            .current_dir(&self.root_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn harness binary '{}' for device {}",
                self.project.binary, device.udid
            )
        })?;
        let pid = child.id().context("child process has no pid")?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        self.processes.lock().await.insert(
            pid,
            ProcessState {
                child: Some(child),
                stdout,
                stderr,
                kill: CancellationToken::new(),
            },
        );

        Ok(HarnessHandle {
            pid,
            udid: device.udid.clone(),
            harness_name: self.name().to_string(),
        })
    }

    fn output(&self, handle: &HarnessHandle) -> OutputStreamBox {
        let pid = handle.pid;
        let processes = Arc::clone(&self.processes);
        // Detach the pipes now when the map is free, so a fast exit reaped by
        // `wait` cannot drop them before the stream is first polled.
        let detached = self.processes.try_lock().ok().map(|mut procs| {
            procs
                .get_mut(&pid)
                .map(|state| (state.stdout.take(), state.stderr.take()))
        });

        let stream = async_stream::stream! {
            let pipes = match detached {
                Some(pipes) => pipes,
                None => {
                    let mut procs = processes.lock().await;
                    procs.get_mut(&pid).map(|state| (state.stdout.take(), state.stderr.take()))
                }
            };
            let (stdout, stderr) = match pipes {
                Some((None, None)) | None => {
                    warn!(pid, "harness output already consumed or process missing");
                    return;
                }
                Some(pipes) => pipes,
            };

            let stdout: OutputStreamBox = match stdout {
                Some(pipe) => Box::pin(pipe_chunks(pipe, OutputStream::Stdout)),
                None => Box::pin(futures::stream::empty()),
            };
            let stderr: OutputStreamBox = match stderr {
                Some(pipe) => Box::pin(pipe_chunks(pipe, OutputStream::Stderr)),
                None => Box::pin(futures::stream::empty()),
            };

            let mut merged = futures::stream::select(stdout, stderr);
            while let Some(chunk) = merged.next().await {
                yield chunk;
            }
        };

        Box::pin(stream)
    }

    async fn wait(&self, handle: &HarnessHandle) -> Result<Option<i32>> {
        let pid = handle.pid;
        let (child, kill) = {
            let mut procs = self.processes.lock().await;
            match procs.get_mut(&pid) {
                Some(state) => (state.child.take(), state.kill.clone()),
                None => bail!("harness process {pid} is not tracked"),
            }
        };
        let Some(mut child) = child else {
            bail!("harness process {pid} is already being waited on");
        };

        let status = tokio::select! {
            status = child.wait() => status.context("failed to wait for harness")?,
            _ = kill.cancelled() => terminate(&mut child, pid, self.kill_grace).await?,
        };

        self.processes.lock().await.remove(&pid);
        Ok(status.code())
    }

    async fn kill(&self, handle: &HarnessHandle) -> Result<()> {
        let pid = handle.pid;
        let unwaited = {
            let mut procs = self.processes.lock().await;
            match procs.get_mut(&pid) {
                Some(state) => {
                    state.kill.cancel();
                    state.child.take()
                }
                None => {
                    debug!(pid, "kill called but process not tracked (already exited?)");
                    return Ok(());
                }
            }
        };

        // Nobody is parked in `wait`, so reap the child here.
        if let Some(mut child) = unwaited {
            terminate(&mut child, pid, self.kill_grace).await?;
            self.processes.lock().await.remove(&pid);
        }
        Ok(())
    }

    async fn is_running(&self, handle: &HarnessHandle) -> bool {
        let mut procs = self.processes.lock().await;
        let Some(state) = procs.get_mut(&handle.pid) else {
            return false;
        };
        match state.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    warn!(pid = handle.pid, error = %e, "error checking harness status");
                    false
                }
            },
            // Owned by a pending `wait`; gone from the map once it returns.
            None => !state.kill.is_cancelled(),
        }
    }
}
