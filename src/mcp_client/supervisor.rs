//! Server process lifecycle management.
//!
//! Spawns the MCP server as a child process with piped stdio, drains its
//! stderr into the log bus, and owns termination. Each server runs as a
//! separate OS process communicating via JSON-RPC over stdio.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::command::LaunchCommand;
use super::errors::McpError;
use super::log_bus::LogBus;
use super::log_classifier;
use super::types::{LogEvent, LogLevel, LogSource};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Time between the graceful and the forceful termination signal.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on waiting for the exit watcher after a forceful kill.
const EXIT_WAIT_SLACK: Duration = Duration::from_secs(5);

// ─── Spawn options ───────────────────────────────────────────────────────────

/// Process environment applied at spawn time.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Whether the exit was requested through [`ProcessSupervisor::terminate`].
    pub requested: bool,
}

impl ProcessExit {
    fn from_status(status: &std::io::Result<ExitStatus>, requested: bool) -> Self {
        Self {
            code: status.as_ref().ok().and_then(|s| s.code()),
            requested,
        }
    }
}

// ─── ProcessSupervisor ───────────────────────────────────────────────────────

/// A running server process.
///
/// The child is owned by a background task that waits for it to exit; the
/// supervisor talks to that task to request termination and watches for
/// the exit it reports.
pub struct ProcessSupervisor {
    name: String,
    pid: Option<u32>,
    terminate_tx: Option<oneshot::Sender<Duration>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    stderr_task: Option<JoinHandle<()>>,
}

/// The stdio pipes handed to the transport.
pub struct ChildPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl ProcessSupervisor {
    /// Spawn `command` with piped stdin/stdout/stderr.
    ///
    /// Fails with `SpawnFailed` if the executable cannot be started; it does
    /// not retry.
    pub fn spawn(
        command: &LaunchCommand,
        options: &SpawnOptions,
        log_bus: &LogBus,
    ) -> Result<(Self, ChildPipes), McpError> {
        let name = command.server_name().to_string();

        let mut cmd = Command::new(command.program());
        cmd.args(command.args());

        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &options.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.clone(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take().ok_or(McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stderr".into(),
        })?;

        let pid = child.id();
        tracing::info!(server = %name, pid, command = %command, "server process spawned");

        let stderr_task = tokio::spawn(drain_stderr(stderr, log_bus.clone()));

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(
            name.clone(),
            child,
            terminate_rx,
            exit_tx,
            log_bus.clone(),
        ));

        Ok((
            Self {
                name,
                pid,
                terminate_tx: Some(terminate_tx),
                exit_rx,
                stderr_task: Some(stderr_task),
            },
            ChildPipes { stdin, stdout },
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id while the process was alive at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// The exit, once it has happened.
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// A receiver that changes exactly once, when the process exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Wait until the process has exited.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(exit) = *rx.borrow_and_update() {
                return exit;
            }
            if rx.changed().await.is_err() {
                // Watcher gone without reporting; the child was dropped with it.
                return ProcessExit {
                    code: None,
                    requested: true,
                };
            }
        }
    }

    /// Stop the process: graceful signal, `grace` to exit, then force.
    ///
    /// Idempotent. Returns once the process is gone.
    pub async fn terminate(&mut self, grace: Duration) -> Result<ProcessExit, McpError> {
        if let Some(tx) = self.terminate_tx.take() {
            // The watcher may already have seen the exit and dropped its end.
            let _ = tx.send(grace);
        }

        let exit = tokio::time::timeout(grace + EXIT_WAIT_SLACK, self.wait())
            .await
            .map_err(|_| McpError::TerminateFailed {
                name: self.name.clone(),
                reason: "process did not exit after kill".into(),
            })?;

        if let Some(task) = self.stderr_task.take() {
            // stderr closes with the process; don't wait on grandchildren
            // that inherited the pipe.
            task.abort();
        }
        Ok(exit)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(Duration::ZERO);
        }
    }
}

// ─── Background tasks ────────────────────────────────────────────────────────

/// Read stderr line by line until EOF, classifying every non-empty line.
///
/// Keeps the pipe drained so the server never blocks on a full buffer or
/// sees a closed pipe. Lines are decoded lossily; invalid UTF-8 never ends
/// the drain.
async fn drain_stderr(stderr: ChildStderr, bus: LogBus) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim();
                if !line.is_empty() {
                    bus.publish(log_classifier::classify(line));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "stderr read failed");
                break;
            }
        }
    }
    tracing::debug!("stderr reader task completed");
}

/// Own the child until it exits, on its own or on request.
async fn watch_exit(
    name: String,
    mut child: Child,
    mut terminate_rx: oneshot::Receiver<Duration>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    bus: LogBus,
) {
    let exit = tokio::select! {
        status = child.wait() => ProcessExit::from_status(&status, false),
        Ok(grace) = &mut terminate_rx => {
            let status = stop_child(&name, &mut child, grace).await;
            ProcessExit::from_status(&status, true)
        }
    };

    let message = match exit.code {
        Some(code) => format!("server process exited with code {code}"),
        None => "server process exited (terminated by signal)".to_string(),
    };
    let level = if exit.requested || exit.code == Some(0) {
        LogLevel::Info
    } else {
        LogLevel::Warning
    };
    bus.publish(LogEvent::new(level, message, LogSource::Client));

    exit_tx.send_replace(Some(exit));
}

/// Graceful signal, bounded wait, then forceful kill.
async fn stop_child(name: &str, child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(status);
    }

    if !grace.is_zero() {
        send_graceful_signal(name, child);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        tracing::warn!(server = name, "server did not respond to SIGTERM, forcing kill");
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(server = name, error = %e, "failed to force kill server process");
    }
    child.wait().await
}

#[cfg(unix)]
fn send_graceful_signal(name: &str, child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(server = name, pid, error = %e, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(name: &str, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(server = name, error = %e, "failed to signal server process");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
