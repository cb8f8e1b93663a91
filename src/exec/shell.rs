use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::ExecConfig;

/// Terminal state of one command attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Succeeded,
    Failed,
    Interrupted,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandStatus::Succeeded => write!(f, "succeeded"),
            CommandStatus::Failed => write!(f, "failed"),
            CommandStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Outcome of one command attempt.
#[derive(Debug)]
pub struct ExecutionResult {
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs commands through a shell, one subprocess per command.
///
/// Each child gets its own process group so an interrupt reaches the
/// whole pipeline the shell may have spawned.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    grace: Duration,
}

impl ShellExecutor {
    pub fn new(config: &ExecConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            grace: config.grace,
        }
    }

    /// Run one command to a terminal state.
    ///
    /// A non-zero exit or a spawn failure is a `Failed` outcome, never an
    /// error: one bad command must not abort its siblings. Cancellation
    /// escalates SIGINT, then after the grace interval SIGKILL, and
    /// yields `Interrupted` with whatever output was captured.
    pub async fn run(&self, command: &str, cancel: &CancellationToken) -> ExecutionResult {
        let started = Instant::now();
        let mut child = match Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(command, error = %err, "Failed to start command");
                return ExecutionResult {
                    status: CommandStatus::Failed,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: err.to_string(),
                };
            }
        };
        tracing::debug!(command, "Command started");

        // Drain the pipes on their own tasks so a killed child's partial
        // output is still captured once the pipes close.
        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let (wait, interrupted) = tokio::select! {
            wait = child.wait() => (wait, false),
            _ = cancel.cancelled() => {
                tracing::debug!(command, "Interrupting command");
                self.interrupt(&child);
                if !self.grace.is_zero() {
                    let _ = tokio::time::timeout(self.grace, child.wait()).await;
                }
                let _ = child.start_kill();
                (child.wait().await, true)
            }
        };

        let stdout = collect(stdout_task.await);
        let stderr = collect(stderr_task.await);
        let elapsed = started.elapsed();

        if interrupted {
            tracing::debug!(command, ?elapsed, "Command interrupted");
            return ExecutionResult {
                status: CommandStatus::Interrupted,
                exit_code: wait.ok().and_then(|status| status.code()),
                stdout,
                stderr,
            };
        }
        match wait {
            Ok(status) if status.success() => {
                tracing::info!(command, ?elapsed, "Command succeeded");
                ExecutionResult {
                    status: CommandStatus::Succeeded,
                    exit_code: status.code(),
                    stdout,
                    stderr,
                }
            }
            Ok(status) => {
                tracing::error!(command, exit_code = ?status.code(), ?elapsed, "Command failed");
                ExecutionResult {
                    status: CommandStatus::Failed,
                    exit_code: status.code(),
                    stdout,
                    stderr,
                }
            }
            Err(err) => {
                tracing::error!(command, error = %err, "Failed to reap command");
                ExecutionResult {
                    status: CommandStatus::Failed,
                    exit_code: None,
                    stdout,
                    stderr,
                }
            }
        }
    }

    /// Best-effort SIGINT to the child's process group.
    fn interrupt(&self, child: &Child) {
        if let Some(pid) = child.id() {
            // Negative pid targets the group created by process_group(0).
            unsafe {
                libc::kill(-(pid as i32), libc::SIGINT);
            }
        }
    }
}

async fn drain<R>(pipe: Option<R>) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

fn collect(joined: Result<Vec<u8>, tokio::task::JoinError>) -> String {
    String::from_utf8_lossy(&joined.unwrap_or_default()).into_owned()
}
