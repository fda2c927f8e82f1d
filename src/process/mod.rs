//! Agent process lifecycle.
//!
//! [`AgentProcess::spawn`] starts the agent with:
//! - `env_clear()` followed by the caller's sanitized environment, so nothing
//!   from this process leaks into the child by accident.
//! - all three standard streams piped.
//! - `kill_on_drop(true)` as the last line of defence against orphans.
//!
//! Reaping happens at most once: [`AgentProcess::wait`] caches the exit state
//! and returns it on later calls.

pub mod supervisor;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::{AppError, Result};

pub use supervisor::{supervise, ProcessSupervisor};

/// Everything needed to start the agent.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    /// Resolved executable.
    pub program: PathBuf,
    /// Argument vector, without the program name.
    pub args: Vec<String>,
    /// Working directory; inherits ours when `None`.
    pub working_dir: Option<PathBuf>,
    /// Complete child environment.
    pub env: BTreeMap<String, String>,
}

/// Reject a working directory that is missing or not a directory.
///
/// # Errors
///
/// [`AppError::InvalidPath`] describing the problem.
pub fn validate_working_dir(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|err| {
        AppError::InvalidPath(format!(
            "working directory {} does not exist: {err}",
            path.display()
        ))
    })?;
    if !metadata.is_dir() {
        return Err(AppError::InvalidPath(format!(
            "working directory {} is not a directory",
            path.display()
        )));
    }
    Ok(())
}

/// Final state of a reaped process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Whether the process exited with status zero.
    pub success: bool,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

impl Display for ExitInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(0) => f.write_str("exited normally (code 0)"),
            Some(code) => write!(f, "process exited with code {code}"),
            None => f.write_str("process terminated by signal"),
        }
    }
}

/// A running (or reaped) agent process.
#[derive(Debug)]
pub struct AgentProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit: Option<ExitInfo>,
}

impl AgentProcess {
    /// Start the agent described by `spec`.
    ///
    /// # Errors
    ///
    /// - [`AppError::InvalidPath`] if the working directory is unusable; the
    ///   process is never started in that case.
    /// - [`AppError::Launch`] if the OS refuses to start it or a pipe is
    ///   missing.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self> {
        if let Some(dir) = &spec.working_dir {
            validate_working_dir(dir)?;
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).env_clear().envs(&spec.env);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Launch(format!(
                "failed to spawn agent {}: {err}",
                spec.program.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Launch("failed to capture agent stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Launch("failed to capture agent stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Launch("failed to capture agent stderr".into()))?;

        let pid = child.id();
        info!(
            pid = pid.unwrap_or(0),
            program = %spec.program.display(),
            args = spec.args.len(),
            "agent process started"
        );

        Ok(Self {
            child,
            pid,
            stdin: Some(stdin),
            stdout: Some(stdout),
            stderr: Some(stderr),
            exit: None,
        })
    }

    /// OS process id, captured at spawn.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Take the input stream. `None` after the first call.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take the primary output stream. `None` after the first call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take the secondary stream. `None` after the first call.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Exit state, once reaped.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit
    }

    /// Send a kill signal if the process is still running. Does not reap.
    ///
    /// # Errors
    ///
    /// [`AppError::Io`] if the signal cannot be delivered to a live process.
    pub fn kill(&mut self) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        match self.child.start_kill() {
            Ok(()) => {
                debug!(pid = self.pid.unwrap_or(0), "agent process kill signal sent");
                Ok(())
            }
            // Already exited but not yet reaped.
            Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(AppError::Io(format!("failed to kill agent process: {err}"))),
        }
    }

    /// Reap the process, waiting for it to exit. Later calls return the
    /// cached state.
    ///
    /// # Errors
    ///
    /// [`AppError::Io`] if waiting fails.
    pub async fn wait(&mut self) -> Result<ExitInfo> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|err| AppError::Io(format!("failed to wait for agent process: {err}")))?;
        let exit = ExitInfo::from(status);
        self.exit = Some(exit);
        info!(pid = self.pid.unwrap_or(0), status = %exit, "agent process reaped");
        Ok(exit)
    }

    /// Kill (if running) and reap.
    ///
    /// # Errors
    ///
    /// See [`AgentProcess::kill`] and [`AgentProcess::wait`].
    pub async fn terminate(&mut self) -> Result<ExitInfo> {
        self.kill()?;
        self.wait().await
    }
}
