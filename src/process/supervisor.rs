//! Exit supervision for processes handed off to a long-lived consumer.
//!
//! [`supervise`] moves the [`AgentProcess`] into a task that reaps it when
//! it exits on its own, or kills and reaps it when asked. Either way the
//! exit state is published once and the `exited` token fires.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::process::{AgentProcess, ExitInfo};
use crate::{AppError, Result};

/// Handle to a supervised process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    pid: Option<u32>,
    kill: CancellationToken,
    exited: CancellationToken,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    handle: JoinHandle<Result<ExitInfo>>,
}

/// Move `process` under supervision.
///
/// Must be called from within a tokio runtime. Take any streams you need
/// from `process` first.
#[must_use]
pub fn supervise(mut process: AgentProcess) -> ProcessSupervisor {
    let pid = process.id();
    let kill = CancellationToken::new();
    let exited = CancellationToken::new();
    let (exit_tx, exit_rx) = watch::channel(None);

    let kill_signal = kill.clone();
    let exited_signal = exited.clone();
    let handle = tokio::spawn(async move {
        let natural = tokio::select! {
            result = process.wait() => Some(result),
            () = kill_signal.cancelled() => None,
        };
        let result = match natural {
            Some(result) => result,
            None => {
                info!(pid = pid.unwrap_or(0), "supervisor: kill requested");
                process.terminate().await
            }
        };

        match &result {
            Ok(exit) => {
                exit_tx.send_replace(Some(*exit));
            }
            Err(err) => warn!(pid = pid.unwrap_or(0), %err, "supervisor: failed to reap agent"),
        }
        exited_signal.cancel();
        result
    });

    ProcessSupervisor {
        pid,
        kill,
        exited,
        exit_rx,
        handle,
    }
}

impl ProcessSupervisor {
    /// OS process id.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the supervisor to kill the process. Idempotent.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// Token that fires once the process has been reaped.
    #[must_use]
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Exit state, once reaped.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Receiver that observes the exit state when it is published.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Wait for the process to exit on its own and return its state.
    ///
    /// # Errors
    ///
    /// [`AppError::Io`] if reaping failed or the supervisor task panicked.
    pub async fn wait(self) -> Result<ExitInfo> {
        self.handle
            .await
            .map_err(|err| AppError::Io(format!("supervisor task failed: {err}")))?
    }

    /// Kill the process if needed, then reap it.
    ///
    /// # Errors
    ///
    /// See [`ProcessSupervisor::wait`].
    pub async fn shutdown(self) -> Result<ExitInfo> {
        self.kill();
        self.wait().await
    }
}
