//! Operator-answered permission requests.
//!
//! Each request is parked on a `oneshot` channel keyed by its control
//! request id until [`ManualApprovals::submit`] resolves it, the agent
//! cancels it, or the approval timeout elapses (which denies).

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::permission::{Decision, DecisionFuture, PermissionDecider, PermissionRequest};
use crate::{AppError, Result};

/// Default time an operator has to answer.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Parked {
    request: PermissionRequest,
    reply: oneshot::Sender<Decision>,
}

/// Pending approvals awaiting an operator.
#[derive(Debug)]
pub struct ManualApprovals {
    parked: Mutex<HashMap<String, Parked>>,
    timeout: Duration,
}

impl Default for ManualApprovals {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVAL_TIMEOUT)
    }
}

impl ManualApprovals {
    /// Create with an approval `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            parked: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Requests waiting for an answer, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<PermissionRequest> {
        let mut requests: Vec<_> = self.lock().values().map(|p| p.request.clone()).collect();
        requests.sort_by_key(|r| r.received_at);
        requests
    }

    /// Approve or reject a parked request.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] if `request_id` is not parked.
    pub fn submit(&self, request_id: &str, approved: bool, reason: Option<String>) -> Result<()> {
        let parked = self.take(request_id)?;
        let decision = if approved {
            Decision::allow(parked.request.input.clone())
        } else {
            Decision::deny(reason.unwrap_or_else(|| "Denied by operator".to_owned()))
        };
        Self::resolve(parked, decision);
        Ok(())
    }

    /// Resolve a parked request with an explicit decision, e.g. an approval
    /// with edited input.
    ///
    /// # Errors
    ///
    /// [`AppError::NotFound`] if `request_id` is not parked.
    pub fn submit_decision(&self, request_id: &str, decision: Decision) -> Result<()> {
        let parked = self.take(request_id)?;
        Self::resolve(parked, decision);
        Ok(())
    }

    fn take(&self, request_id: &str) -> Result<Parked> {
        self.lock().remove(request_id).ok_or_else(|| {
            AppError::NotFound(format!("no pending approval for request_id '{request_id}'"))
        })
    }

    fn resolve(parked: Parked, decision: Decision) {
        let request_id = parked.request.request_id;
        if parked.reply.send(decision).is_err() {
            warn!(request_id = request_id.as_str(), "approval receiver already dropped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Parked>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PermissionDecider for ManualApprovals {
    fn decide(&self, request: PermissionRequest, cancel: CancellationToken) -> DecisionFuture<'_> {
        Box::pin(async move {
            let request_id = request.request_id.clone();
            let (tx, rx) = oneshot::channel();
            info!(
                request_id = request_id.as_str(),
                tool = request.tool_name.as_str(),
                "awaiting operator decision"
            );
            self.lock().insert(
                request_id.clone(),
                Parked {
                    request,
                    reply: tx,
                },
            );
            let _parked = Unpark {
                approvals: self,
                request_id: &request_id,
            };

            tokio::select! {
                biased;

                decision = rx => decision.map_err(|_| {
                    AppError::Closed(format!("approval {request_id} dropped"))
                }),

                () = cancel.cancelled() => Err(AppError::Cancelled("request cancelled".into())),

                () = tokio::time::sleep(self.timeout) => Ok(Decision::deny(format!(
                    "approval timed out after {}s",
                    self.timeout.as_secs()
                ))),
            }
        })
    }
}

/// Drops the parked entry when the waiting future ends.
struct Unpark<'a> {
    approvals: &'a ManualApprovals,
    request_id: &'a str,
}

impl Drop for Unpark<'_> {
    fn drop(&mut self) {
        self.approvals.lock().remove(self.request_id);
    }
}
