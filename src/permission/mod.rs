//! Tool-permission decisions.
//!
//! The agent asks before running a tool by sending a `can_use_tool` control
//! request. [`bridge::PermissionBridge`] turns that request into a call on a
//! [`PermissionDecider`] and writes the verdict back.
//!
//! Deciders shipped here:
//! - [`AllowAll`]: approves everything unchanged.
//! - [`FnDecider`]: adapts an async closure.
//! - [`policy::RulePolicy`]: allow/deny lists with a fallback mode.
//! - [`manual::ManualApprovals`]: parks requests until an operator answers.

pub mod bridge;
pub mod manual;
pub mod policy;

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use bridge::PermissionBridge;
pub use manual::ManualApprovals;
pub use policy::{PermissionMode, RulePolicy};

/// Reason used when a denial carries no reason of its own.
pub const DEFAULT_DENY_REASON: &str = "Permission denied";

/// One tool-permission question from the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionRequest {
    /// Control request id; also the cancel-controller key.
    pub request_id: String,
    /// Tool the agent wants to run.
    pub tool_name: String,
    /// Proposed tool input.
    pub input: Value,
    /// Tool-use id of the pending invocation, when the agent sends it.
    pub tool_use_id: Option<String>,
    /// Arrival time.
    pub received_at: DateTime<Utc>,
}

/// Verdict returned by a [`PermissionDecider`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run the tool with `updated_input`, which may differ from the request.
    Allow {
        /// Input the tool will receive.
        updated_input: Value,
    },
    /// Refuse the tool.
    Deny {
        /// Human-readable reason shown to the agent.
        reason: String,
    },
}

impl Decision {
    /// Approve with the given input.
    #[must_use]
    pub fn allow(updated_input: Value) -> Self {
        Self::Allow { updated_input }
    }

    /// Refuse; an empty reason becomes [`DEFAULT_DENY_REASON`].
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::Deny {
            reason: if reason.is_empty() {
                DEFAULT_DENY_REASON.to_owned()
            } else {
                reason
            },
        }
    }

    /// Whether the tool may run.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }

    /// Payload of the success reply written back to the agent.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        match self {
            Self::Allow { updated_input } => {
                json!({ "behavior": "allow", "updatedInput": updated_input })
            }
            Self::Deny { reason } => json!({ "behavior": "deny", "message": reason }),
        }
    }
}

/// Boxed future returned by [`PermissionDecider::decide`].
pub type DecisionFuture<'a> = Pin<Box<dyn Future<Output = Result<Decision>> + Send + 'a>>;

/// Authority consulted once per permission request.
///
/// Returning `Err` makes the bridge answer with an error envelope carrying
/// the error's reason. `cancel` fires when the agent withdraws the request
/// or the connection shuts down.
pub trait PermissionDecider: Send + Sync {
    /// Decide whether `request` may proceed.
    fn decide(&self, request: PermissionRequest, cancel: CancellationToken) -> DecisionFuture<'_>;
}

/// Approves every request with its original input.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionDecider for AllowAll {
    fn decide(&self, request: PermissionRequest, _cancel: CancellationToken) -> DecisionFuture<'_> {
        Box::pin(async move { Ok(Decision::allow(request.input)) })
    }
}

/// Adapts an async closure into a [`PermissionDecider`].
///
/// ```rust,ignore
/// let decider = FnDecider::new(|req, _cancel| async move {
///     if req.tool_name == "Bash" {
///         Ok(Decision::deny("no shell"))
///     } else {
///         Ok(Decision::allow(req.input))
///     }
/// });
/// ```
pub struct FnDecider<F> {
    decide: F,
}

impl<F> FnDecider<F> {
    /// Wrap `decide`.
    pub fn new(decide: F) -> Self {
        Self { decide }
    }
}

impl<F, Fut> PermissionDecider for FnDecider<F>
where
    F: Fn(PermissionRequest, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Decision>> + Send + 'static,
{
    fn decide(&self, request: PermissionRequest, cancel: CancellationToken) -> DecisionFuture<'_> {
        Box::pin((self.decide)(request, cancel))
    }
}
