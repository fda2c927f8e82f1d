//! Allow/deny list policy.
//!
//! Evaluation order: deny list, allow list, then the fallback
//! [`PermissionMode`]. A list entry matches a tool by exact name, `*`
//! matches every tool, and a trailing `*` matches by prefix
//! (`mcp__github__*`).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PermissionConfig;
use crate::permission::manual::ManualApprovals;
use crate::permission::{Decision, DecisionFuture, PermissionDecider, PermissionRequest};

/// What to do with a tool that is on neither list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Allow it.
    #[default]
    Auto,
    /// Ask an operator through [`ManualApprovals`].
    Manual,
    /// Refuse it.
    Deny,
}

/// Stateful allow/deny list decider.
#[derive(Debug, Clone, Default)]
pub struct RulePolicy {
    mode: PermissionMode,
    allow: Vec<String>,
    deny: Vec<String>,
    manual: Option<Arc<ManualApprovals>>,
}

impl RulePolicy {
    /// A policy with empty lists.
    #[must_use]
    pub fn new(mode: PermissionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Build from the `[permission]` config section.
    #[must_use]
    pub fn from_config(config: &PermissionConfig, manual: Option<Arc<ManualApprovals>>) -> Self {
        Self {
            mode: config.mode,
            allow: config.allow.clone(),
            deny: config.deny.clone(),
            manual,
        }
    }

    /// Add allow-list entries.
    #[must_use]
    pub fn with_allowed<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow.extend(tools.into_iter().map(Into::into));
        self
    }

    /// Add deny-list entries.
    #[must_use]
    pub fn with_denied<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny.extend(tools.into_iter().map(Into::into));
        self
    }

    /// Route unlisted tools to `manual` when in [`PermissionMode::Manual`].
    #[must_use]
    pub fn with_manual(mut self, manual: Arc<ManualApprovals>) -> Self {
        self.manual = Some(manual);
        self
    }

    /// Fallback mode.
    #[must_use]
    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    /// List-only verdict; `None` means the fallback mode applies.
    #[must_use]
    pub fn evaluate(&self, tool_name: &str) -> Option<bool> {
        if self.deny.iter().any(|p| matches_tool(p, tool_name)) {
            return Some(false);
        }
        if self.allow.iter().any(|p| matches_tool(p, tool_name)) {
            return Some(true);
        }
        None
    }
}

impl PermissionDecider for RulePolicy {
    fn decide(&self, request: PermissionRequest, cancel: CancellationToken) -> DecisionFuture<'_> {
        Box::pin(async move {
            let tool = request.tool_name.clone();
            match self.evaluate(&tool) {
                Some(false) => return Ok(Decision::deny(format!("Tool '{tool}' is blacklisted"))),
                Some(true) => return Ok(Decision::allow(request.input)),
                None => {}
            }

            debug!(tool = tool.as_str(), mode = ?self.mode, "policy: tool not listed, using mode");
            match (self.mode, &self.manual) {
                (PermissionMode::Auto, _) => Ok(Decision::allow(request.input)),
                (PermissionMode::Manual, Some(manual)) => manual.decide(request, cancel).await,
                (PermissionMode::Manual | PermissionMode::Deny, _) => Ok(Decision::deny(format!(
                    "Tool '{tool}' is not in whitelist"
                ))),
            }
        })
    }
}

fn matches_tool(pattern: &str, tool_name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => tool_name.starts_with(prefix),
        None => pattern == tool_name,
    }
}
