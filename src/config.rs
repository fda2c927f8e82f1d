//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::args::AgentOptions;
use crate::permission::PermissionMode;
use crate::{AppError, Result};

/// Which agent installation discovery should prefer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CliPreference {
    /// Pick the newest available installation.
    #[default]
    Auto,
    /// Always use the bundled installation.
    Bundled,
    /// Always use the installation found on `PATH`.
    Global,
}

/// Agent executable discovery settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct CliConfig {
    /// Explicit executable; skips discovery entirely.
    pub path: Option<PathBuf>,
    /// Installation preference.
    pub prefer: CliPreference,
    /// Bundled installation path; platform default when unset.
    pub bundled_path: Option<PathBuf>,
    /// Version reported for the bundled installation.
    pub bundled_version: Option<String>,
}

/// Timeouts, in seconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Whole-execution deadline.
    #[serde(default = "default_execution_seconds")]
    pub execution_seconds: u64,
    /// Outbound control request timeout.
    #[serde(default = "default_control_request_seconds")]
    pub control_request_seconds: u64,
    /// Time an operator has to answer a manual approval.
    #[serde(default = "default_manual_approval_seconds")]
    pub manual_approval_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            execution_seconds: default_execution_seconds(),
            control_request_seconds: default_control_request_seconds(),
            manual_approval_seconds: default_manual_approval_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Execution deadline.
    #[must_use]
    pub fn execution(&self) -> Duration {
        Duration::from_secs(self.execution_seconds)
    }

    /// Control request timeout.
    #[must_use]
    pub fn control_request(&self) -> Duration {
        Duration::from_secs(self.control_request_seconds)
    }

    /// Manual approval timeout.
    #[must_use]
    pub fn manual_approval(&self) -> Duration {
        Duration::from_secs(self.manual_approval_seconds)
    }
}

fn default_execution_seconds() -> u64 {
    300
}

fn default_control_request_seconds() -> u64 {
    30
}

fn default_manual_approval_seconds() -> u64 {
    300
}

/// Bounded queue capacities.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChannelConfig {
    /// Query message feed.
    #[serde(default = "default_message_capacity")]
    pub message_capacity: usize,
    /// Query error feed.
    #[serde(default = "default_error_capacity")]
    pub error_capacity: usize,
    /// Reader-to-pump frame queue.
    #[serde(default = "default_frame_capacity")]
    pub frame_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            message_capacity: default_message_capacity(),
            error_capacity: default_error_capacity(),
            frame_capacity: default_frame_capacity(),
        }
    }
}

fn default_message_capacity() -> usize {
    100
}

fn default_error_capacity() -> usize {
    10
}

fn default_frame_capacity() -> usize {
    64
}

/// Tool permission policy.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct PermissionConfig {
    /// Fallback for tools on neither list.
    pub mode: PermissionMode,
    /// Tool patterns always allowed.
    pub allow: Vec<String>,
    /// Tool patterns always refused; checked first.
    pub deny: Vec<String>,
}

/// Global configuration parsed from `config.toml`.
///
/// Every section is optional; an empty file yields the defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Executable discovery.
    pub cli: CliConfig,
    /// Timeouts.
    pub timeouts: TimeoutConfig,
    /// Queue capacities.
    pub channels: ChannelConfig,
    /// Tool permission policy.
    pub permission: PermissionConfig,
    /// Default agent options.
    pub agent: AgentOptions,
    /// Extra environment variables for the agent process.
    pub env: HashMap<String, String>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("timeouts.execution_seconds", self.timeouts.execution_seconds),
            (
                "timeouts.control_request_seconds",
                self.timeouts.control_request_seconds,
            ),
            (
                "timeouts.manual_approval_seconds",
                self.timeouts.manual_approval_seconds,
            ),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(AppError::Config(format!("{field} must be greater than zero")));
            }
        }

        let capacities = [
            ("channels.message_capacity", self.channels.message_capacity),
            ("channels.error_capacity", self.channels.error_capacity),
            ("channels.frame_capacity", self.channels.frame_capacity),
        ];
        for (field, value) in capacities {
            if value == 0 {
                return Err(AppError::Config(format!("{field} must be greater than zero")));
            }
        }

        if let Some(tool) = self
            .permission
            .allow
            .iter()
            .find(|tool| self.permission.deny.contains(tool))
        {
            return Err(AppError::Config(format!(
                "tool '{tool}' appears in both permission.allow and permission.deny"
            )));
        }

        self.agent.validate()
    }
}
