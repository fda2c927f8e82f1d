//! Agent options and their translation into the CLI argument vector.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{AppError, Result};

/// Per-execution agent settings, also the `[agent]` config section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AgentOptions {
    /// Model name passed to `--model`.
    pub model: Option<String>,
    /// Model used when the main model is overloaded.
    pub fallback_model: Option<String>,
    /// Replaces the default system prompt.
    pub system_prompt: Option<String>,
    /// Appended to the default system prompt.
    pub append_system_prompt: Option<String>,
    /// Upper bound on agent turns.
    pub max_turns: Option<u32>,
    /// Agent-side permission mode (`default`, `acceptEdits`, `plan`, ...).
    pub permission_mode: Option<String>,
    /// Continue the most recent conversation.
    pub continue_conversation: bool,
    /// Session id to resume.
    pub resume: Option<String>,
    /// Tools the agent may use without asking.
    pub allowed_tools: Vec<String>,
    /// Tools the agent must not use.
    pub disallowed_tools: Vec<String>,
    /// MCP server registrations, keyed by server name.
    pub mcp_servers: BTreeMap<String, Value>,
    /// Ignore MCP servers not listed in `mcp_servers`.
    pub strict_mcp_config: bool,
    /// Settings file path.
    pub settings: Option<PathBuf>,
    /// Pass `--dangerously-skip-permissions`; ignored when running as root.
    pub skip_permissions: bool,
}

impl AgentOptions {
    /// Layer `overrides` on top of `self`.
    ///
    /// Scalars set in `overrides` win; lists and MCP servers are combined;
    /// flags are or-ed.
    #[must_use]
    pub fn overlay(&self, overrides: &Self) -> Self {
        let mut merged = self.clone();
        let pick = |base: &mut Option<String>, over: &Option<String>| {
            if over.is_some() {
                base.clone_from(over);
            }
        };
        pick(&mut merged.model, &overrides.model);
        pick(&mut merged.fallback_model, &overrides.fallback_model);
        pick(&mut merged.system_prompt, &overrides.system_prompt);
        pick(&mut merged.append_system_prompt, &overrides.append_system_prompt);
        pick(&mut merged.permission_mode, &overrides.permission_mode);
        pick(&mut merged.resume, &overrides.resume);
        if overrides.max_turns.is_some() {
            merged.max_turns = overrides.max_turns;
        }
        if overrides.settings.is_some() {
            merged.settings.clone_from(&overrides.settings);
        }
        merged.continue_conversation |= overrides.continue_conversation;
        merged.strict_mcp_config |= overrides.strict_mcp_config;
        merged.skip_permissions |= overrides.skip_permissions;
        merged
            .allowed_tools
            .extend(overrides.allowed_tools.iter().cloned());
        merged
            .disallowed_tools
            .extend(overrides.disallowed_tools.iter().cloned());
        merged.mcp_servers.extend(
            overrides
                .mcp_servers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }

    /// Reject inconsistent settings.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] if the fallback model equals the main model or
    /// `max_turns` is zero.
    pub fn validate(&self) -> Result<()> {
        if let (Some(model), Some(fallback)) = (&self.model, &self.fallback_model) {
            if model == fallback {
                return Err(AppError::Config(
                    "fallback model cannot be the same as the main model".into(),
                ));
            }
        }
        if self.max_turns == Some(0) {
            return Err(AppError::Config("max_turns must be greater than zero".into()));
        }
        Ok(())
    }
}

/// How the prompt reaches the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    /// One-shot prompt passed as `--print <prompt>`.
    Print(String),
    /// User messages written to stdin as `stream-json` frames.
    StreamJson,
}

/// Builds the argument vector for one launch.
#[derive(Debug, Clone)]
pub struct ArgumentBuilder<'a> {
    options: &'a AgentOptions,
    input: InputMode,
    permission_prompt: bool,
    running_as_root: bool,
}

impl<'a> ArgumentBuilder<'a> {
    /// Start from `options` in stream-json input mode.
    #[must_use]
    pub fn new(options: &'a AgentOptions) -> Self {
        Self {
            options,
            input: InputMode::StreamJson,
            permission_prompt: false,
            running_as_root: is_root(),
        }
    }

    /// Select the prompt delivery mode.
    #[must_use]
    pub fn input(mut self, input: InputMode) -> Self {
        self.input = input;
        self
    }

    /// Route permission prompts over stdio (a decider is attached).
    #[must_use]
    pub fn permission_prompt_tool(mut self, enabled: bool) -> Self {
        self.permission_prompt = enabled;
        self
    }

    /// Override root detection.
    #[must_use]
    pub fn running_as_root(mut self, root: bool) -> Self {
        self.running_as_root = root;
        self
    }

    /// Produce the argument vector.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] if the options fail validation or the MCP
    /// registrations cannot be encoded.
    pub fn build(&self) -> Result<Vec<String>> {
        let opts = self.options;
        opts.validate()?;

        let mut args: Vec<String> = vec![
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
        ];
        let mut push = |flag: &str, value: Option<String>| {
            args.push(flag.to_owned());
            if let Some(value) = value {
                args.push(value);
            }
        };

        if let Some(model) = &opts.model {
            push("--model", Some(model.clone()));
        }
        if let Some(fallback) = &opts.fallback_model {
            push("--fallback-model", Some(fallback.clone()));
        }
        if let Some(prompt) = &opts.system_prompt {
            push("--system-prompt", Some(prompt.clone()));
        }
        if let Some(prompt) = &opts.append_system_prompt {
            push("--append-system-prompt", Some(prompt.clone()));
        }
        if let Some(turns) = opts.max_turns {
            push("--max-turns", Some(turns.to_string()));
        }
        if self.permission_prompt {
            push("--permission-prompt-tool", Some("stdio".into()));
        }
        if let Some(mode) = &opts.permission_mode {
            push("--permission-mode", Some(mode.clone()));
        }
        if opts.continue_conversation {
            push("--continue", None);
        }
        if let Some(session) = &opts.resume {
            push("--resume", Some(session.clone()));
        }
        if !opts.allowed_tools.is_empty() {
            push("--allowedTools", Some(opts.allowed_tools.join(",")));
        }
        if !opts.disallowed_tools.is_empty() {
            push("--disallowedTools", Some(opts.disallowed_tools.join(",")));
        }
        if !opts.mcp_servers.is_empty() {
            let encoded = serde_json::to_string(&json!({ "mcpServers": opts.mcp_servers }))
                .map_err(|err| AppError::Config(format!("cannot encode mcp servers: {err}")))?;
            push("--mcp-config", Some(encoded));
        }
        if opts.strict_mcp_config {
            push("--strict-mcp-config", None);
        }
        if let Some(settings) = &opts.settings {
            push("--settings", Some(settings.display().to_string()));
        }
        if opts.skip_permissions && !self.running_as_root {
            push("--dangerously-skip-permissions", None);
        }

        match &self.input {
            InputMode::Print(prompt) => {
                let prompt = prompt.trim();
                if !prompt.is_empty() {
                    push("--print", Some(prompt.to_owned()));
                }
            }
            InputMode::StreamJson => {
                push("--print", None);
                push("--input-format", Some("stream-json".into()));
            }
        }

        Ok(args)
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}
