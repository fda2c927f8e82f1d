#![forbid(unsafe_code)]

//! `agent-conduit`: run one agent execution from the command line.
//!
//! Loads configuration, resolves the agent CLI, runs the prompt, and prints
//! every decoded message as a JSON line on stdout. Logs go to stderr.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_conduit::config::GlobalConfig;
use agent_conduit::launcher::{Completion, ExecutionOptions, Launcher, MessageHandler};
use agent_conduit::permission::{PermissionMode, RulePolicy};
use agent_conduit::protocol::Message;
use agent_conduit::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-conduit", about = "Drive a coding-agent CLI over stdio", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Working directory for the agent.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Execution deadline in seconds.
    #[arg(long)]
    timeout_seconds: Option<u64>,

    /// Model override.
    #[arg(long)]
    model: Option<String>,

    /// Tool pattern to allow; repeatable.
    #[arg(long = "allow")]
    allow: Vec<String>,

    /// Tool pattern to deny; repeatable.
    #[arg(long = "deny")]
    deny: Vec<String>,

    /// Prompt sent to the agent.
    prompt: String,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    config.permission.allow.extend(args.allow.iter().cloned());
    config.permission.deny.extend(args.deny.iter().cloned());
    config.validate()?;
    info!("configuration loaded");

    if config.permission.mode == PermissionMode::Manual {
        warn!("manual approvals need an operator; unlisted tools will be denied");
    }
    let policy = RulePolicy::from_config(&config.permission, None);
    let launcher = Launcher::new(config).with_decider(Arc::new(policy));

    let options = ExecutionOptions {
        working_dir: args.cwd,
        timeout: args.timeout_seconds.map(Duration::from_secs),
        agent: agent_conduit::args::AgentOptions {
            model: args.model,
            ..Default::default()
        },
        ..Default::default()
    };

    // ── Run until done or signalled ─────────────────────
    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    let mut printer = JsonLinePrinter::default();
    let outcome = launcher
        .execute_with_handler(&args.prompt, options, &mut printer, &ct)
        .await;

    match (outcome, printer.success) {
        (Ok(()), Some(false)) => Err(AppError::Execution("agent reported failure".into())),
        (Ok(()), _) => {
            info!("agent-conduit finished");
            Ok(())
        }
        (Err(err), _) => {
            error!(%err, "execution failed");
            Err(err)
        }
    }
}

/// Prints each message as one JSON line.
#[derive(Debug, Default)]
struct JsonLinePrinter {
    success: Option<bool>,
}

impl MessageHandler for JsonLinePrinter {
    fn on_message(&mut self, message: &Message) -> Result<()> {
        let line = serde_json::to_string(message)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")?;
        Ok(())
    }

    fn on_complete(&mut self, completion: &Completion) {
        self.success = Some(completion.success);
        info!(
            success = completion.success,
            duration_ms = u64::try_from(completion.duration.as_millis()).unwrap_or(u64::MAX),
            session_id = completion.session_id.as_deref().unwrap_or_default(),
            "execution complete"
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
