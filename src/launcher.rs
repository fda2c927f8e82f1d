//! Execution driver: resolve, launch, pump, report.
//!
//! [`Launcher::execute_with_handler`] runs one `--print` execution to its
//! terminal result and streams every decoded message to a
//! [`MessageHandler`]. Whatever ends the run (terminal result, output EOF,
//! deadline, or caller cancellation) the process is killed if still
//! running, its pipes are released, and it is reaped exactly once before
//! the call returns.
//!
//! [`Launcher::query`] starts the agent in `stream-json` input mode and hands
//! the streams to a [`Query`] for interactive use.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::args::{AgentOptions, ArgumentBuilder, InputMode};
use crate::config::GlobalConfig;
use crate::control::ControlChannel;
use crate::discovery::CliDiscovery;
use crate::permission::{PermissionBridge, PermissionDecider};
use crate::process::{supervise, AgentProcess, ExitInfo, LaunchSpec, ProcessSupervisor};
use crate::protocol::reader::{run_diagnostic_reader, run_reader, DiagnosticBuffer, ReaderExit};
use crate::protocol::{Accumulator, Frame, FrameKind, FrameWriter, Message, MessageType, Usage};
use crate::query::{Prompt, Query, QueryOptions};
use crate::{env, AppError, Result};

/// Time allowed for the secondary stream to drain after the process exits.
const DIAGNOSTIC_GRACE: Duration = Duration::from_millis(500);

// ── Handler surface ──────────────────────────────────────────────────────────

/// Final record of one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Whether the agent reported success.
    pub success: bool,
    /// Wall-clock time since launch.
    pub duration: Duration,
    /// Aggregate token usage from the result message.
    pub usage: Option<Usage>,
    /// Reported cost.
    pub total_cost_usd: Option<f64>,
    /// Session id announced by the agent.
    pub session_id: Option<String>,
    /// Final text from the result message.
    pub result: Option<String>,
    /// Failure reason, when the execution did not finish normally.
    pub error: Option<String>,
}

/// Receives the messages of one execution as they arrive.
pub trait MessageHandler: Send {
    /// Called once per decoded message, in arrival order.
    ///
    /// # Errors
    ///
    /// A returned error is passed to [`MessageHandler::on_error`]; the
    /// execution continues.
    fn on_message(&mut self, message: &Message) -> Result<()>;

    /// Called with recoverable errors.
    fn on_error(&mut self, error: AppError) {
        warn!(%error, "message handler error");
    }

    /// Called exactly once when the execution ends.
    fn on_complete(&mut self, completion: &Completion);
}

/// Outcome of [`Launcher::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Whether the agent reported success.
    pub success: bool,
    /// Final text: the result message's text, else the assistant text.
    pub text: String,
    /// Every message, in arrival order.
    pub messages: Vec<Arc<Message>>,
    /// Session id announced by the agent.
    pub session_id: Option<String>,
    /// Aggregate token usage.
    pub usage: Option<Usage>,
    /// Reported cost.
    pub total_cost_usd: Option<f64>,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Failure reason.
    pub error: Option<String>,
}

/// [`MessageHandler`] that buffers everything into an [`ExecutionResult`].
#[derive(Debug, Default)]
pub struct ResultCollector {
    messages: Vec<Arc<Message>>,
    assistant_text: String,
    errors: Vec<String>,
    completion: Option<Completion>,
}

impl ResultCollector {
    /// Empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler errors seen so far.
    #[must_use]
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Assemble the result.
    #[must_use]
    pub fn finish(self) -> ExecutionResult {
        let completion = self.completion.unwrap_or_default();
        let text = completion
            .result
            .clone()
            .filter(|text| !text.is_empty())
            .unwrap_or(self.assistant_text);
        ExecutionResult {
            success: completion.success,
            text,
            messages: self.messages,
            session_id: completion.session_id,
            usage: completion.usage,
            total_cost_usd: completion.total_cost_usd,
            duration: completion.duration,
            error: completion.error,
        }
    }
}

impl MessageHandler for ResultCollector {
    fn on_message(&mut self, message: &Message) -> Result<()> {
        if let Message::Assistant(assistant) = message {
            self.assistant_text.push_str(&assistant.text());
        }
        self.messages.push(Arc::new(message.clone()));
        Ok(())
    }

    fn on_error(&mut self, error: AppError) {
        self.errors.push(error.to_string());
    }

    fn on_complete(&mut self, completion: &Completion) {
        self.completion = Some(completion.clone());
    }
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Per-call settings layered over the global config.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Working directory for the agent.
    pub working_dir: Option<PathBuf>,
    /// Deadline; `timeouts.execution_seconds` when unset.
    pub timeout: Option<Duration>,
    /// Extra environment variables; win over `[env]`.
    pub env: HashMap<String, String>,
    /// Agent options layered over `[agent]`.
    pub agent: AgentOptions,
}

// ── Launcher ─────────────────────────────────────────────────────────────────

/// Launches and drives agent processes.
#[derive(Clone)]
pub struct Launcher {
    discovery: Arc<CliDiscovery>,
    config: Arc<GlobalConfig>,
    decider: Option<Arc<dyn PermissionDecider>>,
}

impl Debug for Launcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("has_decider", &self.decider.is_some())
            .finish_non_exhaustive()
    }
}

enum Stop {
    Terminal(bool),
    Exited(Result<ExitInfo>),
    TimedOut,
    Cancelled,
}

impl Launcher {
    /// Create from `config`, with its own discovery cache.
    #[must_use]
    pub fn new(config: GlobalConfig) -> Self {
        let discovery = Arc::new(CliDiscovery::new(config.cli.clone()));
        Self {
            discovery,
            config: Arc::new(config),
            decider: None,
        }
    }

    /// Share an existing discovery cache.
    #[must_use]
    pub fn with_discovery(mut self, discovery: Arc<CliDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Answer permission prompts with `decider`.
    #[must_use]
    pub fn with_decider(mut self, decider: Arc<dyn PermissionDecider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    async fn prepare(
        &self,
        input: InputMode,
        options: &ExecutionOptions,
        permission_prompt: bool,
    ) -> Result<LaunchSpec> {
        let installation = self.discovery.resolve().await?;
        let agent = self.config.agent.overlay(&options.agent);
        let args = ArgumentBuilder::new(&agent)
            .input(input)
            .permission_prompt_tool(permission_prompt)
            .build()?;
        let env = env::merge(
            env::merge(env::from_process(), self.config.env.clone()),
            options.env.clone(),
        );
        Ok(LaunchSpec {
            program: installation.path,
            args,
            working_dir: options.working_dir.clone(),
            env,
        })
    }

    /// Run `prompt` to completion and collect the result.
    ///
    /// An agent-reported failure is returned as `Ok` with
    /// `success == false`.
    ///
    /// # Errors
    ///
    /// See [`Launcher::execute_with_handler`].
    pub async fn execute(
        &self,
        prompt: &str,
        options: ExecutionOptions,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let mut collector = ResultCollector::new();
        self.execute_with_handler(prompt, options, &mut collector, cancel)
            .await?;
        Ok(collector.finish())
    }

    /// Run `prompt`, streaming messages to `handler`.
    ///
    /// # Errors
    ///
    /// - [`AppError::Discovery`], [`AppError::Config`],
    ///   [`AppError::InvalidPath`] or [`AppError::Launch`] before anything
    ///   runs.
    /// - [`AppError::Execution`] if the agent exits non-zero without a
    ///   result; the message is its diagnostic output when there is any.
    /// - [`AppError::Timeout`] when the deadline passes.
    /// - [`AppError::Cancelled`] when `cancel` fires.
    pub async fn execute_with_handler(
        &self,
        prompt: &str,
        options: ExecutionOptions,
        handler: &mut dyn MessageHandler,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.timeouts.execution());
        let spec = self
            .prepare(
                InputMode::Print(prompt.to_owned()),
                &options,
                self.decider.is_some(),
            )
            .await?;

        let mut process = AgentProcess::spawn(&spec)?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| AppError::Launch("agent stdout unavailable".into()))?;
        let stderr = process.take_stderr();
        let writer = match (process.take_stdin(), &self.decider) {
            (Some(stdin), Some(_)) => FrameWriter::new(stdin),
            // Dropping stdin gives the agent EOF on its input right away.
            _ => FrameWriter::detached(),
        };

        let scope = cancel.child_token();
        let control = Arc::new(ControlChannel::new(self.config.timeouts.control_request()));
        let bridge = PermissionBridge::new(
            self.decider.clone(),
            Arc::clone(&control),
            writer.clone(),
            scope.clone(),
        );
        let diagnostics = DiagnosticBuffer::new();

        let (frame_tx, mut frames) = mpsc::channel(self.config.channels.frame_capacity);
        let reader = tokio::spawn(run_reader("stdout", stdout, frame_tx.clone(), scope.clone()));
        let mut diagnostic_reader = stderr.map(|stderr| {
            tokio::spawn(run_diagnostic_reader(
                stderr,
                Some(frame_tx.clone()),
                diagnostics.clone(),
                scope.clone(),
            ))
        });
        drop(frame_tx);

        let accumulator = Accumulator::new();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut permission_tasks = JoinSet::new();
        let mut output_closed = false;

        let stop = loop {
            let frame = tokio::select! {
                biased;
                () = cancel.cancelled() => break Stop::Cancelled,
                () = &mut deadline => break Stop::TimedOut,
                Some(joined) = permission_tasks.join_next(), if !permission_tasks.is_empty() => {
                    log_task_exit(joined);
                    continue;
                }
                // Both output streams are gone; the reap still races the
                // deadline and cancellation.
                waited = process.wait(), if output_closed => break Stop::Exited(waited),
                frame = frames.recv(), if !output_closed => match frame {
                    Some(frame) => frame,
                    None => {
                        debug!("launcher: output streams closed, waiting for exit");
                        output_closed = true;
                        continue;
                    }
                },
            };

            match frame.kind() {
                FrameKind::ControlResponse | FrameKind::CancelNotification => {
                    if let Err(e) = control.handle_control_message(&frame) {
                        debug!(error = %e, "launcher: malformed control frame dropped");
                    }
                }
                FrameKind::ControlRequest => {
                    bridge.spawn(frame, &mut permission_tasks);
                }
                FrameKind::Data(_) | FrameKind::Unknown => {
                    let outcome = accumulator.feed(frame);
                    for message in &outcome.emitted {
                        if let Err(e) = handler.on_message(message) {
                            handler.on_error(e);
                        }
                    }
                    if outcome.terminal {
                        break Stop::Terminal(outcome.success);
                    }
                }
            }
        };

        let result = match stop {
            Stop::Terminal(success) => {
                info!(success, "agent reported terminal result");
                let mut completion = completion_from(&accumulator, started.elapsed());
                completion.success = success;
                handler.on_complete(&completion);
                stop_process(&mut process, &scope, &mut frames).await;
                Ok(())
            }
            Stop::Exited(waited) => {
                if let Some(task) = diagnostic_reader.take() {
                    let _ = tokio::time::timeout(DIAGNOSTIC_GRACE, task).await;
                }
                let mut completion = completion_from(&accumulator, started.elapsed());
                match waited {
                    Ok(exit) if exit.success => {
                        completion.success = true;
                        handler.on_complete(&completion);
                        Ok(())
                    }
                    Ok(exit) => {
                        let reason = failure_reason(&diagnostics, exit);
                        warn!(status = %exit, reason = reason.as_str(), "agent execution failed");
                        completion.error = Some(reason.clone());
                        handler.on_complete(&completion);
                        Err(AppError::Execution(reason))
                    }
                    Err(e) => {
                        completion.error = Some(e.message().to_owned());
                        handler.on_complete(&completion);
                        Err(e)
                    }
                }
            }
            stop @ (Stop::TimedOut | Stop::Cancelled) => {
                let err = if matches!(stop, Stop::TimedOut) {
                    AppError::Timeout(format!("execution timed out after {}s", timeout.as_secs()))
                } else {
                    AppError::Cancelled("execution cancelled".into())
                };
                warn!(error = %err, "stopping agent execution");
                stop_process(&mut process, &scope, &mut frames).await;
                let mut completion = completion_from(&accumulator, started.elapsed());
                completion.error = Some(err.message().to_owned());
                handler.on_complete(&completion);
                Err(err)
            }
        };

        scope.cancel();
        control.close();
        if let Err(e) = writer.close().await {
            debug!(error = %e, "launcher: input stream shutdown failed");
        }
        while let Some(joined) = permission_tasks.join_next().await {
            log_task_exit(joined);
        }
        join_reader(reader).await;
        if let Some(task) = diagnostic_reader {
            join_reader(task).await;
        }
        result
    }

    /// Start an interactive conversation.
    ///
    /// A non-zero process exit is pushed into the query's error feed before
    /// the query reports done.
    ///
    /// # Errors
    ///
    /// - [`AppError::Config`] for a streaming prompt without a decider, or
    ///   invalid agent options.
    /// - Discovery and launch failures.
    pub async fn query(
        &self,
        prompt: Prompt,
        options: ExecutionOptions,
        abort: Option<CancellationToken>,
    ) -> Result<QueryHandle> {
        let streaming = prompt.is_stream();
        if streaming && self.decider.is_none() {
            return Err(AppError::Config(
                "stream prompt requires a permission decider".into(),
            ));
        }
        let spec = self
            .prepare(
                InputMode::StreamJson,
                &options,
                streaming && self.decider.is_some(),
            )
            .await?;

        let mut process = AgentProcess::spawn(&spec)?;
        let stdin = process
            .take_stdin()
            .ok_or_else(|| AppError::Launch("agent stdin unavailable".into()))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| AppError::Launch("agent stdout unavailable".into()))?;
        let stderr = process.take_stderr();
        let supervisor = supervise(process);

        let process_done = CancellationToken::new();
        let mut query_options =
            QueryOptions::from_config(&self.config).with_process_done(process_done.clone());
        if let Some(decider) = &self.decider {
            query_options = query_options.with_decider(Arc::clone(decider));
        }
        if let Some(abort) = abort {
            query_options = query_options.with_abort(abort);
        }
        if let Some(stderr) = stderr {
            query_options = query_options.with_stderr(stderr);
        }

        let query = match Query::new(stdin, stdout, prompt, query_options) {
            Ok(query) => query,
            Err(e) => {
                let _ = supervisor.shutdown().await;
                return Err(e);
            }
        };

        let exited = supervisor.exited();
        let status = supervisor.subscribe();
        let reporter = query.error_reporter();
        let diagnostics = query.diagnostic_buffer();
        tokio::spawn(async move {
            exited.cancelled().await;
            let exit = *status.borrow();
            if let Some(exit) = exit.filter(|exit| !exit.success) {
                reporter.report(AppError::Execution(failure_reason(&diagnostics, exit)));
            }
            process_done.cancel();
        });

        Ok(QueryHandle {
            query,
            supervisor: Some(supervisor),
        })
    }
}

/// A [`Query`] plus the process behind it.
///
/// Dropping the handle kills the process.
#[derive(Debug)]
pub struct QueryHandle {
    query: Query,
    supervisor: Option<ProcessSupervisor>,
}

impl QueryHandle {
    /// The conversation.
    #[must_use]
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// OS process id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.as_ref().and_then(ProcessSupervisor::id)
    }

    /// Exit state, once reaped.
    #[must_use]
    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.supervisor
            .as_ref()
            .and_then(ProcessSupervisor::exit_info)
    }

    /// Close the query, then kill and reap the process. Idempotent.
    ///
    /// # Errors
    ///
    /// [`AppError::Io`] if the process could not be reaped.
    pub async fn close(&mut self) -> Result<Option<ExitInfo>> {
        self.query.close().await;
        match self.supervisor.take() {
            Some(supervisor) => supervisor.shutdown().await.map(Some),
            None => Ok(None),
        }
    }
}

impl Drop for QueryHandle {
    fn drop(&mut self) {
        if let Some(supervisor) = &self.supervisor {
            supervisor.kill();
        }
    }
}

fn completion_from(accumulator: &Accumulator, duration: Duration) -> Completion {
    let result = accumulator
        .messages_by_type(MessageType::Result)
        .last()
        .and_then(|message| message.as_result().cloned());
    Completion {
        success: false,
        duration,
        usage: result.as_ref().and_then(|r| r.usage),
        total_cost_usd: result.as_ref().map(|r| r.total_cost_usd),
        session_id: accumulator.session_id(),
        result: result.and_then(|r| r.result),
        error: None,
    }
}

fn failure_reason(diagnostics: &DiagnosticBuffer, exit: ExitInfo) -> String {
    let text = diagnostics.text();
    if text.is_empty() {
        exit.to_string()
    } else {
        text
    }
}

/// Kill, release the pipes, discard buffered frames, reap.
async fn stop_process(
    process: &mut AgentProcess,
    scope: &CancellationToken,
    frames: &mut mpsc::Receiver<Frame>,
) {
    if let Err(e) = process.kill() {
        warn!(error = %e, "launcher: kill failed");
    }
    scope.cancel();
    let mut discarded = 0usize;
    while frames.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!(discarded, "launcher: buffered frames discarded");
    }
    match process.wait().await {
        Ok(exit) => debug!(status = %exit, "launcher: agent reaped"),
        Err(e) => warn!(error = %e, "launcher: reaping agent failed"),
    }
}

fn log_task_exit(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "launcher: permission task failed");
    }
}

async fn join_reader(task: JoinHandle<ReaderExit>) {
    match task.await {
        Ok(exit) => debug!(?exit, "launcher: reader finished"),
        Err(e) => warn!(error = %e, "launcher: reader task failed"),
    }
}
