//! Host-facing handle over one agent conversation.
//!
//! A [`Query`] owns the background tasks that drive the conversation:
//!
//! | Task | Ends on |
//! |------|---------|
//! | frame reader | output EOF, close, I/O failure |
//! | diagnostic reader | secondary stream EOF, close |
//! | frame pump | frame queue drained, close |
//! | prompt writer | prompt sent or producer hang-up, close, write failure |
//! | abort watcher | abort signal, pump finished |
//!
//! The pump routes each frame by kind: control responses and cancel
//! notifications go to the [`ControlChannel`], inbound control requests to
//! the [`PermissionBridge`], everything else through the [`Accumulator`]
//! into the message feed. A terminal result ends the turn, not the
//! conversation; the pump keeps reading until the output stream ends.
//!
//! Shutdown is signal-then-join: [`Query::close`] cancels the scope,
//! releases every control-channel waiter, closes the input stream and then
//! awaits each task.

pub mod prompt;

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ChannelConfig, GlobalConfig};
use crate::control::{ControlChannel, ControlRequest, DEFAULT_REQUEST_TIMEOUT};
use crate::permission::{PermissionBridge, PermissionDecider};
use crate::protocol::reader::{run_diagnostic_reader, run_reader, DiagnosticBuffer, ReaderExit};
use crate::protocol::writer::pump_prompts;
use crate::protocol::{Accumulator, Frame, FrameKind, FrameWriter, Message};
use crate::{AppError, Result};

pub use prompt::{channel as prompt_channel, user_message, Prompt, PromptSender};

/// Default message feed capacity.
pub const DEFAULT_MESSAGE_CAPACITY: usize = 100;
/// Default error feed capacity.
pub const DEFAULT_ERROR_CAPACITY: usize = 10;
/// Default reader-to-pump queue capacity.
pub const DEFAULT_FRAME_CAPACITY: usize = 64;

type SecondaryStream = Box<dyn AsyncRead + Send + Unpin>;

/// Construction options for a [`Query`].
pub struct QueryOptions {
    /// Answers `can_use_tool` requests. Required for streaming prompts.
    pub decider: Option<Arc<dyn PermissionDecider>>,
    /// External abort signal.
    pub abort: Option<CancellationToken>,
    /// Fires once the agent process has been reaped.
    pub process_done: Option<CancellationToken>,
    /// Secondary (diagnostic/control) stream.
    pub stderr: Option<SecondaryStream>,
    /// Timeout for awaited outbound control requests.
    pub request_timeout: Duration,
    /// Message feed capacity.
    pub message_capacity: usize,
    /// Error feed capacity.
    pub error_capacity: usize,
    /// Reader-to-pump queue capacity.
    pub frame_capacity: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            decider: None,
            abort: None,
            process_done: None,
            stderr: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            message_capacity: DEFAULT_MESSAGE_CAPACITY,
            error_capacity: DEFAULT_ERROR_CAPACITY,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
        }
    }
}

impl Debug for QueryOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptions")
            .field("has_decider", &self.decider.is_some())
            .field("has_abort", &self.abort.is_some())
            .field("has_stderr", &self.stderr.is_some())
            .field("request_timeout", &self.request_timeout)
            .field("message_capacity", &self.message_capacity)
            .field("error_capacity", &self.error_capacity)
            .finish_non_exhaustive()
    }
}

impl QueryOptions {
    /// Timeouts and capacities from `config`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::default()
            .with_request_timeout(config.timeouts.control_request())
            .with_channels(&config.channels)
    }

    /// Attach a decision authority.
    #[must_use]
    pub fn with_decider(mut self, decider: Arc<dyn PermissionDecider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// Attach an external abort signal.
    #[must_use]
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Delay completion until `done` fires after output EOF.
    #[must_use]
    pub fn with_process_done(mut self, done: CancellationToken) -> Self {
        self.process_done = Some(done);
        self
    }

    /// Read the secondary stream too.
    #[must_use]
    pub fn with_stderr<R>(mut self, stderr: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        self.stderr = Some(Box::new(stderr));
        self
    }

    /// Outbound control request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Queue capacities.
    #[must_use]
    pub fn with_channels(mut self, channels: &ChannelConfig) -> Self {
        self.message_capacity = channels.message_capacity;
        self.error_capacity = channels.error_capacity;
        self.frame_capacity = channels.frame_capacity;
        self
    }
}

/// Pushes recoverable errors into a query's error feed.
///
/// Never blocks: when the feed is full the error is logged and dropped.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    slot: Arc<Mutex<Option<mpsc::Sender<AppError>>>>,
}

impl ErrorReporter {
    /// Report `err`. Returns whether it was queued.
    pub fn report(&self, err: AppError) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = slot.as_ref() else {
            debug!(error = %err, "query: error feed closed, dropping error");
            return false;
        };
        match tx.try_send(err) {
            Ok(()) => true,
            Err(TrySendError::Full(err)) => {
                warn!(error = %err, "query: error feed full, dropping error");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn close(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

struct Shared {
    control: Arc<ControlChannel>,
    writer: FrameWriter,
    accumulator: Arc<Accumulator>,
    closed: CancellationToken,
    done: CancellationToken,
    shut_down: AtomicBool,
    messages: tokio::sync::Mutex<Option<mpsc::Receiver<Arc<Message>>>>,
    errors: Mutex<Option<mpsc::Receiver<AppError>>>,
    reporter: ErrorReporter,
    diagnostics: DiagnosticBuffer,
}

impl Shared {
    async fn shutdown(&self, reason: &str) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        self.control.close();
        if let Err(e) = self.writer.close().await {
            debug!(error = %e, "query: input stream shutdown failed");
        }
        self.reporter.close();
        info!(reason, "query closed");
    }
}

/// One agent conversation.
pub struct Query {
    inner: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Debug for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("closed", &self.inner.closed.is_cancelled())
            .field("done", &self.inner.done.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Query {
    /// Start a conversation over established streams.
    ///
    /// Must be called from within a tokio runtime; the reading tasks start
    /// immediately.
    ///
    /// # Errors
    ///
    /// [`AppError::Config`] if `prompt` is a stream and no decider is set.
    pub fn new<W, R>(stdin: W, stdout: R, prompt: Prompt, options: QueryOptions) -> Result<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        if prompt.is_stream() && options.decider.is_none() {
            return Err(AppError::Config(
                "stream prompt requires a permission decider".into(),
            ));
        }

        let (message_tx, message_rx) = mpsc::channel(options.message_capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(options.error_capacity.max(1));
        let (frame_tx, frame_rx) = mpsc::channel(options.frame_capacity.max(1));

        let shared = Arc::new(Shared {
            control: Arc::new(ControlChannel::new(options.request_timeout)),
            writer: FrameWriter::new(stdin),
            accumulator: Arc::new(Accumulator::new()),
            closed: CancellationToken::new(),
            done: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            messages: tokio::sync::Mutex::new(Some(message_rx)),
            errors: Mutex::new(Some(error_rx)),
            reporter: ErrorReporter {
                slot: Arc::new(Mutex::new(Some(error_tx))),
            },
            diagnostics: DiagnosticBuffer::new(),
        });

        let bridge = PermissionBridge::new(
            options.decider,
            Arc::clone(&shared.control),
            shared.writer.clone(),
            shared.closed.clone(),
        );

        let mut tasks = Vec::with_capacity(5);

        if let Some(stderr) = options.stderr {
            let control_tx = frame_tx.clone();
            let diagnostics = shared.diagnostics.clone();
            let cancel = shared.closed.clone();
            tasks.push(tokio::spawn(async move {
                let exit = run_diagnostic_reader(stderr, Some(control_tx), diagnostics, cancel).await;
                debug!(?exit, "query: diagnostic reader finished");
            }));
        }

        let reporter = shared.reporter.clone();
        let cancel = shared.closed.clone();
        tasks.push(tokio::spawn(async move {
            let exit = run_reader("stdout", stdout, frame_tx, cancel).await;
            if let ReaderExit::Failed(reason) = exit {
                reporter.report(AppError::Io(format!("output stream failed: {reason}")));
            }
        }));

        tasks.push(tokio::spawn(pump(
            Arc::clone(&shared),
            frame_rx,
            bridge,
            message_tx,
            options.process_done,
        )));

        tasks.push(spawn_prompt_writer(&shared, prompt));

        if let Some(abort) = options.abort {
            let shared = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    () = abort.cancelled() => {
                        shared.reporter.report(AppError::Cancelled("query aborted".into()));
                        shared.shutdown("aborted").await;
                    }
                    () = shared.done.cancelled() => {}
                }
            }));
        }

        Ok(Self {
            inner: shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Next message; `None` once the query is closed, or the output stream
    /// ended and every buffered message has been returned.
    pub async fn next(&self) -> Option<Arc<Message>> {
        let mut guard = self.inner.messages.lock().await;
        let feed = guard.as_mut()?;
        tokio::select! {
            biased;
            () = self.inner.closed.cancelled() => None,
            message = feed.recv() => message,
        }
    }

    /// A buffered message, without waiting.
    pub fn try_next(&self) -> Option<Arc<Message>> {
        let mut guard = self.inner.messages.try_lock().ok()?;
        guard.as_mut()?.try_recv().ok()
    }

    /// Take the message feed for event-loop consumption. After this,
    /// [`next`](Self::next) returns `None`.
    pub fn take_message_feed(&self) -> Option<mpsc::Receiver<Arc<Message>>> {
        self.inner.messages.try_lock().ok()?.take()
    }

    /// Take the error feed. It ends once the query finishes.
    pub fn take_error_feed(&self) -> Option<mpsc::Receiver<AppError>> {
        self.inner
            .errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Handle for pushing errors into the error feed.
    #[must_use]
    pub fn error_reporter(&self) -> ErrorReporter {
        self.inner.reporter.clone()
    }

    /// Wait until the query has finished for any reason.
    pub async fn done(&self) {
        self.inner.done.cancelled().await;
    }

    /// Token that fires when the query has finished.
    #[must_use]
    pub fn done_token(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    /// Whether the query has finished.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Whether the query was closed, aborted, or lost its input stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Ask the agent to stop the current turn. Does not wait for an answer.
    ///
    /// Returns the request id.
    ///
    /// # Errors
    ///
    /// [`AppError::Closed`] if the control channel or input stream is closed.
    pub async fn interrupt(&self) -> Result<String> {
        self.inner
            .control
            .send_request_async(ControlRequest::interrupt(), &self.inner.writer)
            .await
    }

    /// Send a control request and wait for the agent's answer.
    ///
    /// # Errors
    ///
    /// See [`ControlChannel::send_request`].
    pub async fn send_control_request(&self, request: ControlRequest) -> Result<Value> {
        self.inner
            .control
            .send_request(request, &self.inner.writer, None, &self.inner.closed)
            .await
    }

    /// Conversation state accumulated so far.
    #[must_use]
    pub fn accumulator(&self) -> &Accumulator {
        &self.inner.accumulator
    }

    /// Session id, once the agent has announced one.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner.accumulator.session_id()
    }

    /// The control channel shared by this query.
    #[must_use]
    pub fn control(&self) -> &ControlChannel {
        &self.inner.control
    }

    /// Text captured from the secondary stream.
    #[must_use]
    pub fn diagnostics(&self) -> String {
        self.inner.diagnostics.text()
    }

    /// Shared handle to the secondary-stream buffer.
    #[must_use]
    pub fn diagnostic_buffer(&self) -> DiagnosticBuffer {
        self.inner.diagnostics.clone()
    }

    /// Stop the conversation and wait for every background task. Idempotent.
    pub async fn close(&self) {
        self.inner.shutdown("closed by host").await;
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "query: background task failed");
            }
        }
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        self.inner.closed.cancel();
        self.inner.control.close();
        self.inner.reporter.close();
    }
}

fn spawn_prompt_writer(shared: &Arc<Shared>, prompt: Prompt) -> JoinHandle<()> {
    let writer = shared.writer.clone();
    let reporter = shared.reporter.clone();
    let cancel = shared.closed.clone();
    match prompt {
        Prompt::Text(text) => tokio::spawn(async move {
            let sent = writer.write_frame(&user_message(&text)).await;
            if let Err(e) = sent {
                warn!(error = %e, "query: failed to send prompt");
                reporter.report(e);
            }
            if let Err(e) = writer.close().await {
                debug!(error = %e, "query: input stream shutdown failed");
            }
        }),
        Prompt::Stream(prompts) => tokio::spawn(async move {
            if let Err(e) = pump_prompts(writer, prompts, cancel).await {
                warn!(error = %e, "query: prompt stream failed");
                reporter.report(e);
            }
        }),
    }
}

async fn pump(
    shared: Arc<Shared>,
    mut frames: mpsc::Receiver<Frame>,
    bridge: PermissionBridge,
    message_tx: mpsc::Sender<Arc<Message>>,
    process_done: Option<CancellationToken>,
) {
    let closed = shared.closed.clone();
    let mut permission_tasks = JoinSet::new();

    'frames: loop {
        let frame = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            Some(joined) = permission_tasks.join_next(), if !permission_tasks.is_empty() => {
                log_task_exit(joined);
                continue;
            }
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match frame.kind() {
            FrameKind::ControlResponse | FrameKind::CancelNotification => {
                if let Err(e) = shared.control.handle_control_message(&frame) {
                    debug!(error = %e, "query: malformed control frame dropped");
                }
            }
            FrameKind::ControlRequest => {
                bridge.spawn(frame, &mut permission_tasks);
            }
            FrameKind::Data(_) | FrameKind::Unknown => {
                let outcome = shared.accumulator.feed(frame);
                for message in outcome.emitted {
                    let sent = tokio::select! {
                        biased;
                        () = closed.cancelled() => break 'frames,
                        sent = message_tx.send(message) => sent,
                    };
                    if sent.is_err() {
                        debug!("query: message feed dropped by consumer");
                    }
                }
                if outcome.terminal {
                    debug!(success = outcome.success, "query: turn complete");
                    shared.accumulator.rearm();
                }
            }
        }
    }

    drop(message_tx);
    drop(frames);

    // Bridge tokens are children of `closed`, so this drains promptly on close.
    while let Some(joined) = permission_tasks.join_next().await {
        log_task_exit(joined);
    }

    if let Some(process_done) = process_done {
        tokio::select! {
            () = process_done.cancelled() => {}
            () = closed.cancelled() => {}
        }
    }

    shared.control.close();
    shared.reporter.close();
    shared.done.cancel();
    debug!("query: frame pump finished");
}

fn log_task_exit(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "query: permission task failed");
    }
}
