//! Correlated control channel.
//!
//! Outbound requests get a one-shot response slot keyed by `request_id` and
//! race the reply against a timeout and a cancellation token. Inbound
//! operations that may later be cancelled register a [`CancellationToken`]
//! as a cancel controller. [`ControlChannel::close`] releases both.
//!
//! The registry lock is a plain [`std::sync::Mutex`]; it is only held for
//! map updates and never across an `.await`.

pub mod envelope;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub use envelope::{CancelNotification, ControlRequest, ControlResponse};

use crate::protocol::frame::{Frame, FrameKind};
use crate::protocol::writer::FrameWriter;
use crate::{AppError, Result};

/// Default bound on how long a request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct Registry {
    pending: HashMap<String, oneshot::Sender<ControlResponse>>,
    controllers: HashMap<String, CancellationToken>,
    closed: bool,
}

/// Request/response correlation and cancellation bookkeeping for one
/// agent connection.
#[derive(Debug)]
pub struct ControlChannel {
    registry: Mutex<Registry>,
    request_timeout: Duration,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl ControlChannel {
    /// Create a channel whose requests default to `request_timeout`.
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            request_timeout,
        }
    }

    /// Default per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// A fresh correlation id.
    #[must_use]
    pub fn generate_request_id() -> String {
        format!("req_{}", Uuid::new_v4().simple())
    }

    /// Send `request` and wait for its reply.
    ///
    /// `timeout` falls back to the channel default. The response slot is
    /// removed on every outcome, including when this future is dropped.
    ///
    /// # Errors
    ///
    /// - [`AppError::Closed`] if the channel is closed before or during the
    ///   wait.
    /// - [`AppError::Control`] if the reply is marked `error`.
    /// - [`AppError::Timeout`] if no reply arrives in time.
    /// - [`AppError::Cancelled`] if `cancel` fires first.
    /// - Write failures from `writer`.
    pub async fn send_request(
        &self,
        mut request: ControlRequest,
        writer: &FrameWriter,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        if request.request_id.is_empty() {
            request.request_id = Self::generate_request_id();
        }
        let request_id = request.request_id.clone();
        let reply = self.register_slot(&request_id)?;
        let _slot = SlotGuard {
            channel: self,
            request_id: &request_id,
        };

        writer.write_frame(&request.to_value()).await?;
        debug!(
            request_id = request_id.as_str(),
            subtype = request.subtype(),
            "control: request sent"
        );

        let timeout = timeout.unwrap_or(self.request_timeout);
        tokio::select! {
            biased;

            answer = reply => match answer {
                Ok(response) => response.into_result(),
                Err(_) => Err(AppError::Closed(format!(
                    "control channel closed while awaiting {request_id}"
                ))),
            },

            () = cancel.cancelled() => {
                Err(AppError::Cancelled(format!("control request {request_id} cancelled")))
            }

            () = tokio::time::sleep(timeout) => {
                Err(AppError::Timeout(format!("control request timeout after {timeout:?}")))
            }
        }
    }

    /// Send `request` without waiting for a reply. Returns the request id.
    ///
    /// # Errors
    ///
    /// [`AppError::Closed`] once the channel is closed, or the write failure.
    pub async fn send_request_async(
        &self,
        mut request: ControlRequest,
        writer: &FrameWriter,
    ) -> Result<String> {
        if self.is_closed() {
            return Err(AppError::Closed("control channel is closed".into()));
        }
        if request.request_id.is_empty() {
            request.request_id = Self::generate_request_id();
        }
        writer.write_frame(&request.to_value()).await?;
        debug!(
            request_id = request.request_id.as_str(),
            subtype = request.subtype(),
            "control: fire-and-forget request sent"
        );
        Ok(request.request_id)
    }

    /// Route an inbound response or cancel notification.
    ///
    /// Unknown ids are ignored.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] if the frame is of another kind or lacks its id.
    pub fn handle_control_message(&self, frame: &Frame) -> Result<()> {
        match frame.kind() {
            FrameKind::ControlResponse => {
                let response = ControlResponse::from_frame(frame)?;
                let request_id = response.request_id().to_owned();
                if !self.deliver(response) {
                    debug!(
                        request_id = request_id.as_str(),
                        "control: response for unknown or expired request dropped"
                    );
                }
                Ok(())
            }
            FrameKind::CancelNotification => {
                let notification = CancelNotification::from_frame(frame)?;
                if !self.cancel(&notification.cancel_id) {
                    debug!(
                        cancel_id = notification.cancel_id.as_str(),
                        "control: cancel for unknown operation ignored"
                    );
                }
                Ok(())
            }
            _ => Err(AppError::Protocol(format!(
                "`{}` is not a control response or cancel notification",
                frame.discriminator()
            ))),
        }
    }

    /// Hand `response` to its waiting requester. Returns `false` if nobody
    /// was waiting.
    pub fn deliver(&self, response: ControlResponse) -> bool {
        let slot = self.lock().pending.remove(response.request_id());
        slot.is_some_and(|tx| tx.send(response).is_ok())
    }

    /// Register a cancel controller for operation `id`.
    ///
    /// A controller already registered under `id` is fired and replaced.
    ///
    /// # Errors
    ///
    /// [`AppError::Closed`] if the channel is closed; `token` is fired
    /// before returning so it cannot outlive the channel.
    pub fn register_cancel_controller(
        &self,
        id: impl Into<String>,
        token: CancellationToken,
    ) -> Result<()> {
        let id = id.into();
        let mut registry = self.lock();
        if registry.closed {
            drop(registry);
            token.cancel();
            return Err(AppError::Closed(format!(
                "control channel is closed; {id} cancelled"
            )));
        }
        if let Some(previous) = registry.controllers.insert(id, token) {
            previous.cancel();
        }
        Ok(())
    }

    /// Remove the controller for `id` without firing it.
    pub fn unregister_cancel_controller(&self, id: &str) -> Option<CancellationToken> {
        self.lock().controllers.remove(id)
    }

    /// Fire and remove the controller for `id`. Returns `false` for unknown
    /// ids.
    pub fn cancel(&self, id: &str) -> bool {
        let token = self.lock().controllers.remove(id);
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Close the channel. Idempotent.
    ///
    /// Waiting requesters observe [`AppError::Closed`]; every registered
    /// cancel controller is fired.
    pub fn close(&self) {
        let (pending, controllers) = {
            let mut registry = self.lock();
            if registry.closed {
                return;
            }
            registry.closed = true;
            (
                std::mem::take(&mut registry.pending),
                std::mem::take(&mut registry.controllers),
            )
        };

        info!(
            pending = pending.len(),
            controllers = controllers.len(),
            "control: channel closed"
        );
        // Dropping the senders wakes every waiter with a receive error.
        drop(pending);
        for token in controllers.into_values() {
            token.cancel();
        }
    }

    /// Whether [`ControlChannel::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of registered cancel controllers.
    #[must_use]
    pub fn registered_controllers(&self) -> usize {
        self.lock().controllers.len()
    }

    // ── Private helpers ───────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_slot(&self, request_id: &str) -> Result<oneshot::Receiver<ControlResponse>> {
        let mut registry = self.lock();
        if registry.closed {
            return Err(AppError::Closed("control channel is closed".into()));
        }
        if registry.pending.contains_key(request_id) {
            return Err(AppError::Control(format!(
                "request id {request_id} is already in flight"
            )));
        }
        let (tx, rx) = oneshot::channel();
        registry.pending.insert(request_id.to_owned(), tx);
        Ok(rx)
    }
}

/// Removes a response slot when the requesting future finishes or is dropped.
struct SlotGuard<'a> {
    channel: &'a ControlChannel,
    request_id: &'a str,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.channel.lock().pending.remove(self.request_id);
    }
}
