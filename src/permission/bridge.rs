//! Bridge from inbound `can_use_tool` control requests to a
//! [`PermissionDecider`].
//!
//! Every request gets its own cancellation token, derived from the
//! connection scope and registered with the [`ControlChannel`] under the
//! request id, so a `cancel_notification` or a channel close aborts the
//! decision. Replies are fire-and-forget; a reply that cannot be written
//! means the input stream is dead, and the bridge shuts the connection down.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::envelope::SUBTYPE_CAN_USE_TOOL;
use crate::control::{ControlChannel, ControlRequest, ControlResponse};
use crate::permission::{PermissionDecider, PermissionRequest};
use crate::protocol::frame::Frame;
use crate::protocol::writer::FrameWriter;
use crate::{AppError, Result};

/// Answers agent-initiated control requests.
#[derive(Clone)]
pub struct PermissionBridge {
    decider: Option<Arc<dyn PermissionDecider>>,
    control: Arc<ControlChannel>,
    writer: FrameWriter,
    scope: CancellationToken,
}

impl std::fmt::Debug for PermissionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionBridge")
            .field("has_decider", &self.decider.is_some())
            .finish_non_exhaustive()
    }
}

impl PermissionBridge {
    /// Create a bridge.
    ///
    /// `scope` is the connection's cancellation scope: per-request tokens
    /// are its children, and it is cancelled when a reply cannot be written.
    #[must_use]
    pub fn new(
        decider: Option<Arc<dyn PermissionDecider>>,
        control: Arc<ControlChannel>,
        writer: FrameWriter,
        scope: CancellationToken,
    ) -> Self {
        Self {
            decider,
            control,
            writer,
            scope,
        }
    }

    /// Handle `frame` on a task in `tasks` so the frame pump keeps running
    /// while the decision is pending. The owner of `tasks` joins it on
    /// shutdown.
    pub fn spawn(&self, frame: Frame, tasks: &mut JoinSet<()>) {
        let bridge = self.clone();
        tasks.spawn(async move {
            // Failures are logged inside `handle`.
            let _ = bridge.handle(frame).await;
        });
    }

    /// Decide and reply to one inbound control request.
    ///
    /// Returns the reply that was written.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`] if the request
    ///   has no id (nothing can be replied).
    /// - [`AppError::Closed`] if the connection closed while deciding.
    /// - The write failure, after the connection has been shut down.
    pub async fn handle(&self, frame: Frame) -> Result<ControlResponse> {
        let request = ControlRequest::from_frame(&frame).map_err(|e| {
            warn!(error = %e, "permission bridge: unanswerable control request");
            e
        })?;

        let response = match request.subtype() {
            SUBTYPE_CAN_USE_TOOL => self.decide(&request).await,
            other => ControlResponse::error(
                &request.request_id,
                format!("unsupported control request subtype: {other}"),
            ),
        };

        self.reply(response).await
    }

    async fn decide(&self, request: &ControlRequest) -> ControlResponse {
        let request_id = request.request_id.as_str();
        let Some(decider) = &self.decider else {
            return ControlResponse::error(request_id, "permission decider not configured");
        };

        let token = self.scope.child_token();
        if let Err(e) = self
            .control
            .register_cancel_controller(request_id, token.clone())
        {
            return ControlResponse::error(request_id, e.message());
        }

        let permission = PermissionRequest {
            request_id: request_id.to_owned(),
            tool_name: request.str_field("tool_name").unwrap_or_default().to_owned(),
            input: request
                .field("input")
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new())),
            tool_use_id: request.str_field("tool_use_id").map(str::to_owned),
            received_at: Utc::now(),
        };
        let tool_name = permission.tool_name.clone();

        let outcome = tokio::select! {
            biased;
            () = token.cancelled() => None,
            outcome = decider.decide(permission, token.clone()) => Some(outcome),
        };
        self.control.unregister_cancel_controller(request_id);

        match outcome {
            Some(Ok(decision)) if !token.is_cancelled() => {
                info!(
                    request_id,
                    tool = tool_name.as_str(),
                    allowed = decision.is_allowed(),
                    "permission decided"
                );
                ControlResponse::success(request_id, decision.to_payload())
            }
            Some(Err(e)) if !token.is_cancelled() => {
                info!(request_id, tool = tool_name.as_str(), error = %e, "permission refused");
                ControlResponse::error(request_id, e.message())
            }
            _ => {
                info!(request_id, tool = tool_name.as_str(), "permission request cancelled");
                ControlResponse::error(request_id, "request cancelled")
            }
        }
    }

    async fn reply(&self, response: ControlResponse) -> Result<ControlResponse> {
        if self.scope.is_cancelled() {
            debug!(
                request_id = response.request_id(),
                "permission bridge: connection closed, reply dropped"
            );
            return Err(AppError::Closed("connection closed".into()));
        }
        if let Err(e) = self.writer.write_frame(&response.to_value()).await {
            warn!(
                request_id = response.request_id(),
                error = %e,
                "permission bridge: reply write failed, shutting down connection"
            );
            self.control.close();
            self.scope.cancel();
            return Err(e);
        }
        Ok(response)
    }
}
