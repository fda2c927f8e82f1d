//! Frame decoding and discriminator classification.
//!
//! A frame is one JSON object per line carrying a `type` discriminator.
//! Classification happens once, here, so downstream code matches on
//! [`FrameKind`] instead of comparing strings.
//!
//! | `type`                    | Kind                                  |
//! |---------------------------|---------------------------------------|
//! | `system` … `stream_event` | [`FrameKind::Data`]                   |
//! | `control_request`         | [`FrameKind::ControlRequest`]         |
//! | `control_response`        | [`FrameKind::ControlResponse`]        |
//! | `cancel_notification`     | [`FrameKind::CancelNotification`]     |
//! | `control_cancel_request`  | [`FrameKind::CancelNotification`]     |
//! | *(any other)*             | [`FrameKind::Unknown`]                |

use std::fmt::{Display, Formatter};

use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Discriminators of the data messages the accumulator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Session bootstrap information.
    System,
    /// A model turn with content blocks.
    Assistant,
    /// A user turn echoed by the agent.
    User,
    /// A standalone tool invocation.
    ToolUse,
    /// The output of a tool invocation.
    ToolResult,
    /// The terminal outcome of an execution.
    Result,
    /// Partial streaming output.
    StreamEvent,
}

impl MessageType {
    /// Every data discriminator, in wire order of appearance.
    pub const ALL: [Self; 7] = [
        Self::System,
        Self::Assistant,
        Self::User,
        Self::ToolUse,
        Self::ToolResult,
        Self::Result,
        Self::StreamEvent,
    ];

    /// Wire discriminator for this message type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::Result => "result",
            Self::StreamEvent => "stream_event",
        }
    }

    /// Look up a data discriminator; `None` for anything else.
    #[must_use]
    pub fn from_discriminator(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing class of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Conversation content for the accumulator.
    Data(MessageType),
    /// A control request initiated by the agent.
    ControlRequest,
    /// A reply to one of our control requests.
    ControlResponse,
    /// A request to cancel an in-flight operation.
    CancelNotification,
    /// A discriminator this crate does not know.
    Unknown,
}

impl FrameKind {
    /// Classify a `type` discriminator.
    #[must_use]
    pub fn classify(discriminator: &str) -> Self {
        match discriminator {
            "control_request" => Self::ControlRequest,
            "control_response" => Self::ControlResponse,
            "cancel_notification" | "control_cancel_request" => Self::CancelNotification,
            other => MessageType::from_discriminator(other).map_or(Self::Unknown, Self::Data),
        }
    }

    /// Whether frames of this kind belong to the control channel.
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::ControlRequest | Self::ControlResponse | Self::CancelNotification
        )
    }
}

/// One decoded wire object with its classified kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    kind: FrameKind,
    body: Map<String, Value>,
}

impl Frame {
    /// Parse one line of the stream.
    ///
    /// Returns `Ok(None)` for blank lines.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] if the line is not a JSON object with a string
    /// `type` field.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(trimmed)?;
        Self::from_value(value).map(Some)
    }

    /// Wrap an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] if `value` is not an object with a string `type`.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(body) = value else {
            return Err(AppError::Protocol("frame is not a json object".into()));
        };
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .map(FrameKind::classify)
            .ok_or_else(|| AppError::Protocol("frame has no `type` discriminator".into()))?;
        Ok(Self { kind, body })
    }

    /// Routing class of this frame.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Raw `type` discriminator.
    #[must_use]
    pub fn discriminator(&self) -> &str {
        self.str_field("type").unwrap_or_default()
    }

    /// A top-level field, if present.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// A top-level string field, if present and a string.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// The whole object.
    #[must_use]
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Consume the frame, returning the underlying JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}
