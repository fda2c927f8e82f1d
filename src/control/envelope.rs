//! Control envelope shapes and builders.
//!
//! ```text
//! → {"type":"control_request","request_id":"req_…","request":{"subtype":"interrupt"}}
//! ← {"type":"control_response","response":{"request_id":"req_…","subtype":"success","response":{…}}}
//! ← {"type":"control_response","response":{"request_id":"req_…","subtype":"error","error":"…"}}
//! ← {"type":"cancel_notification","cancel_id":"req_…"}
//! ```

use serde_json::{json, Map, Value};

use crate::protocol::frame::Frame;
use crate::{AppError, Result};

/// Subtype of the tool-permission request.
pub const SUBTYPE_CAN_USE_TOOL: &str = "can_use_tool";

/// Subtype of the interrupt request.
pub const SUBTYPE_INTERRUPT: &str = "interrupt";

/// A control request in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRequest {
    /// Correlation id; empty until assigned.
    pub request_id: String,
    /// Request body, always carrying `subtype`.
    pub request: Map<String, Value>,
}

impl ControlRequest {
    /// A request of the given subtype with no id yet.
    #[must_use]
    pub fn new(subtype: &str) -> Self {
        let mut request = Map::new();
        request.insert("subtype".into(), Value::String(subtype.to_owned()));
        Self {
            request_id: String::new(),
            request,
        }
    }

    /// Ask the agent to stop its current turn.
    #[must_use]
    pub fn interrupt() -> Self {
        Self::new(SUBTYPE_INTERRUPT)
    }

    /// Ask whether `tool_name` may run with `input`.
    #[must_use]
    pub fn permission(tool_name: &str, input: Value) -> Self {
        Self::new(SUBTYPE_CAN_USE_TOOL)
            .with_field("tool_name", Value::String(tool_name.to_owned()))
            .with_field("input", input)
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Add a field to the request body.
    #[must_use]
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.request.insert(key.to_owned(), value);
        self
    }

    /// Request subtype.
    #[must_use]
    pub fn subtype(&self) -> &str {
        self.str_field("subtype").unwrap_or_default()
    }

    /// A body field.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.request.get(key)
    }

    /// A body field that is a string.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.request.get(key).and_then(Value::as_str)
    }

    /// Wire representation.
    #[must_use]
    pub fn to_value(&self) -> Value {
        json!({
            "type": "control_request",
            "request_id": self.request_id,
            "request": self.request,
        })
    }

    /// Decode an inbound `control_request` frame.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] if `request_id` or the `request` object is
    /// missing.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let request_id = frame
            .str_field("request_id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Protocol("control request without request_id".into()))?;
        let request = frame
            .field("request")
            .and_then(Value::as_object)
            .ok_or_else(|| AppError::Protocol("control request without request body".into()))?;
        Ok(Self {
            request_id: request_id.to_owned(),
            request: request.clone(),
        })
    }
}

/// A reply to a control request.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlResponse {
    /// The request was carried out.
    Success {
        /// Correlation id.
        request_id: String,
        /// Subtype-specific payload.
        payload: Value,
    },
    /// The request failed.
    Error {
        /// Correlation id.
        request_id: String,
        /// Human-readable reason.
        message: String,
    },
}

impl ControlResponse {
    /// Successful reply.
    #[must_use]
    pub fn success(request_id: impl Into<String>, payload: Value) -> Self {
        Self::Success {
            request_id: request_id.into(),
            payload,
        }
    }

    /// Failed reply.
    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            request_id: request_id.into(),
            message: message.into(),
        }
    }

    /// Correlation id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Success { request_id, .. } | Self::Error { request_id, .. } => request_id,
        }
    }

    /// Whether this is a success reply.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Wire representation. Error replies carry the reason under both
    /// `error` and `message`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let response = match self {
            Self::Success {
                request_id,
                payload,
            } => json!({
                "subtype": "success",
                "request_id": request_id,
                "response": payload,
            }),
            Self::Error {
                request_id,
                message,
            } => json!({
                "subtype": "error",
                "request_id": request_id,
                "error": message,
                "message": message,
            }),
        };
        json!({
            "type": "control_response",
            "request_id": self.request_id(),
            "response": response,
        })
    }

    /// Decode an inbound `control_response` frame.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] if the `response` object or a request id is
    /// missing.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let response = frame
            .field("response")
            .and_then(Value::as_object)
            .ok_or_else(|| AppError::Protocol("control response without response body".into()))?;
        let request_id = response
            .get("request_id")
            .and_then(Value::as_str)
            .or_else(|| frame.str_field("request_id"))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Protocol("control response without request_id".into()))?
            .to_owned();

        if response.get("subtype").and_then(Value::as_str) == Some("error") {
            let message = ["error", "message"]
                .iter()
                .find_map(|key| response.get(*key).and_then(Value::as_str))
                .unwrap_or("control request failed")
                .to_owned();
            return Ok(Self::Error {
                request_id,
                message,
            });
        }

        Ok(Self::Success {
            request_id,
            payload: response.get("response").cloned().unwrap_or(Value::Null),
        })
    }

    /// Convert to the requester's view.
    ///
    /// # Errors
    ///
    /// [`AppError::Control`] carrying the peer's reason for error replies.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Self::Success { payload, .. } => Ok(payload),
            Self::Error { message, .. } => Err(AppError::Control(message)),
        }
    }
}

/// Request to abort an in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelNotification {
    /// Id of the operation to cancel.
    pub cancel_id: String,
    /// Optional human-readable reason.
    pub reason: Option<String>,
}

impl CancelNotification {
    /// Cancel `cancel_id`.
    #[must_use]
    pub fn new(cancel_id: impl Into<String>) -> Self {
        Self {
            cancel_id: cancel_id.into(),
            reason: None,
        }
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Wire representation.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match &self.reason {
            Some(reason) => json!({
                "type": "cancel_notification",
                "cancel_id": self.cancel_id,
                "reason": reason,
            }),
            None => json!({ "type": "cancel_notification", "cancel_id": self.cancel_id }),
        }
    }

    /// Decode an inbound cancel frame; `control_cancel_request` frames key
    /// the target by `request_id` instead of `cancel_id`.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] if neither id is present.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let cancel_id = frame
            .str_field("cancel_id")
            .or_else(|| frame.str_field("request_id"))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::Protocol("cancel notification without cancel_id".into()))?;
        Ok(Self {
            cancel_id: cancel_id.to_owned(),
            reason: frame.str_field("reason").map(str::to_owned),
        })
    }
}
