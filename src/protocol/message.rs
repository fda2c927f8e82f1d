//! Typed conversation messages decoded from data frames.
//!
//! Decoding is lenient: absent fields take their defaults, extra fields are
//! ignored, and content blocks of an unrecognized type are kept verbatim as
//! [`ContentBlock::Opaque`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::protocol::frame::{Frame, FrameKind, MessageType};
use crate::{AppError, Result};

// ── Shared records ────────────────────────────────────────────────────────────

/// Token counters reported by the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Tokens written to the prompt cache.
    pub cache_creation_input_tokens: u64,
    /// Tokens served from the prompt cache.
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Sum of every counter.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }
}

/// A tool invocation the agent was not allowed to perform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PermissionDenial {
    /// Control request that produced the denial.
    pub request_id: Option<String>,
    /// Human-readable reason.
    pub reason: Option<String>,
    /// Denied tool.
    pub tool_name: Option<String>,
    /// Tool-use id of the denied invocation.
    pub tool_use_id: Option<String>,
    /// Input the agent attempted to use.
    pub tool_input: Option<Value>,
}

// ── Content blocks ────────────────────────────────────────────────────────────

/// One block of an assistant turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// A tool invocation requested by the model.
    ToolUse {
        /// Tool-use id used to pair the eventual result.
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        input: Value,
    },
    /// Extended reasoning output.
    Thinking {
        /// Reasoning text.
        thinking: String,
        /// Integrity signature, when the agent provides one.
        signature: Option<String>,
    },
    /// A tool result embedded in a turn.
    ToolResult {
        /// Tool-use id this result answers.
        tool_use_id: String,
        /// Result payload, string or block array.
        content: Value,
        /// Whether the tool failed.
        is_error: bool,
    },
    /// A block type this crate does not model, carried unchanged.
    Opaque(Value),
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KnownBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        signature: Option<String>,
    },
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        is_error: Option<bool>,
    },
}

impl From<KnownBlock> for ContentBlock {
    fn from(block: KnownBlock) -> Self {
        match block {
            KnownBlock::Text { text } => Self::Text { text },
            KnownBlock::ToolUse { id, name, input } => Self::ToolUse { id, name, input },
            KnownBlock::Thinking {
                thinking,
                signature,
            } => Self::Thinking {
                thinking,
                signature,
            },
            KnownBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => Self::ToolResult {
                tool_use_id,
                content,
                is_error: is_error.unwrap_or(false),
            },
        }
    }
}

impl ContentBlock {
    /// Decode one block; anything unrecognized or malformed becomes
    /// [`ContentBlock::Opaque`].
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let known = matches!(
            value.get("type").and_then(Value::as_str),
            Some("text" | "tool_use" | "thinking" | "tool_result")
        );
        if !known {
            return Self::Opaque(value);
        }
        match serde_json::from_value::<KnownBlock>(value.clone()) {
            Ok(block) => block.into(),
            Err(_) => Self::Opaque(value),
        }
    }

    /// Wire representation of this block.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text { text } => json!({ "type": "text", "text": text }),
            Self::ToolUse { id, name, input } => {
                json!({ "type": "tool_use", "id": id, "name": name, "input": input })
            }
            Self::Thinking {
                thinking,
                signature,
            } => match signature {
                Some(sig) => json!({ "type": "thinking", "thinking": thinking, "signature": sig }),
                None => json!({ "type": "thinking", "thinking": thinking }),
            },
            Self::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
                "is_error": is_error,
            }),
            Self::Opaque(value) => value.clone(),
        }
    }

    /// The block's `type` discriminator.
    #[must_use]
    pub fn block_type(&self) -> &str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolUse { .. } => "tool_use",
            Self::Thinking { .. } => "thinking",
            Self::ToolResult { .. } => "tool_result",
            Self::Opaque(value) => value
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }

    /// Text of a [`ContentBlock::Text`] block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_value)
    }
}

// ── Streaming deltas ──────────────────────────────────────────────────────────

/// Incremental payload of a [`StreamEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// Appended text.
    Text(String),
    /// Appended fragment of a tool-input JSON document.
    InputJson(String),
    /// Appended reasoning text.
    Thinking(String),
    /// Any other delta, carried unchanged.
    Opaque(Value),
}

impl Delta {
    fn from_value(value: Value) -> Self {
        let text_of = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_owned);
        let decoded = match value.get("type").and_then(Value::as_str) {
            Some("text_delta") => text_of("text").map(Self::Text),
            Some("input_json_delta") => text_of("partial_json").map(Self::InputJson),
            Some("thinking_delta") => text_of("thinking").map(Self::Thinking),
            _ => None,
        };
        decoded.unwrap_or(Self::Opaque(value))
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Text(text) => json!({ "type": "text_delta", "text": text }),
            Self::InputJson(partial) => {
                json!({ "type": "input_json_delta", "partial_json": partial })
            }
            Self::Thinking(thinking) => json!({ "type": "thinking_delta", "thinking": thinking }),
            Self::Opaque(value) => value.clone(),
        }
    }
}

impl Serialize for Delta {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Delta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_value)
    }
}

/// Partial-output event wrapped by a `stream_event` frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Event kind, e.g. `content_block_delta`.
    #[serde(rename = "type", default)]
    pub event_type: String,
    /// Content block index the event applies to.
    pub index: Option<u32>,
    /// Incremental payload.
    pub delta: Option<Delta>,
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Session bootstrap information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    /// System event kind, usually `init`.
    pub subtype: Option<String>,
    /// Session identifier.
    pub session_id: Option<String>,
    /// Model serving the session.
    pub model: Option<String>,
    /// Agent working directory.
    pub cwd: Option<String>,
    /// Tools available to the agent.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Decode time.
    #[serde(skip_deserializing, default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Inner payload of an assistant turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantBody {
    /// Model-assigned message id.
    pub id: Option<String>,
    /// Model name.
    pub model: Option<String>,
    /// Role, normally `assistant`.
    pub role: Option<String>,
    /// Ordered content blocks.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Why the model stopped.
    pub stop_reason: Option<String>,
    /// Per-turn token usage.
    pub usage: Option<Usage>,
}

/// A model turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    /// Turn payload.
    #[serde(default)]
    pub message: AssistantBody,
    /// Tool use this turn belongs to when emitted by a sub-agent.
    pub parent_tool_use_id: Option<String>,
    /// Session identifier.
    pub session_id: Option<String>,
    /// Agent-assigned event id.
    pub uuid: Option<String>,
    /// Decode time.
    #[serde(skip_deserializing, default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl AssistantMessage {
    /// Concatenated text of every text block.
    #[must_use]
    pub fn text(&self) -> String {
        self.message
            .content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect()
    }

    /// Tool-use blocks as `(id, name, input)`.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.message.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}

/// A user turn echoed by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    /// Either a bare string or a `{role, content}` object.
    #[serde(default)]
    pub message: Value,
    /// Tool use this turn belongs to when emitted by a sub-agent.
    pub parent_tool_use_id: Option<String>,
    /// Session identifier.
    pub session_id: Option<String>,
    /// Agent-assigned event id.
    pub uuid: Option<String>,
    /// Decode time.
    #[serde(skip_deserializing, default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl UserMessage {
    /// Best-effort plain text of the turn.
    #[must_use]
    pub fn text(&self) -> String {
        let content = match &self.message {
            Value::String(text) => return text.clone(),
            Value::Object(map) => map.get("content"),
            _ => None,
        };
        match content {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Array(blocks)) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect(),
            _ => String::new(),
        }
    }
}

/// A standalone tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseMessage {
    /// Tool-use id.
    #[serde(default, alias = "id")]
    pub tool_use_id: String,
    /// Tool name.
    #[serde(default)]
    pub name: String,
    /// Tool arguments.
    #[serde(default)]
    pub input: Value,
    /// Session identifier.
    pub session_id: Option<String>,
    /// Decode time.
    #[serde(skip_deserializing, default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// The output of a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    /// Tool-use id this result answers.
    #[serde(default)]
    pub tool_use_id: String,
    /// Plain-text output, when the agent sends one.
    pub output: Option<String>,
    /// Structured output blocks.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Whether the tool failed.
    #[serde(default)]
    pub is_error: bool,
    /// Session identifier.
    pub session_id: Option<String>,
    /// Decode time.
    #[serde(skip_deserializing, default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Terminal outcome of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    /// Outcome kind: `success`, `error_max_turns`, `error_during_execution`, …
    pub subtype: Option<String>,
    /// Final text produced by the agent.
    pub result: Option<String>,
    /// Explicit failure flag.
    #[serde(default)]
    pub is_error: bool,
    /// Wall-clock duration.
    #[serde(default)]
    pub duration_ms: u64,
    /// Time spent in model API calls.
    #[serde(default)]
    pub duration_api_ms: u64,
    /// Number of model turns.
    #[serde(default)]
    pub num_turns: u32,
    /// Reported cost.
    #[serde(default)]
    pub total_cost_usd: f64,
    /// Aggregate token usage.
    pub usage: Option<Usage>,
    /// Tool invocations that were refused.
    #[serde(default)]
    pub permission_denials: Vec<PermissionDenial>,
    /// Session identifier.
    pub session_id: Option<String>,
    /// Decode time.
    #[serde(skip_deserializing, default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ResultMessage {
    /// `false` when the error flag is set or the subtype names an error.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.is_error
            && !self
                .subtype
                .as_deref()
                .is_some_and(|s| s.starts_with("error"))
    }
}

/// A `stream_event` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEventMessage {
    /// The partial-output event.
    #[serde(default)]
    pub event: StreamEvent,
    /// Tool use this event belongs to when emitted by a sub-agent.
    pub parent_tool_use_id: Option<String>,
    /// Session identifier.
    pub session_id: Option<String>,
    /// Agent-assigned event id.
    pub uuid: Option<String>,
    /// Decode time.
    #[serde(skip_deserializing, default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// A fully decoded conversation message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// See [`SystemMessage`].
    System(SystemMessage),
    /// See [`AssistantMessage`].
    Assistant(AssistantMessage),
    /// See [`UserMessage`].
    User(UserMessage),
    /// See [`ToolUseMessage`].
    ToolUse(ToolUseMessage),
    /// See [`ToolResultMessage`].
    ToolResult(ToolResultMessage),
    /// See [`ResultMessage`].
    Result(ResultMessage),
    /// See [`StreamEventMessage`].
    StreamEvent(StreamEventMessage),
}

impl Message {
    /// Decode a data frame.
    ///
    /// # Errors
    ///
    /// [`AppError::Protocol`] if the frame is not a data frame or its fields
    /// have the wrong shape.
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let FrameKind::Data(message_type) = frame.kind() else {
            return Err(AppError::Protocol(format!(
                "`{}` is not a data message",
                frame.discriminator()
            )));
        };
        let value = frame.into_value();
        let message = match message_type {
            MessageType::System => Self::System(serde_json::from_value(value)?),
            MessageType::Assistant => Self::Assistant(serde_json::from_value(value)?),
            MessageType::User => Self::User(serde_json::from_value(value)?),
            MessageType::ToolUse => Self::ToolUse(serde_json::from_value(value)?),
            MessageType::ToolResult => Self::ToolResult(serde_json::from_value(value)?),
            MessageType::Result => Self::Result(serde_json::from_value(value)?),
            MessageType::StreamEvent => Self::StreamEvent(serde_json::from_value(value)?),
        };
        Ok(message)
    }

    /// Discriminator of this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::System(_) => MessageType::System,
            Self::Assistant(_) => MessageType::Assistant,
            Self::User(_) => MessageType::User,
            Self::ToolUse(_) => MessageType::ToolUse,
            Self::ToolResult(_) => MessageType::ToolResult,
            Self::Result(_) => MessageType::Result,
            Self::StreamEvent(_) => MessageType::StreamEvent,
        }
    }

    /// Session identifier carried by this message, if non-empty.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        let id = match self {
            Self::System(m) => m.session_id.as_deref(),
            Self::Assistant(m) => m.session_id.as_deref(),
            Self::User(m) => m.session_id.as_deref(),
            Self::ToolUse(m) => m.session_id.as_deref(),
            Self::ToolResult(m) => m.session_id.as_deref(),
            Self::Result(m) => m.session_id.as_deref(),
            Self::StreamEvent(m) => m.session_id.as_deref(),
        };
        id.filter(|s| !s.is_empty())
    }

    /// Decode time.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::System(m) => m.timestamp,
            Self::Assistant(m) => m.timestamp,
            Self::User(m) => m.timestamp,
            Self::ToolUse(m) => m.timestamp,
            Self::ToolResult(m) => m.timestamp,
            Self::Result(m) => m.timestamp,
            Self::StreamEvent(m) => m.timestamp,
        }
    }

    /// The terminal outcome, if this is a result message.
    #[must_use]
    pub fn as_result(&self) -> Option<&ResultMessage> {
        match self {
            Self::Result(m) => Some(m),
            _ => None,
        }
    }
}
