//! Message accumulator for one execution.
//!
//! Turns data frames into [`Message`]s, keeps the append-only history,
//! pairs tool uses with their results, and pins the session id the first
//! time a frame carries one.
//!
//! Exactly one task feeds an accumulator. Readers on other tasks get copies;
//! emitted messages are shared as [`Arc<Message>`] and never mutated after
//! they are pushed.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::protocol::frame::{Frame, MessageType};
use crate::protocol::message::{ContentBlock, Message, ToolResultMessage, UserMessage};

/// A tool invocation awaiting (or holding) its result.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolUse {
    /// Tool-use id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Tool arguments.
    pub input: Value,
    /// When the invocation was first seen.
    pub started_at: DateTime<Utc>,
    /// Set once a matching result arrives.
    pub complete: bool,
    /// The matching result.
    pub result: Option<ToolResultMessage>,
}

/// What one [`Accumulator::feed`] call produced.
#[derive(Debug, Clone, Default)]
pub struct FeedOutcome {
    /// Messages emitted by this frame, in order.
    pub emitted: Vec<Arc<Message>>,
    /// The frame was the execution's terminal result.
    pub terminal: bool,
    /// Success flag of the terminal result; `false` when not terminal.
    pub success: bool,
}

#[derive(Debug, Default)]
struct State {
    messages: Vec<Arc<Message>>,
    pending: HashMap<String, PendingToolUse>,
    session_id: Option<String>,
    terminal: bool,
}

/// Accumulates the messages of one execution.
#[derive(Debug, Default)]
pub struct Accumulator {
    state: RwLock<State>,
}

impl Accumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a frame without touching any state.
    ///
    /// Returns the message and whether it opens at least one pending tool
    /// use. Malformed or non-data frames yield `None`.
    #[must_use]
    pub fn decode(frame: Frame) -> Option<(Message, bool)> {
        let discriminator = frame.discriminator().to_owned();
        match Message::from_frame(frame) {
            Ok(message) => {
                let pending = match &message {
                    Message::Assistant(m) => m.tool_uses().next().is_some(),
                    _ => false,
                };
                Some((message, pending))
            }
            Err(e) => {
                debug!(discriminator = discriminator.as_str(), error = %e, "accumulator: dropping undecodable frame");
                None
            }
        }
    }

    /// Feed one frame, in arrival order.
    ///
    /// Frames arriving after the terminal result are ignored until
    /// [`Accumulator::rearm`] is called.
    pub fn feed(&self, frame: Frame) -> FeedOutcome {
        let Some((message, _)) = Self::decode(frame) else {
            return FeedOutcome::default();
        };

        let mut state = self.write();
        if state.terminal {
            debug!(
                message_type = %message.message_type(),
                "accumulator: frame after terminal result ignored"
            );
            return FeedOutcome::default();
        }

        if state.session_id.is_none() {
            if let Some(id) = message.session_id() {
                state.session_id = Some(id.to_owned());
            }
        }

        match &message {
            Message::Assistant(m) => {
                for (id, name, input) in m.tool_uses() {
                    state.pending.insert(
                        id.to_owned(),
                        PendingToolUse {
                            id: id.to_owned(),
                            name: name.to_owned(),
                            input: input.clone(),
                            started_at: m.timestamp,
                            complete: false,
                            result: None,
                        },
                    );
                }
            }
            Message::ToolResult(m) => complete_pending(&mut state.pending, m.clone()),
            Message::User(m) => {
                for result in embedded_tool_results(m) {
                    complete_pending(&mut state.pending, result);
                }
            }
            _ => {}
        }

        let (terminal, success) = match &message {
            Message::Result(r) => (true, r.is_success()),
            _ => (false, false),
        };
        state.terminal |= terminal;

        let message = Arc::new(message);
        state.messages.push(Arc::clone(&message));

        FeedOutcome {
            emitted: vec![message],
            terminal,
            success,
        }
    }

    /// Every emitted message, in order.
    #[must_use]
    pub fn messages(&self) -> Vec<Arc<Message>> {
        self.read().messages.clone()
    }

    /// Emitted messages of one type, in order.
    #[must_use]
    pub fn messages_by_type(&self, message_type: MessageType) -> Vec<Arc<Message>> {
        self.read()
            .messages
            .iter()
            .filter(|m| m.message_type() == message_type)
            .cloned()
            .collect()
    }

    /// Emitted assistant turns, in order.
    #[must_use]
    pub fn assistant_messages(&self) -> Vec<Arc<Message>> {
        self.messages_by_type(MessageType::Assistant)
    }

    /// Snapshot of every tracked tool use.
    #[must_use]
    pub fn tool_uses(&self) -> HashMap<String, PendingToolUse> {
        self.read().pending.clone()
    }

    /// Snapshot of one tracked tool use.
    #[must_use]
    pub fn pending_tool_use(&self, id: &str) -> Option<PendingToolUse> {
        self.read().pending.get(id).cloned()
    }

    /// Session id, once discovered.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.read().session_id.clone()
    }

    /// Whether the terminal result has been observed.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.read().terminal
    }

    /// Number of emitted messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().messages.len()
    }

    /// Whether nothing has been emitted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-open message production after a terminal result.
    ///
    /// Used between turns of a streaming session; history, pending tool
    /// uses and the session id are kept.
    pub fn rearm(&self) {
        self.write().terminal = false;
    }

    /// Drop all state.
    pub fn reset(&self) {
        *self.write() = State::default();
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn complete_pending(pending: &mut HashMap<String, PendingToolUse>, result: ToolResultMessage) {
    match pending.get_mut(&result.tool_use_id) {
        Some(entry) => {
            entry.complete = true;
            entry.result = Some(result);
        }
        None => {
            debug!(
                tool_use_id = result.tool_use_id.as_str(),
                "accumulator: tool result without a known tool use"
            );
        }
    }
}

/// Tool results carried as `tool_result` blocks inside a user turn.
fn embedded_tool_results(message: &UserMessage) -> Vec<ToolResultMessage> {
    let Some(Value::Array(blocks)) = message.message.get("content") else {
        return Vec::new();
    };
    blocks
        .iter()
        .cloned()
        .map(ContentBlock::from_value)
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let (output, content) = match content {
                    Value::String(text) => (Some(text), Vec::new()),
                    Value::Array(items) => (
                        None,
                        items.into_iter().map(ContentBlock::from_value).collect(),
                    ),
                    _ => (None, Vec::new()),
                };
                Some(ToolResultMessage {
                    tool_use_id,
                    output,
                    content,
                    is_error,
                    session_id: message.session_id.clone(),
                    timestamp: message.timestamp,
                })
            }
            _ => None,
        })
        .collect()
}
