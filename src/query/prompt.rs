//! Prompt delivery for a [`Query`](super::Query).

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{AppError, Result};

/// What the agent is asked.
#[derive(Debug)]
pub enum Prompt {
    /// A single user message; the input stream is closed after it.
    Text(String),
    /// User messages written as they arrive; the conversation stays open
    /// until the producer hangs up.
    Stream(mpsc::Receiver<Value>),
}

impl Prompt {
    /// Single-message prompt.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Whether this prompt keeps the input stream open.
    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }
}

/// Frame carrying one user turn.
#[must_use]
pub fn user_message(text: &str) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    })
}

/// Producer half of a streaming prompt.
///
/// Dropping every sender ends the prompt stream; the input stream itself
/// stays open until the query closes it.
#[derive(Debug, Clone)]
pub struct PromptSender {
    tx: mpsc::Sender<Value>,
}

/// Create a streaming prompt with room for `capacity` queued messages.
#[must_use]
pub fn channel(capacity: usize) -> (PromptSender, Prompt) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PromptSender { tx }, Prompt::Stream(rx))
}

impl PromptSender {
    /// Queue a raw frame.
    ///
    /// # Errors
    ///
    /// [`AppError::Closed`] once the query stopped reading prompts.
    pub async fn send(&self, frame: Value) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| AppError::Closed("prompt stream is closed".into()))
    }

    /// Queue one user turn.
    ///
    /// # Errors
    ///
    /// See [`PromptSender::send`].
    pub async fn send_user_message(&self, text: &str) -> Result<()> {
        self.send(user_message(text)).await
    }

    /// Whether the query has stopped reading prompts.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
