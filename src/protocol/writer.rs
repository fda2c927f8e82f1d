//! Outbound side of an agent stream.
//!
//! [`FrameWriter`] serialises JSON values as NDJSON lines onto the agent's
//! input stream. It is cheap to clone; every clone writes through the same
//! sink, so control replies, interrupts and prompt messages from different
//! tasks never interleave mid-line.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{AppError, Result};

type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared NDJSON writer over the agent's input stream.
#[derive(Clone)]
pub struct FrameWriter {
    sink: Arc<Mutex<Option<Sink>>>,
}

impl Debug for FrameWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}

impl FrameWriter {
    /// Wrap an input stream.
    pub fn new<W>(sink: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Some(Box::new(sink)))),
        }
    }

    /// A writer whose stream is already closed; every write fails.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Write one value as a single `\n`-terminated line and flush.
    ///
    /// # Errors
    ///
    /// - [`AppError::Closed`] once [`FrameWriter::close`] has run.
    /// - [`AppError::Io`]`("write failed: …")` if the stream is broken.
    pub async fn write_frame(&self, value: &Value) -> Result<()> {
        let mut bytes = serde_json::to_vec(value)
            .map_err(|e| AppError::Protocol(format!("failed to serialise outbound frame: {e}")))?;
        bytes.push(b'\n');

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(AppError::Closed("input stream is closed".into()));
        };
        sink.write_all(&bytes).await.map_err(|e| {
            warn!(error = %e, "frame writer: write to input stream failed");
            AppError::Io(format!("write failed: {e}"))
        })?;
        sink.flush()
            .await
            .map_err(|e| AppError::Io(format!("flush failed: {e}")))
    }

    /// Shut down and drop the stream. Idempotent.
    ///
    /// # Errors
    ///
    /// [`AppError::Io`] if the shutdown itself fails; the stream is dropped
    /// regardless.
    pub async fn close(&self) -> Result<()> {
        let taken = self.sink.lock().await.take();
        if let Some(mut sink) = taken {
            debug!("frame writer: closing input stream");
            sink.shutdown()
                .await
                .map_err(|e| AppError::Io(format!("shutdown failed: {e}")))?;
        }
        Ok(())
    }

    /// Whether the stream has been closed.
    pub async fn is_closed(&self) -> bool {
        self.sink.lock().await.is_none()
    }
}

/// Prompt writer task: drains an external producer into the input stream.
///
/// Exits when `cancel` fires, when the producer hangs up, or on the first
/// failed write. The stream is left open on exit; its owner closes it.
///
/// # Errors
///
/// Propagates the failed write.
pub async fn pump_prompts(
    writer: FrameWriter,
    mut prompts: mpsc::Receiver<Value>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("prompt writer: cancellation received, stopping");
                break;
            }

            next = prompts.recv() => {
                let Some(value) = next else {
                    debug!("prompt writer: producer closed, stopping");
                    break;
                };
                writer.write_frame(&value).await?;
            }
        }
    }

    Ok(())
}
