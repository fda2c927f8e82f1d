//! Inbound side of an agent stream.
//!
//! [`run_reader`] pumps the primary output stream into a bounded frame queue.
//! [`run_diagnostic_reader`] handles the secondary stream: control frames that
//! show up there are forwarded to the same queue, anything else is kept as
//! diagnostic text for error reporting.
//!
//! Both readers are driven by [`FramedRead`] over [`FrameCodec`], so a line
//! longer than 1 MiB is rejected before any JSON parsing happens.

use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::codec::FrameCodec;
use crate::protocol::frame::Frame;
use crate::AppError;

/// Upper bound on retained diagnostic text; older text is discarded first.
pub const MAX_DIAGNOSTIC_BYTES: usize = 64 * 1024;

/// Why a reader task stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The stream reached end of file.
    Eof,
    /// The cancellation token fired.
    Cancelled,
    /// The frame queue's receiver was dropped.
    ConsumerClosed,
    /// Unrecoverable I/O failure on the stream.
    Failed(String),
}

/// Primary reader task: decodes frames and forwards them in arrival order.
///
/// Blank lines are skipped. Malformed lines and over-long lines are logged
/// and skipped; they never end the task.
pub async fn run_reader<R>(
    stream: &'static str,
    reader: R,
    frame_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
) -> ReaderExit
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, FrameCodec::new());

    loop {
        let item = tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(stream, "reader: cancellation received, stopping");
                return ReaderExit::Cancelled;
            }

            item = framed.next() => item,
        };

        match item {
            None => {
                debug!(stream, "reader: EOF detected");
                return ReaderExit::Eof;
            }

            Some(Err(AppError::Protocol(ref msg))) => {
                warn!(stream, error = msg.as_str(), "reader: framing error, skipping");
            }

            Some(Err(e)) => {
                warn!(stream, error = %e, "reader: IO error, stopping");
                return ReaderExit::Failed(e.to_string());
            }

            Some(Ok(line)) => match Frame::parse(&line) {
                Ok(Some(frame)) => {
                    // Bounded by cancellation so a stalled consumer cannot
                    // pin this task forever.
                    let sent = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return ReaderExit::Cancelled,
                        sent = frame_tx.send(frame) => sent,
                    };
                    if sent.is_err() {
                        debug!(stream, "reader: frame queue closed, stopping");
                        return ReaderExit::ConsumerClosed;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        stream,
                        error = %e,
                        raw_line = %line,
                        "reader: parse error, skipping line"
                    );
                }
            },
        }
    }
}

/// Bounded, shareable buffer of diagnostic text from the secondary stream.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticBuffer {
    text: Arc<Mutex<String>>,
}

impl DiagnosticBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line, discarding the oldest text past
    /// [`MAX_DIAGNOSTIC_BYTES`].
    pub fn push_line(&self, line: &str) {
        let mut text = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        text.push_str(line);
        text.push('\n');
        if text.len() > MAX_DIAGNOSTIC_BYTES {
            let mut cut = text.len() - MAX_DIAGNOSTIC_BYTES;
            while !text.is_char_boundary(cut) {
                cut += 1;
            }
            text.drain(..cut);
        }
    }

    /// Accumulated text, trimmed.
    #[must_use]
    pub fn text(&self) -> String {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trim()
            .to_owned()
    }

    /// Whether nothing has been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text().is_empty()
    }
}

/// Secondary reader task.
///
/// Control frames are forwarded to `control_tx` when one is given; every
/// other line is logged at `DEBUG` and appended to `diagnostics`.
pub async fn run_diagnostic_reader<R>(
    reader: R,
    control_tx: Option<mpsc::Sender<Frame>>,
    diagnostics: DiagnosticBuffer,
    cancel: CancellationToken,
) -> ReaderExit
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, FrameCodec::new());

    loop {
        let item = tokio::select! {
            biased;

            () = cancel.cancelled() => return ReaderExit::Cancelled,

            item = framed.next() => item,
        };

        let line = match item {
            None => return ReaderExit::Eof,
            Some(Err(AppError::Protocol(msg))) => {
                warn!(stream = "stderr", error = msg.as_str(), "reader: framing error, skipping");
                continue;
            }
            Some(Err(e)) => return ReaderExit::Failed(e.to_string()),
            Some(Ok(line)) => line,
        };

        if let Some(tx) = &control_tx {
            if let Ok(Some(frame)) = Frame::parse(&line) {
                if frame.kind().is_control() {
                    let sent = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return ReaderExit::Cancelled,
                        sent = tx.send(frame) => sent,
                    };
                    if sent.is_err() {
                        debug!("diagnostic reader: frame queue closed");
                    }
                    continue;
                }
            }
        }

        debug!(line = line.as_str(), "agent stderr");
        diagnostics.push_line(&line);
    }
}
