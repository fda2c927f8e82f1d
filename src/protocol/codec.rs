//! NDJSON line codec for agent streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a fixed maximum line length so
//! a runaway or unterminated line from the agent cannot grow the read buffer
//! without bound.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum accepted line length: 1 MiB.
///
/// Longer inbound lines make [`FrameCodec::decode`] return
/// [`AppError::Protocol`] with `"line too long"`; readers treat that as
/// protocol noise and keep going.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited framing for the agent's output streams.
///
/// Each `\n`-terminated UTF-8 string is one frame. Outbound frames are
/// written by [`FrameWriter`](super::FrameWriter).
///
/// ```rust,ignore
/// use tokio_util::codec::FramedRead;
/// use agent_conduit::protocol::codec::FrameCodec;
///
/// let lines = FramedRead::new(child_stdout, FrameCodec::new());
/// ```
#[derive(Debug)]
pub struct FrameCodec(LinesCodec);

impl FrameCodec {
    /// Create a codec with the [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_BYTES))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    /// Yields a final unterminated line when the stream closes.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

// ── Private helper ────────────────────────────────────────────────────────────

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Protocol(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
