//! Wire protocol: NDJSON framing, frame classification, typed messages and
//! per-execution accumulation.
//!
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based line framing.
//! - `frame`: discriminator classification of decoded lines.
//! - `message`: the typed conversation model.
//! - `accumulator`: history, tool-use pairing and session tracking.
//! - `reader` / `writer`: the stream tasks on either side of the process.

pub mod accumulator;
pub mod codec;
pub mod frame;
pub mod message;
pub mod reader;
pub mod writer;

pub use accumulator::{Accumulator, FeedOutcome, PendingToolUse};
pub use frame::{Frame, FrameKind, MessageType};
pub use message::{ContentBlock, Message, ResultMessage, Usage};
pub use writer::FrameWriter;
