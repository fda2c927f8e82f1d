//! Unit tests for the NDJSON line codec.
//!
//! Covers:
//! - single and batched lines
//! - partial delivery buffered until the newline
//! - the 1 MiB line limit
//! - a final unterminated line at EOF

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use agent_conduit::protocol::codec::{FrameCodec, MAX_LINE_BYTES};
use agent_conduit::AppError;

// ── Decoding ─────────────────────────────────────────────────────────────────

/// A complete line is returned without its trailing newline.
#[test]
fn single_line_decodes_without_newline() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"system\"}\n");

    let line = codec.decode(&mut buf).expect("decode must succeed");

    assert_eq!(
        line,
        Some("{\"type\":\"system\"}".to_owned()),
        "codec must strip the newline"
    );
}

/// Two lines in one buffer come out as two items, then nothing.
#[test]
fn batched_lines_decode_one_at_a_time() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"system\"}\n{\"type\":\"result\"}\n");

    let first = codec.decode(&mut buf).expect("first decode");
    let second = codec.decode(&mut buf).expect("second decode");
    let third = codec.decode(&mut buf).expect("third decode");

    assert_eq!(first.as_deref(), Some("{\"type\":\"system\"}"));
    assert_eq!(second.as_deref(), Some("{\"type\":\"result\"}"));
    assert!(third.is_none(), "buffer must be drained");
}

/// A line split across reads is held back until its newline arrives.
#[test]
fn partial_line_is_buffered_until_newline() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from("{\"type\":");

    assert!(
        codec.decode(&mut buf).expect("partial decode").is_none(),
        "incomplete line must not be yielded"
    );

    buf.extend_from_slice(b"\"user\"}\n");
    let line = codec.decode(&mut buf).expect("completed decode");
    assert_eq!(line.as_deref(), Some("{\"type\":\"user\"}"));
}

/// The last line of a stream is yielded even without a newline.
#[test]
fn unterminated_final_line_is_yielded_at_eof() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from("{\"type\":\"result\"}");

    let line = codec.decode_eof(&mut buf).expect("decode_eof");

    assert_eq!(line.as_deref(), Some("{\"type\":\"result\"}"));
}

// ── Limits ───────────────────────────────────────────────────────────────────

/// A line longer than the limit is reported as a protocol error.
#[test]
fn over_long_line_is_a_protocol_error() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(vec![b'a'; MAX_LINE_BYTES + 1].as_slice());
    buf.extend_from_slice(b"\n");

    let err = codec
        .decode(&mut buf)
        .expect_err("over-long line must fail");

    match err {
        AppError::Protocol(msg) => assert!(
            msg.contains("line too long"),
            "unexpected message: {msg}"
        ),
        other => panic!("expected Protocol error, got {other:?}"),
    }
}
