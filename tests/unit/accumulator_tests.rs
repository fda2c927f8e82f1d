//! Unit tests for the message accumulator.
//!
//! Covers:
//! - session id pinned by the first frame carrying one
//! - tool-use pairing through standalone and embedded tool results
//! - unmatched tool results are still emitted
//! - terminal-once behaviour and re-arming between turns
//! - undecodable frames are dropped

use serde_json::{json, Value};

use agent_conduit::protocol::{Accumulator, Frame, MessageType};

fn frame(value: Value) -> Frame {
    Frame::from_value(value).expect("test frame must be valid")
}

fn assistant_with_tool(session: &str, tool_id: &str) -> Frame {
    frame(json!({
        "type": "assistant",
        "session_id": session,
        "message": {
            "content": [
                {"type": "tool_use", "id": tool_id, "name": "Bash", "input": {"command": "ls"}}
            ]
        }
    }))
}

// ── Session tracking ─────────────────────────────────────────────────────────

/// The first non-empty session id wins; later ids do not replace it.
#[test]
fn session_id_is_sticky() {
    let acc = Accumulator::new();
    acc.feed(frame(json!({"type": "system", "subtype": "init"})));
    assert_eq!(acc.session_id(), None);

    acc.feed(frame(json!({"type": "system", "subtype": "init", "session_id": "s1"})));
    acc.feed(frame(json!({"type": "assistant", "session_id": "s2", "message": {"content": []}})));

    assert_eq!(acc.session_id().as_deref(), Some("s1"));
}

// ── Tool pairing ─────────────────────────────────────────────────────────────

/// A standalone tool result completes the matching tool use.
#[test]
fn standalone_tool_result_completes_tool_use() {
    let acc = Accumulator::new();
    acc.feed(assistant_with_tool("s1", "t1"));

    let pending = acc.pending_tool_use("t1").expect("t1 tracked");
    assert!(!pending.complete, "tool use starts incomplete");
    assert_eq!(pending.name, "Bash");

    acc.feed(frame(json!({
        "type": "tool_result",
        "tool_use_id": "t1",
        "output": "file.txt"
    })));

    let done = acc.pending_tool_use("t1").expect("t1 tracked");
    assert!(done.complete, "result must complete the tool use");
    assert_eq!(
        done.result.and_then(|r| r.output).as_deref(),
        Some("file.txt")
    );
}

/// A `tool_result` block inside a user turn completes the tool use too.
#[test]
fn embedded_tool_result_completes_tool_use() {
    let acc = Accumulator::new();
    acc.feed(assistant_with_tool("s1", "t1"));
    acc.feed(frame(json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]
        }
    })));

    let entry = acc.pending_tool_use("t1").expect("t1 tracked");
    assert!(entry.complete);
}

/// A result for an unknown tool use is emitted but tracks nothing.
#[test]
fn unmatched_tool_result_is_emitted() {
    let acc = Accumulator::new();
    let outcome = acc.feed(frame(json!({
        "type": "tool_result",
        "tool_use_id": "ghost",
        "output": "?"
    })));

    assert_eq!(outcome.emitted.len(), 1, "message still reaches the host");
    assert!(acc.pending_tool_use("ghost").is_none());
}

// ── Terminal handling ────────────────────────────────────────────────────────

/// The result frame is terminal; later frames are ignored until re-armed.
#[test]
fn frames_after_terminal_result_are_ignored() {
    let acc = Accumulator::new();
    let outcome = acc.feed(frame(json!({"type": "result", "subtype": "success"})));
    assert!(outcome.terminal);
    assert!(outcome.success);
    assert!(acc.is_terminal());

    let late = acc.feed(frame(json!({"type": "assistant", "message": {"content": []}})));
    assert!(late.emitted.is_empty(), "post-terminal frame must be dropped");
    assert_eq!(acc.len(), 1);

    acc.rearm();
    let next = acc.feed(frame(json!({"type": "assistant", "message": {"content": []}})));
    assert_eq!(next.emitted.len(), 1, "re-armed accumulator accepts frames");
    assert_eq!(acc.len(), 2, "history survives re-arming");
}

/// A failed result is terminal with `success == false`.
#[test]
fn failed_result_is_terminal_and_unsuccessful() {
    let acc = Accumulator::new();
    let outcome = acc.feed(frame(json!({"type": "result", "subtype": "error_during_execution"})));

    assert!(outcome.terminal);
    assert!(!outcome.success);
}

// ── Robustness ───────────────────────────────────────────────────────────────

/// A data frame with a wrongly-typed field is dropped without state change.
#[test]
fn undecodable_frame_is_dropped() {
    let acc = Accumulator::new();
    let outcome = acc.feed(frame(json!({"type": "result", "duration_ms": "soon"})));

    assert!(outcome.emitted.is_empty());
    assert!(!outcome.terminal);
    assert!(acc.is_empty());
}

/// Unknown discriminators produce no messages.
#[test]
fn unknown_frame_emits_nothing() {
    let acc = Accumulator::new();
    let outcome = acc.feed(frame(json!({"type": "keep_alive"})));
    assert!(outcome.emitted.is_empty());
}

/// History is filterable by type and cleared by `reset`.
#[test]
fn history_by_type_and_reset() {
    let acc = Accumulator::new();
    acc.feed(frame(json!({"type": "system", "session_id": "s1"})));
    acc.feed(assistant_with_tool("s1", "t1"));
    acc.feed(frame(json!({"type": "result", "subtype": "success"})));

    assert_eq!(acc.assistant_messages().len(), 1);
    assert_eq!(acc.messages_by_type(MessageType::Result).len(), 1);
    assert_eq!(acc.messages().len(), 3);

    acc.reset();
    assert!(acc.is_empty());
    assert!(!acc.is_terminal());
    assert_eq!(acc.session_id(), None);
    assert!(acc.tool_uses().is_empty());
}
