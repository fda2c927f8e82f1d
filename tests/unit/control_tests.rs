//! Unit tests for the correlated control channel and its envelopes.
//!
//! Covers:
//! - request ids are unique and replies route by id
//! - timeout, cancellation and close each release the waiter
//! - the response slot is removed on every outcome
//! - cancel controllers fire on notification and on close
//! - envelope encoding and decoding, including the cancel alias

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use agent_conduit::control::{
    CancelNotification, ControlChannel, ControlRequest, ControlResponse,
};
use agent_conduit::protocol::{Frame, FrameWriter};
use agent_conduit::AppError;

fn sink_writer() -> FrameWriter {
    FrameWriter::new(tokio::io::sink())
}

async fn wait_for_pending(channel: &ControlChannel, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while channel.pending_requests() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("requests must register in time");
}

// ── Correlation ──────────────────────────────────────────────────────────────

/// Generated ids never repeat.
#[test]
fn generated_request_ids_are_unique() {
    let ids: HashSet<String> = (0..1000)
        .map(|_| ControlChannel::generate_request_id())
        .collect();
    assert_eq!(ids.len(), 1000);
    assert!(ids.iter().all(|id| id.starts_with("req_")));
}

/// Each reply reaches the requester with the matching id, regardless of
/// arrival order.
#[tokio::test]
async fn replies_route_by_request_id() {
    let channel = Arc::new(ControlChannel::new(Duration::from_secs(5)));
    let writer = sink_writer();

    let spawn_request = |id: &'static str| {
        let channel = Arc::clone(&channel);
        let writer = writer.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            channel
                .send_request(
                    ControlRequest::new("mcp_status").with_id(id),
                    &writer,
                    None,
                    &cancel,
                )
                .await
        })
    };
    let first = spawn_request("req_a");
    let second = spawn_request("req_b");
    wait_for_pending(&channel, 2).await;

    let reply_b = Frame::from_value(json!({
        "type": "control_response",
        "response": {"subtype": "success", "request_id": "req_b", "response": {"v": 2}}
    }))
    .expect("frame");
    let reply_a = Frame::from_value(json!({
        "type": "control_response",
        "response": {"subtype": "error", "request_id": "req_a", "error": "bad"}
    }))
    .expect("frame");
    channel.handle_control_message(&reply_b).expect("route b");
    channel.handle_control_message(&reply_a).expect("route a");

    let b = second.await.expect("join b").expect("b succeeds");
    assert_eq!(b, json!({"v": 2}));

    let a = first.await.expect("join a").expect_err("a fails");
    match a {
        AppError::Control(msg) => assert_eq!(msg, "bad"),
        other => panic!("expected Control error, got {other:?}"),
    }
    assert_eq!(channel.pending_requests(), 0);
}

/// A reply for an id nobody waits on is ignored.
#[test]
fn reply_for_unknown_id_is_ignored() {
    let channel = ControlChannel::default();
    let frame = Frame::from_value(json!({
        "type": "control_response",
        "response": {"subtype": "success", "request_id": "req_nobody"}
    }))
    .expect("frame");

    channel
        .handle_control_message(&frame)
        .expect("unknown id is not an error");
    assert!(!channel.deliver(ControlResponse::success("req_nobody", json!(null))));
}

// ── Release paths ────────────────────────────────────────────────────────────

/// With no reply the request fails with a timeout and its slot is gone.
#[tokio::test]
async fn request_times_out_and_releases_slot() {
    let channel = ControlChannel::new(Duration::from_millis(10));
    let cancel = CancellationToken::new();

    let err = channel
        .send_request(ControlRequest::interrupt(), &sink_writer(), None, &cancel)
        .await
        .expect_err("must time out");

    assert!(matches!(err, AppError::Timeout(_)), "got {err:?}");
    assert_eq!(channel.pending_requests(), 0, "slot must be removed");
}

/// Cancellation wins over a long timeout.
#[tokio::test]
async fn cancellation_beats_timeout() {
    let channel = ControlChannel::new(Duration::from_secs(30));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(5)).await;
        trigger.cancel();
    });

    let err = channel
        .send_request(ControlRequest::interrupt(), &sink_writer(), None, &cancel)
        .await
        .expect_err("must be cancelled");

    assert!(matches!(err, AppError::Cancelled(_)), "got {err:?}");
    assert_eq!(channel.pending_requests(), 0);
}

/// Closing the channel releases every waiter with `Closed`.
#[tokio::test]
async fn close_releases_all_waiters() {
    let channel = Arc::new(ControlChannel::new(Duration::from_secs(30)));
    let writer = sink_writer();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let channel = Arc::clone(&channel);
            let writer = writer.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                channel
                    .send_request(ControlRequest::interrupt(), &writer, None, &cancel)
                    .await
            })
        })
        .collect();
    wait_for_pending(&channel, 2).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    channel.close();

    for waiter in waiters {
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must be released promptly")
            .expect("join")
            .expect_err("must fail");
        assert!(matches!(err, AppError::Closed(_)), "got {err:?}");
    }
    assert!(channel.is_closed());
}

/// New requests are refused after close.
#[tokio::test]
async fn request_after_close_is_refused() {
    let channel = ControlChannel::default();
    channel.close();
    channel.close();

    let cancel = CancellationToken::new();
    let err = channel
        .send_request(ControlRequest::interrupt(), &sink_writer(), None, &cancel)
        .await
        .expect_err("must be refused");
    assert!(matches!(err, AppError::Closed(_)), "got {err:?}");

    let err = channel
        .send_request_async(ControlRequest::interrupt(), &sink_writer())
        .await
        .expect_err("must be refused");
    assert!(matches!(err, AppError::Closed(_)), "got {err:?}");
}

/// A failed write surfaces the write error and removes the slot.
#[tokio::test]
async fn write_failure_releases_slot() {
    let channel = ControlChannel::default();
    let cancel = CancellationToken::new();

    let err = channel
        .send_request(
            ControlRequest::interrupt(),
            &FrameWriter::detached(),
            None,
            &cancel,
        )
        .await
        .expect_err("detached writer must fail");

    assert!(matches!(err, AppError::Closed(_)), "got {err:?}");
    assert_eq!(channel.pending_requests(), 0);
}

// ── Cancel controllers ───────────────────────────────────────────────────────

/// A cancel notification fires and removes the matching controller.
#[test]
fn cancel_notification_fires_controller() {
    let channel = ControlChannel::default();
    let token = CancellationToken::new();
    channel
        .register_cancel_controller("op1", token.clone())
        .expect("register");

    let frame = Frame::from_value(json!({"type": "cancel_notification", "cancel_id": "op1"}))
        .expect("frame");
    channel.handle_control_message(&frame).expect("handle");

    assert!(token.is_cancelled());
    assert_eq!(channel.registered_controllers(), 0);
    assert!(!channel.cancel("op1"), "controller is removed after firing");
}

/// The `control_cancel_request` alias keys the target by `request_id`.
#[test]
fn cancel_alias_uses_request_id() {
    let channel = ControlChannel::default();
    let token = CancellationToken::new();
    channel
        .register_cancel_controller("req_9", token.clone())
        .expect("register");

    let frame = Frame::from_value(json!({"type": "control_cancel_request", "request_id": "req_9"}))
        .expect("frame");
    channel.handle_control_message(&frame).expect("handle");

    assert!(token.is_cancelled());
}

/// Re-registering an id fires the previous controller.
#[test]
fn duplicate_registration_fires_previous_controller() {
    let channel = ControlChannel::default();
    let first = CancellationToken::new();
    let second = CancellationToken::new();

    channel.register_cancel_controller("op", first.clone()).expect("first");
    channel.register_cancel_controller("op", second.clone()).expect("second");

    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());
    assert_eq!(channel.registered_controllers(), 1);
}

/// Close fires every controller; late registrations are fired and refused.
#[test]
fn close_fires_controllers_and_refuses_new_ones() {
    let channel = ControlChannel::default();
    let token = CancellationToken::new();
    channel.register_cancel_controller("op", token.clone()).expect("register");

    channel.close();
    assert!(token.is_cancelled());

    let late = CancellationToken::new();
    let err = channel
        .register_cancel_controller("late", late.clone())
        .expect_err("must be refused");
    assert!(matches!(err, AppError::Closed(_)), "got {err:?}");
    assert!(late.is_cancelled(), "refused token must not outlive the channel");
}

/// Unregistering removes without firing.
#[test]
fn unregister_does_not_fire() {
    let channel = ControlChannel::default();
    let token = CancellationToken::new();
    channel.register_cancel_controller("op", token.clone()).expect("register");

    let removed = channel.unregister_cancel_controller("op").expect("present");
    assert!(!removed.is_cancelled());
    assert!(!token.is_cancelled());
}

// ── Envelopes ────────────────────────────────────────────────────────────────

/// Outbound requests carry the type, id and request body.
#[test]
fn request_envelope_shape() {
    let value = ControlRequest::permission("Bash", json!({"command": "ls"}))
        .with_id("req_1")
        .to_value();

    assert_eq!(
        value,
        json!({
            "type": "control_request",
            "request_id": "req_1",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "Bash",
                "input": {"command": "ls"}
            }
        })
    );
}

/// Error replies carry the reason under both `error` and `message`.
#[test]
fn error_response_envelope_shape() {
    let value = ControlResponse::error("req_1", "no").to_value();

    assert_eq!(value["type"], "control_response");
    assert_eq!(value["response"]["subtype"], "error");
    assert_eq!(value["response"]["request_id"], "req_1");
    assert_eq!(value["response"]["error"], "no");
    assert_eq!(value["response"]["message"], "no");
}

/// An inbound error reply with only `message` still yields the reason.
#[test]
fn error_response_decodes_message_field() {
    let frame = Frame::from_value(json!({
        "type": "control_response",
        "response": {"subtype": "error", "request_id": "req_1", "message": "denied"}
    }))
    .expect("frame");

    let response = ControlResponse::from_frame(&frame).expect("decode");
    assert_eq!(response, ControlResponse::error("req_1", "denied"));
}

/// A control request without an id cannot be answered.
#[test]
fn request_without_id_is_rejected() {
    let frame = Frame::from_value(json!({
        "type": "control_request",
        "request": {"subtype": "can_use_tool"}
    }))
    .expect("frame");

    let err = ControlRequest::from_frame(&frame).expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(_)), "got {err:?}");
}

/// Cancel notifications include the reason only when set.
#[test]
fn cancel_notification_envelope_shape() {
    assert_eq!(
        CancelNotification::new("req_1").to_value(),
        json!({"type": "cancel_notification", "cancel_id": "req_1"})
    );
    assert_eq!(
        CancelNotification::new("req_1").with_reason("user").to_value()["reason"],
        "user"
    );
}
