//! Unit tests for decision authorities and the permission bridge.
//!
//! Covers:
//! - decision payload shapes
//! - rule policy evaluation order and fallback modes
//! - manual approvals: submit, timeout, unknown ids, cancellation
//! - bridge replies for allow, refusal, unsupported subtypes and no decider
//! - bridge shutdown when the reply cannot be written

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use agent_conduit::config::PermissionConfig;
use agent_conduit::control::{ControlChannel, ControlResponse};
use agent_conduit::permission::{
    AllowAll, Decision, FnDecider, ManualApprovals, PermissionBridge, PermissionDecider,
    PermissionMode, PermissionRequest, RulePolicy, DEFAULT_DENY_REASON,
};
use agent_conduit::protocol::{Frame, FrameWriter};
use agent_conduit::AppError;

fn request(id: &str, tool: &str) -> PermissionRequest {
    PermissionRequest {
        request_id: id.to_owned(),
        tool_name: tool.to_owned(),
        input: json!({"command": "ls"}),
        tool_use_id: None,
        received_at: Utc::now(),
    }
}

fn can_use_tool(id: &str, tool: &str) -> Frame {
    Frame::from_value(json!({
        "type": "control_request",
        "request_id": id,
        "request": {"subtype": "can_use_tool", "tool_name": tool, "input": {"command": "ls"}}
    }))
    .expect("frame")
}

fn bridge_over(
    decider: Option<Arc<dyn PermissionDecider>>,
) -> (PermissionBridge, Arc<ControlChannel>, CancellationToken, tokio::io::DuplexStream) {
    let (host, agent) = tokio::io::duplex(16 * 1024);
    let control = Arc::new(ControlChannel::default());
    let scope = CancellationToken::new();
    let bridge = PermissionBridge::new(
        decider,
        Arc::clone(&control),
        FrameWriter::new(host),
        scope.clone(),
    );
    (bridge, control, scope, agent)
}

async fn read_reply(agent: tokio::io::DuplexStream) -> Value {
    let mut lines = BufReader::new(agent).lines();
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("reply must arrive")
        .expect("read")
        .expect("a line");
    serde_json::from_str(&line).expect("reply is json")
}

// ── Decisions ────────────────────────────────────────────────────────────────

/// Allow carries the updated input; deny carries its reason.
#[test]
fn decision_payloads() {
    assert_eq!(
        Decision::allow(json!({"a": 1})).to_payload(),
        json!({"behavior": "allow", "updatedInput": {"a": 1}})
    );
    assert_eq!(
        Decision::deny("nope").to_payload(),
        json!({"behavior": "deny", "message": "nope"})
    );
}

/// An empty denial reason is replaced by the default.
#[test]
fn empty_deny_reason_uses_default() {
    assert_eq!(
        Decision::deny(""),
        Decision::Deny {
            reason: DEFAULT_DENY_REASON.to_owned()
        }
    );
}

/// `AllowAll` approves with the original input.
#[tokio::test]
async fn allow_all_approves_unchanged() {
    let decision = AllowAll
        .decide(request("r1", "Bash"), CancellationToken::new())
        .await
        .expect("decide");
    assert_eq!(decision, Decision::allow(json!({"command": "ls"})));
}

// ── Rule policy ──────────────────────────────────────────────────────────────

/// Deny list, then allow list, then the fallback mode.
#[tokio::test]
async fn rule_policy_evaluation_order() {
    let policy = RulePolicy::new(PermissionMode::Deny)
        .with_allowed(["Read", "mcp__github__*"])
        .with_denied(["Bash"]);

    let bash = policy
        .decide(request("r1", "Bash"), CancellationToken::new())
        .await
        .expect("decide");
    let read = policy
        .decide(request("r2", "Read"), CancellationToken::new())
        .await
        .expect("decide");
    let github = policy
        .decide(request("r3", "mcp__github__list"), CancellationToken::new())
        .await
        .expect("decide");
    let write = policy
        .decide(request("r4", "Write"), CancellationToken::new())
        .await
        .expect("decide");

    assert_eq!(bash, Decision::deny("Tool 'Bash' is blacklisted"));
    assert!(read.is_allowed());
    assert!(github.is_allowed());
    assert_eq!(write, Decision::deny("Tool 'Write' is not in whitelist"));
}

/// Auto mode allows unlisted tools.
#[tokio::test]
async fn auto_mode_allows_unlisted_tools() {
    let policy = RulePolicy::new(PermissionMode::Auto);
    let decision = policy
        .decide(request("r1", "Anything"), CancellationToken::new())
        .await
        .expect("decide");
    assert!(decision.is_allowed());
}

/// Manual mode without an operator denies unlisted tools.
#[tokio::test]
async fn manual_mode_without_operator_denies() {
    let config = PermissionConfig {
        mode: PermissionMode::Manual,
        allow: vec!["Read".into()],
        deny: Vec::new(),
    };
    let policy = RulePolicy::from_config(&config, None);

    let decision = policy
        .decide(request("r1", "Write"), CancellationToken::new())
        .await
        .expect("decide");
    assert!(!decision.is_allowed());
    assert_eq!(policy.evaluate("Read"), Some(true));
}

/// Manual mode parks unlisted tools with the operator queue.
#[tokio::test]
async fn manual_mode_routes_to_operator() {
    let approvals = Arc::new(ManualApprovals::new(Duration::from_secs(5)));
    let policy = Arc::new(RulePolicy::new(PermissionMode::Manual).with_manual(Arc::clone(&approvals)));

    let task = {
        let policy = Arc::clone(&policy);
        tokio::spawn(async move {
            policy
                .decide(request("r1", "Write"), CancellationToken::new())
                .await
        })
    };
    wait_for_parked(&approvals, 1).await;
    approvals
        .submit("r1", false, Some("not today".into()))
        .expect("submit");

    let decision = task.await.expect("join").expect("decide");
    assert_eq!(decision, Decision::deny("not today"));
}

// ── Manual approvals ─────────────────────────────────────────────────────────

async fn wait_for_parked(approvals: &ManualApprovals, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while approvals.pending().len() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("request must be parked in time");
}

/// An approval resolves the parked request with its input.
#[tokio::test]
async fn manual_approval_allows_with_original_input() {
    let approvals = Arc::new(ManualApprovals::new(Duration::from_secs(5)));
    let task = {
        let approvals = Arc::clone(&approvals);
        tokio::spawn(async move {
            approvals
                .decide(request("r1", "Bash"), CancellationToken::new())
                .await
        })
    };
    wait_for_parked(&approvals, 1).await;
    assert_eq!(approvals.pending()[0].tool_name, "Bash");

    approvals.submit("r1", true, None).expect("submit");

    let decision = task.await.expect("join").expect("decide");
    assert_eq!(decision, Decision::allow(json!({"command": "ls"})));
    assert!(approvals.pending().is_empty(), "entry must be removed");
}

/// An unanswered approval denies when the timeout elapses.
#[tokio::test]
async fn manual_approval_times_out_as_denial() {
    let approvals = ManualApprovals::new(Duration::from_millis(10));
    let decision = approvals
        .decide(request("r1", "Bash"), CancellationToken::new())
        .await
        .expect("decide");

    match decision {
        Decision::Deny { reason } => assert!(
            reason.starts_with("approval timed out"),
            "unexpected reason: {reason}"
        ),
        other => panic!("expected a denial, got {other:?}"),
    }
    assert!(approvals.pending().is_empty());
}

/// Submitting for an unknown id is `NotFound`.
#[test]
fn manual_submit_unknown_id_is_not_found() {
    let approvals = ManualApprovals::default();
    let err = approvals.submit("missing", true, None).expect_err("must fail");
    assert!(matches!(err, AppError::NotFound(_)), "got {err:?}");
}

/// Cancelling the request releases the parked entry.
#[tokio::test]
async fn manual_approval_honours_cancellation() {
    let approvals = Arc::new(ManualApprovals::new(Duration::from_secs(5)));
    let cancel = CancellationToken::new();
    let task = {
        let approvals = Arc::clone(&approvals);
        let cancel = cancel.clone();
        tokio::spawn(async move { approvals.decide(request("r1", "Bash"), cancel).await })
    };
    wait_for_parked(&approvals, 1).await;

    cancel.cancel();

    let err = task.await.expect("join").expect_err("must be cancelled");
    assert!(matches!(err, AppError::Cancelled(_)), "got {err:?}");
    assert!(approvals.pending().is_empty());
}

// ── Bridge ───────────────────────────────────────────────────────────────────

/// An allowed tool gets a success reply with the allow payload.
#[tokio::test]
async fn bridge_writes_allow_reply() {
    let (bridge, control, _scope, agent) = bridge_over(Some(Arc::new(AllowAll)));

    let response = bridge.handle(can_use_tool("r1", "Bash")).await.expect("handle");

    assert!(response.is_success());
    let reply = read_reply(agent).await;
    assert_eq!(reply["type"], "control_response");
    assert_eq!(reply["response"]["subtype"], "success");
    assert_eq!(reply["response"]["request_id"], "r1");
    assert_eq!(reply["response"]["response"]["behavior"], "allow");
    assert_eq!(control.registered_controllers(), 0, "controller is unregistered");
}

/// A decider error becomes an error reply carrying the reason.
#[tokio::test]
async fn bridge_writes_refusal_as_error_reply() {
    let decider = FnDecider::new(|_req: PermissionRequest, _cancel: CancellationToken| async {
        Err::<Decision, _>(AppError::Permission("no".into()))
    });
    let (bridge, _control, _scope, agent) = bridge_over(Some(Arc::new(decider)));

    let response = bridge.handle(can_use_tool("r1", "Bash")).await.expect("handle");

    assert_eq!(response, ControlResponse::error("r1", "no"));
    let reply = read_reply(agent).await;
    assert_eq!(reply["response"]["subtype"], "error");
    assert_eq!(reply["response"]["message"], "no");
}

/// Without a decider every permission request is refused.
#[tokio::test]
async fn bridge_without_decider_refuses() {
    let (bridge, _control, _scope, _agent) = bridge_over(None);

    let response = bridge.handle(can_use_tool("r1", "Bash")).await.expect("handle");

    assert_eq!(
        response,
        ControlResponse::error("r1", "permission decider not configured")
    );
}

/// Unknown subtypes get an error reply naming the subtype.
#[tokio::test]
async fn bridge_rejects_unsupported_subtype() {
    let (bridge, _control, _scope, _agent) = bridge_over(Some(Arc::new(AllowAll)));
    let frame = Frame::from_value(json!({
        "type": "control_request",
        "request_id": "r1",
        "request": {"subtype": "hook_callback"}
    }))
    .expect("frame");

    let response = bridge.handle(frame).await.expect("handle");

    assert_eq!(
        response,
        ControlResponse::error("r1", "unsupported control request subtype: hook_callback")
    );
}

/// A request without an id cannot be answered at all.
#[tokio::test]
async fn bridge_rejects_request_without_id() {
    let (bridge, _control, _scope, _agent) = bridge_over(Some(Arc::new(AllowAll)));
    let frame = Frame::from_value(json!({
        "type": "control_request",
        "request": {"subtype": "can_use_tool"}
    }))
    .expect("frame");

    let err = bridge.handle(frame).await.expect_err("must fail");
    assert!(matches!(err, AppError::Protocol(_)), "got {err:?}");
}

/// A failed reply write closes the control channel and the scope.
#[tokio::test]
async fn bridge_shuts_down_when_reply_cannot_be_written() {
    let control = Arc::new(ControlChannel::default());
    let scope = CancellationToken::new();
    let bridge = PermissionBridge::new(
        Some(Arc::new(AllowAll)),
        Arc::clone(&control),
        FrameWriter::detached(),
        scope.clone(),
    );

    let err = bridge
        .handle(can_use_tool("r1", "Bash"))
        .await
        .expect_err("write must fail");

    assert!(matches!(err, AppError::Closed(_)), "got {err:?}");
    assert!(scope.is_cancelled());
    assert!(control.is_closed());
}

/// A cancelled connection scope cancels the pending decision.
#[tokio::test]
async fn bridge_cancels_pending_decision_on_scope_cancel() {
    let decider = FnDecider::new(|_req: PermissionRequest, cancel: CancellationToken| async move {
        cancel.cancelled().await;
        Ok(Decision::allow(Value::Null))
    });
    let (bridge, control, scope, _agent) = bridge_over(Some(Arc::new(decider)));

    let task = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.handle(can_use_tool("r1", "Bash")).await })
    };
    tokio::time::timeout(Duration::from_secs(2), async {
        while control.registered_controllers() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("controller must register");

    scope.cancel();

    let err = task.await.expect("join").expect_err("reply is dropped");
    assert!(matches!(err, AppError::Closed(_)), "got {err:?}");
}
