//! Unit tests for agent options and the CLI argument builder.
//!
//! Covers:
//! - the fixed output prefix and both input modes
//! - flag order and encoding for every option
//! - root suppression of `--dangerously-skip-permissions`
//! - option validation and layering

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::json;

use agent_conduit::args::{AgentOptions, ArgumentBuilder, InputMode};
use agent_conduit::AppError;

fn build(options: &AgentOptions, input: InputMode) -> Vec<String> {
    ArgumentBuilder::new(options)
        .input(input)
        .running_as_root(false)
        .build()
        .expect("options are valid")
}

// ── Input modes ──────────────────────────────────────────────────────────────

/// Default options in stream-json mode produce only the fixed flags.
#[test]
fn default_stream_json_arguments() {
    let args = build(&AgentOptions::default(), InputMode::StreamJson);

    assert_eq!(
        args,
        [
            "--output-format",
            "stream-json",
            "--verbose",
            "--print",
            "--input-format",
            "stream-json",
        ]
    );
}

/// Print mode appends the trimmed prompt.
#[test]
fn print_mode_appends_trimmed_prompt() {
    let args = build(&AgentOptions::default(), InputMode::Print("  fix it \n".into()));

    assert_eq!(args[args.len() - 2..], ["--print", "fix it"]);
}

/// A blank prompt adds no `--print` at all.
#[test]
fn print_mode_skips_blank_prompt() {
    let args = build(&AgentOptions::default(), InputMode::Print("   ".into()));

    assert!(!args.iter().any(|a| a == "--print"));
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Every option is rendered in its fixed position.
#[test]
fn full_options_render_in_order() {
    let options = AgentOptions {
        model: Some("sonnet".into()),
        fallback_model: Some("haiku".into()),
        system_prompt: Some("be brief".into()),
        append_system_prompt: Some("and kind".into()),
        max_turns: Some(3),
        permission_mode: Some("acceptEdits".into()),
        continue_conversation: true,
        resume: Some("s1".into()),
        allowed_tools: vec!["Read".into(), "Grep".into()],
        disallowed_tools: vec!["Bash".into()],
        mcp_servers: BTreeMap::from([("fs".to_owned(), json!({"command": "mcp-fs"}))]),
        strict_mcp_config: true,
        settings: Some(PathBuf::from("/etc/agent.json")),
        skip_permissions: true,
    };

    let args = ArgumentBuilder::new(&options)
        .input(InputMode::Print("go".into()))
        .permission_prompt_tool(true)
        .running_as_root(false)
        .build()
        .expect("valid");

    let expected = [
        "--output-format",
        "stream-json",
        "--verbose",
        "--model",
        "sonnet",
        "--fallback-model",
        "haiku",
        "--system-prompt",
        "be brief",
        "--append-system-prompt",
        "and kind",
        "--max-turns",
        "3",
        "--permission-prompt-tool",
        "stdio",
        "--permission-mode",
        "acceptEdits",
        "--continue",
        "--resume",
        "s1",
        "--allowedTools",
        "Read,Grep",
        "--disallowedTools",
        "Bash",
        "--mcp-config",
        r#"{"mcpServers":{"fs":{"command":"mcp-fs"}}}"#,
        "--strict-mcp-config",
        "--settings",
        "/etc/agent.json",
        "--dangerously-skip-permissions",
        "--print",
        "go",
    ];
    assert_eq!(args, expected);
}

/// Root never gets `--dangerously-skip-permissions`.
#[test]
fn skip_permissions_is_suppressed_for_root() {
    let options = AgentOptions {
        skip_permissions: true,
        ..AgentOptions::default()
    };

    let args = ArgumentBuilder::new(&options)
        .running_as_root(true)
        .build()
        .expect("valid");

    assert!(!args.iter().any(|a| a == "--dangerously-skip-permissions"));
}

// ── Validation ───────────────────────────────────────────────────────────────

/// A fallback equal to the main model is rejected before building.
#[test]
fn fallback_equal_to_model_is_rejected() {
    let options = AgentOptions {
        model: Some("sonnet".into()),
        fallback_model: Some("sonnet".into()),
        ..AgentOptions::default()
    };

    let err = ArgumentBuilder::new(&options)
        .build()
        .expect_err("must be rejected");

    match err {
        AppError::Config(msg) => assert_eq!(msg, "fallback model cannot be the same as the main model"),
        other => panic!("expected Config error, got {other:?}"),
    }
}

/// Zero turns is rejected.
#[test]
fn zero_max_turns_is_rejected() {
    let options = AgentOptions {
        max_turns: Some(0),
        ..AgentOptions::default()
    };
    assert!(matches!(options.validate(), Err(AppError::Config(_))));
}

// ── Layering ─────────────────────────────────────────────────────────────────

/// Override scalars win, lists extend, flags are or-ed.
#[test]
fn overlay_combines_base_and_overrides() {
    let base = AgentOptions {
        model: Some("sonnet".into()),
        max_turns: Some(5),
        allowed_tools: vec!["Read".into()],
        strict_mcp_config: true,
        ..AgentOptions::default()
    };
    let overrides = AgentOptions {
        model: Some("opus".into()),
        allowed_tools: vec!["Write".into()],
        ..AgentOptions::default()
    };

    let merged = base.overlay(&overrides);

    assert_eq!(merged.model.as_deref(), Some("opus"));
    assert_eq!(merged.max_turns, Some(5), "unset override keeps the base");
    assert_eq!(merged.allowed_tools, ["Read", "Write"]);
    assert!(merged.strict_mcp_config);
}
