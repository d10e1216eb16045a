// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scenario tests for the execution core, driven end-to-end with
//! `ScriptedMockProvider` so every run is deterministic and offline.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use agentuse_model::{ResponseEvent, ScriptedMockProvider};
use agentuse_tools::{BashTool, ToolRegistry};

use crate::context::ContextManager;
use crate::events::{ExecEvent, ExecSummary, FinishReason, TraceKind};
use crate::executor::{ExecOptions, Execution};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn execution(model: ScriptedMockProvider, tools: ToolRegistry, options: ExecOptions) -> Execution {
    Execution {
        model: Arc::new(model),
        tools: Arc::new(tools),
        subagent_names: HashSet::new(),
        options,
        context: ContextManager::new(128_000).with_enabled(false),
        session: None,
    }
}

fn bash_registry(dir: &std::path::Path, patterns: &[&str]) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    reg.register(BashTool::new(
        patterns.iter().map(|s| s.to_string()).collect(),
        dir.to_path_buf(),
    ))
    .unwrap();
    reg
}

fn tool_call_event(id: &str, name: &str, args: &str) -> ResponseEvent {
    ResponseEvent::ToolCall {
        index: 0,
        id: id.into(),
        name: name.into(),
        arguments: args.into(),
    }
}

async fn run_and_collect(
    execution: Execution,
    user: &str,
) -> (ExecSummary, Vec<ExecEvent>) {
    let (tx, mut rx) = mpsc::channel(256);
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let run = tokio::spawn(execution.run(vec!["system".into()], user.to_string(), tx, cancel_rx));
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (run.await.unwrap(), events)
}

/// Every `ToolCall(id)` must be answered by exactly one `ToolResult(id)` or
/// `ToolError(id)` before the next `LlmStart`.
fn assert_call_result_pairing(events: &[ExecEvent]) {
    let mut open: Vec<String> = Vec::new();
    for event in events {
        match event {
            ExecEvent::LlmStart => {
                assert!(open.is_empty(), "unanswered tool calls at LlmStart: {open:?}");
            }
            ExecEvent::ToolCall { id, .. } => open.push(id.clone()),
            ExecEvent::ToolResult { id, .. } | ExecEvent::ToolError { id, .. } => {
                let pos = open
                    .iter()
                    .position(|o| o == id)
                    .unwrap_or_else(|| panic!("result for unknown call {id}"));
                open.remove(pos);
            }
            _ => {}
        }
    }
}

// ── Happy path, no tools ──────────────────────────────────────────────────────

#[tokio::test]
async fn text_only_run_finishes_with_stop_and_zero_steps() {
    let model = ScriptedMockProvider::always_text("hi");
    let exec = execution(model, ToolRegistry::new(), ExecOptions::default());
    let (summary, events) = run_and_collect(exec, "Say hi").await;

    assert_eq!(summary.finish_reason, "stop");
    assert_eq!(summary.text, "hi");
    let tool_steps = summary
        .tool_calls
        .iter()
        .filter(|t| t.kind == TraceKind::Tool)
        .count();
    assert_eq!(tool_steps, 0);

    assert!(matches!(events.first(), Some(ExecEvent::LlmStart)));
    assert!(events.iter().any(|e| matches!(e, ExecEvent::LlmFirstToken)));
    assert!(events
        .iter()
        .any(|e| matches!(e, ExecEvent::Text(t) if t == "hi")));
    assert!(matches!(
        events.last(),
        Some(ExecEvent::Finish { reason: FinishReason::Stop, .. })
    ));
}

// ── One tool call round-trip ──────────────────────────────────────────────────

#[tokio::test]
async fn bash_tool_loop_executes_and_feeds_result_back() {
    let tmp = tempfile::tempdir().unwrap();
    let model = ScriptedMockProvider::new(vec![
        vec![
            tool_call_event("tc-1", "bash", r#"{"command":"echo hello"}"#),
            ResponseEvent::Done,
        ],
        vec![ResponseEvent::TextDelta("done".into()), ResponseEvent::Done],
    ]);
    let exec = execution(
        model,
        bash_registry(tmp.path(), &["echo *"]),
        ExecOptions::default(),
    );
    let (summary, events) = run_and_collect(exec, "run echo").await;

    assert_eq!(summary.finish_reason, "stop");
    assert_eq!(summary.text, "done");
    let tool_steps: Vec<_> = summary
        .tool_calls
        .iter()
        .filter(|t| t.kind == TraceKind::Tool)
        .collect();
    assert_eq!(tool_steps.len(), 1);
    assert!(tool_steps[0].success);

    let result = events.iter().find_map(|e| match e {
        ExecEvent::ToolResult { output, .. } => Some(output.clone()),
        _ => None,
    });
    assert_eq!(result.as_deref().map(str::trim), Some("hello"));

    // llm-start, tool-call, tool-result, llm-start, text, finish — in order.
    let llm_starts = events
        .iter()
        .filter(|e| matches!(e, ExecEvent::LlmStart))
        .count();
    assert_eq!(llm_starts, 2);
    assert_call_result_pairing(&events);
}

// ── Denied command continues the run ──────────────────────────────────────────

#[tokio::test]
async fn denied_command_is_fed_back_as_validation_error() {
    let tmp = tempfile::tempdir().unwrap();
    let model = ScriptedMockProvider::new(vec![
        vec![
            tool_call_event("tc-1", "bash", r#"{"command":"rm -rf /"}"#),
            ResponseEvent::Done,
        ],
        vec![
            ResponseEvent::TextDelta("understood, stopping".into()),
            ResponseEvent::Done,
        ],
    ]);
    let exec = execution(
        model,
        bash_registry(tmp.path(), &["echo *"]),
        ExecOptions::default(),
    );
    let (summary, events) = run_and_collect(exec, "try something bad").await;

    // The run did not abort — the model saw the error and finished normally.
    assert_eq!(summary.finish_reason, "stop");

    let error = events
        .iter()
        .find_map(|e| match e {
            ExecEvent::ToolError { error, .. } => Some(error.clone()),
            _ => None,
        })
        .expect("expected a tool error event");
    assert_eq!(error["success"], false);
    assert_eq!(error["error"]["type"], "validation");
    assert_eq!(error["error"]["retryable"], false);
    assert_call_result_pairing(&events);
}

// ── Step budget ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn third_tool_call_hits_the_step_limit() {
    let tmp = tempfile::tempdir().unwrap();
    let model = ScriptedMockProvider::new(vec![vec![
        ResponseEvent::ToolCall {
            index: 0,
            id: "tc-1".into(),
            name: "bash".into(),
            arguments: r#"{"command":"echo one"}"#.into(),
        },
        ResponseEvent::ToolCall {
            index: 1,
            id: "tc-2".into(),
            name: "bash".into(),
            arguments: r#"{"command":"echo two"}"#.into(),
        },
        ResponseEvent::ToolCall {
            index: 2,
            id: "tc-3".into(),
            name: "bash".into(),
            arguments: r#"{"command":"echo three"}"#.into(),
        },
        ResponseEvent::Done,
    ]]);
    let exec = execution(
        model,
        bash_registry(tmp.path(), &["echo *"]),
        ExecOptions { max_steps: 2, ..ExecOptions::default() },
    );
    let (summary, events) = run_and_collect(exec, "run three").await;

    assert_eq!(summary.finish_reason, "step-limit");
    let executed: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, ExecEvent::ToolResult { .. }))
        .collect();
    assert_eq!(executed.len(), 2, "only the first two calls execute");
    assert!(matches!(
        events.last(),
        Some(ExecEvent::Finish { reason: FinishReason::StepLimit, .. })
    ));
    // The warning fired when the budget filled up.
    assert!(events
        .iter()
        .any(|e| matches!(e, ExecEvent::StepWarning { used: 2, max: 2 })));
}

// ── Unknown tool ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_tool_call_is_classified_and_run_continues() {
    let model = ScriptedMockProvider::new(vec![
        vec![
            tool_call_event("tc-1", "no_such_tool", "{}"),
            ResponseEvent::Done,
        ],
        vec![ResponseEvent::TextDelta("ok".into()), ResponseEvent::Done],
    ]);
    let exec = execution(model, ToolRegistry::new(), ExecOptions::default());
    let (summary, events) = run_and_collect(exec, "call something odd").await;

    assert_eq!(summary.finish_reason, "stop");
    let error = events
        .iter()
        .find_map(|e| match e {
            ExecEvent::ToolError { error, .. } => Some(error.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(error["error"]["type"], "tool_not_found");
}

// ── Doom loop ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_identical_calls_trigger_doom_loop_error() {
    let tmp = tempfile::tempdir().unwrap();
    let call = || {
        vec![
            tool_call_event("tc", "bash", r#"{"command":"echo same"}"#),
            ResponseEvent::Done,
        ]
    };
    let model = ScriptedMockProvider::new(vec![
        call(),
        call(),
        call(),
        vec![ResponseEvent::TextDelta("giving up".into()), ResponseEvent::Done],
    ]);
    let exec = execution(
        model,
        bash_registry(tmp.path(), &["echo *"]),
        ExecOptions::default(),
    );
    let (summary, events) = run_and_collect(exec, "loop forever").await;

    assert_eq!(summary.finish_reason, "stop");
    let doom = events
        .iter()
        .find_map(|e| match e {
            ExecEvent::ToolError { error, .. } => Some(error.clone()),
            _ => None,
        })
        .expect("third identical call must produce a doom-loop error");
    assert_eq!(doom["error"]["type"], "doom-loop-detected");
    assert_call_result_pairing(&events);
}

#[tokio::test]
async fn doom_loop_terminate_ends_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    let call = || {
        vec![
            tool_call_event("tc", "bash", r#"{"command":"echo same"}"#),
            ResponseEvent::Done,
        ]
    };
    let model = ScriptedMockProvider::new(vec![call(), call(), call()]);
    let exec = execution(
        model,
        bash_registry(tmp.path(), &["echo *"]),
        ExecOptions {
            doom_action: crate::doom::DoomLoopAction::Terminate,
            ..ExecOptions::default()
        },
    );
    let (summary, events) = run_and_collect(exec, "loop forever").await;

    assert_eq!(summary.finish_reason, "error");
    assert!(events.iter().any(|e| matches!(
        e,
        ExecEvent::Error { aborted: false, message } if message.contains("doom loop")
    )));
}

// ── Abort ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_before_first_turn_aborts() {
    let model = ScriptedMockProvider::always_text("never seen");
    let exec = execution(model, ToolRegistry::new(), ExecOptions::default());
    let (tx, mut rx) = mpsc::channel(64);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    cancel_tx.send(()).unwrap();

    let summary = exec
        .run(vec!["system".into()], "go".into(), tx, cancel_rx)
        .await;
    assert_eq!(summary.finish_reason, "aborted");

    let mut saw_abort = false;
    while let Some(event) = rx.recv().await {
        if matches!(event, ExecEvent::Error { aborted: true, .. }) {
            saw_abort = true;
        }
    }
    assert!(saw_abort);
}

// ── Usage accumulation ────────────────────────────────────────────────────────

#[tokio::test]
async fn usage_is_accumulated_across_turns() {
    let tmp = tempfile::tempdir().unwrap();
    let model = ScriptedMockProvider::new(vec![
        vec![
            tool_call_event("tc-1", "bash", r#"{"command":"echo hello"}"#),
            ResponseEvent::Usage { input_tokens: 100, output_tokens: 10 },
            ResponseEvent::Done,
        ],
        vec![
            ResponseEvent::TextDelta("done".into()),
            ResponseEvent::Usage { input_tokens: 150, output_tokens: 5 },
            ResponseEvent::Done,
        ],
    ]);
    let exec = execution(
        model,
        bash_registry(tmp.path(), &["echo *"]),
        ExecOptions::default(),
    );
    let (summary, _) = run_and_collect(exec, "go").await;
    assert_eq!(summary.usage.input_tokens, 250);
    assert_eq!(summary.usage.output_tokens, 15);
}

// ── Session persistence ───────────────────────────────────────────────────────

#[tokio::test]
async fn session_log_round_trips_through_disk() {
    use agentuse_session::{load_session, MessagePart, SessionManager, SessionStatus};

    let tmp = tempfile::tempdir().unwrap();
    let manager = SessionManager::new(tmp.path().to_path_buf());
    let session = manager
        .open("agent-x", serde_json::json!({}), None)
        .unwrap();
    let session_id = session.id().to_string();

    let bash_dir = tempfile::tempdir().unwrap();
    let model = ScriptedMockProvider::new(vec![
        vec![
            tool_call_event("tc-1", "bash", r#"{"command":"echo persisted"}"#),
            ResponseEvent::Done,
        ],
        vec![ResponseEvent::TextDelta("all saved".into()), ResponseEvent::Done],
    ]);
    let mut exec = execution(
        model,
        bash_registry(bash_dir.path(), &["echo *"]),
        ExecOptions::default(),
    );
    exec.session = Some(session);

    let (summary, _) = run_and_collect(exec, "persist me").await;
    assert_eq!(summary.session_id.as_deref(), Some(session_id.as_str()));

    let (info, records) = load_session(&manager.session_dir("agent-x", &session_id)).unwrap();
    assert_eq!(info.status, SessionStatus::Completed);
    assert!(info.completed_at.is_some());

    let roles: Vec<&str> = records.iter().map(|r| r.role.as_str()).collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "tool", "assistant"]);
    assert!(matches!(&records[2].parts[0], MessagePart::ToolCall { name, .. } if name == "bash"));
    assert!(
        matches!(&records[3].parts[0], MessagePart::ToolResult { output, .. } if output.trim() == "persisted")
    );
}
