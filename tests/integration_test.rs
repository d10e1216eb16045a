// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cross-crate integration tests: agent file → tool set → execution →
//! session, driven with the scripted mock provider so everything runs
//! offline and deterministically.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use agentuse_config::{agent_id_for_path, parse_agent_file};
use agentuse_core::{build_tool_set, BuildContext, ContextManager, ExecEvent, ExecOptions, Execution};
use agentuse_model::{ResponseEvent, ScriptedMockProvider};
use agentuse_session::{load_session, MessagePart, SessionManager, SessionStatus};

fn write_agent(dir: &Path, name: &str, extra: &str) -> std::path::PathBuf {
    let path = dir.join(format!("{name}.agentuse"));
    std::fs::write(
        &path,
        format!("---\nmodel: openai:gpt-4o-mini\n{extra}---\nYou are {name}.\n"),
    )
    .unwrap();
    path
}

async fn run_with(
    execution: Execution,
    user: &str,
) -> (agentuse_core::ExecSummary, Vec<ExecEvent>) {
    let (tx, mut rx) = mpsc::channel(256);
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let run = tokio::spawn(execution.run(vec!["system".into()], user.to_string(), tx, cancel_rx));
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (run.await.unwrap(), events)
}

#[tokio::test]
async fn agent_file_drives_a_full_tool_loop_with_session() {
    let tmp = tempfile::tempdir().unwrap();
    let agent_path = write_agent(
        tmp.path(),
        "writer",
        "tools:\n  bash:\n    commands: [\"echo *\"]\n  filesystem:\n    - path: \"${root}/**\"\n      permissions: [read, write, edit]\n",
    );
    let agent = parse_agent_file(&agent_path).unwrap();

    let ctx = BuildContext::new(tmp.path().to_path_buf(), Default::default());
    let build = build_tool_set(&agent, &ctx).await.unwrap();
    assert_eq!(build.registry.names(), vec!["bash", "edit", "read", "write"]);

    let manager = SessionManager::new(tmp.path().to_path_buf());
    let agent_id = agent_id_for_path(&agent.source_path);
    let session = manager
        .open(&agent_id, serde_json::to_value(&agent.config).unwrap(), None)
        .unwrap();
    let session_id = session.id().to_string();

    let model = ScriptedMockProvider::new(vec![
        vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "tc-1".into(),
                name: "write".into(),
                arguments: r#"{"path":"out.txt","content":"made by agent"}"#.into(),
            },
            ResponseEvent::Done,
        ],
        vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "tc-2".into(),
                name: "bash".into(),
                arguments: r#"{"command":"echo finished"}"#.into(),
            },
            ResponseEvent::Done,
        ],
        vec![
            ResponseEvent::TextDelta("all done".into()),
            ResponseEvent::Done,
        ],
    ]);

    let execution = Execution {
        model: Arc::new(model),
        tools: build.registry.clone(),
        subagent_names: HashSet::new(),
        options: ExecOptions::default(),
        context: ContextManager::new(128_000).with_enabled(false),
        session: Some(session),
    };

    let (summary, events) = run_with(execution, "write the file, then confirm").await;
    build.supervisor.close_all().await;

    assert_eq!(summary.finish_reason, "stop");
    assert_eq!(summary.text, "all done");
    assert_eq!(
        std::fs::read_to_string(tmp.path().join("out.txt")).unwrap(),
        "made by agent"
    );
    let echoed = events.iter().any(
        |e| matches!(e, ExecEvent::ToolResult { output, .. } if output.trim() == "finished"),
    );
    assert!(echoed, "bash result must flow back as a tool result event");

    // The session on disk reproduces the whole exchange, completed.
    let (info, records) = load_session(&manager.session_dir(&agent_id, &session_id)).unwrap();
    assert_eq!(info.status, SessionStatus::Completed);
    let tool_calls = records
        .iter()
        .flat_map(|r| &r.parts)
        .filter(|p| matches!(p, MessagePart::ToolCall { .. }))
        .count();
    let tool_results = records
        .iter()
        .flat_map(|r| &r.parts)
        .filter(|p| matches!(p, MessagePart::ToolResult { .. }))
        .count();
    assert_eq!(tool_calls, 2);
    assert_eq!(tool_results, 2);
}

#[tokio::test]
async fn subagent_cycle_fails_the_build_not_the_run() {
    let tmp = tempfile::tempdir().unwrap();
    write_agent(tmp.path(), "ping", "subagents:\n  - path: ./pong.agentuse\n");
    write_agent(tmp.path(), "pong", "subagents:\n  - path: ./ping.agentuse\n");
    let agent = parse_agent_file(&tmp.path().join("ping.agentuse")).unwrap();

    let ctx = BuildContext::new(tmp.path().to_path_buf(), Default::default());
    let err = build_tool_set(&agent, &ctx).await.unwrap_err();
    assert!(err.to_string().contains("ping → pong → ping"));
}

#[tokio::test]
async fn denied_paths_surface_as_recoverable_tool_errors() {
    let tmp = tempfile::tempdir().unwrap();
    let agent_path = write_agent(
        tmp.path(),
        "reader",
        "tools:\n  filesystem:\n    - path: \"${root}/**\"\n      permissions: [read]\n",
    );
    let agent = parse_agent_file(&agent_path).unwrap();
    let ctx = BuildContext::new(tmp.path().to_path_buf(), Default::default());
    let build = build_tool_set(&agent, &ctx).await.unwrap();

    let model = ScriptedMockProvider::new(vec![
        vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "tc-1".into(),
                name: "write".into(),
                arguments: r#"{"path":"x.txt","content":"nope"}"#.into(),
            },
            ResponseEvent::Done,
        ],
        vec![
            ResponseEvent::TextDelta("understood".into()),
            ResponseEvent::Done,
        ],
    ]);

    let execution = Execution {
        model: Arc::new(model),
        tools: build.registry.clone(),
        subagent_names: HashSet::new(),
        options: ExecOptions::default(),
        context: ContextManager::new(128_000).with_enabled(false),
        session: None,
    };
    let (summary, events) = run_with(execution, "try to write").await;

    // The rules grant read only, so the write is rejected by the path
    // validator and fed back as a recoverable validation error.
    assert_eq!(summary.finish_reason, "stop");
    let error = events
        .iter()
        .find_map(|e| match e {
            ExecEvent::ToolError { error, .. } => Some(error.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(error["error"]["type"], "validation");
    assert_eq!(error["error"]["retryable"], false);
}
