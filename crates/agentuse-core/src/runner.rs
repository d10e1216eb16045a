// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Single-execution orchestration: pre-flight → providers → loop → cleanup.
//!
//! [`run_agent`] is the one entry point the CLI and the worker share.  It
//! owns the ordering guarantees around an execution: the environment
//! pre-flight runs before any MCP provider starts, and every MCP connection
//! is closed on every exit path — success, failure, cancellation, even a
//! panic inside the loop task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use agentuse_config::{agent_id_for_path, validate_env, Agent};
use agentuse_model::resolve_provider;
use agentuse_session::SessionManager;

use crate::context::{ContextManager, DEFAULT_CONTEXT_LIMIT};
use crate::events::{ExecEvent, ExecSummary};
use crate::executor::{ExecOptions, Execution, DEFAULT_MAX_STEPS};
use crate::toolset::{build_tool_set, BuildContext};

/// One agent run, fully specified.
pub struct RunRequest {
    pub agent: Agent,
    pub project_root: PathBuf,
    /// Environment snapshot used for credentials, env pre-flight, and MCP
    /// child environments.
    pub env: HashMap<String, String>,
    /// Extra prompt appended to the agent's instructions.
    pub prompt: Option<String>,
    pub model_override: Option<String>,
    pub max_steps_override: Option<u32>,
    /// Whole-run timeout in seconds; overrides the agent's `timeout`.
    pub timeout_override: Option<u64>,
    /// Persist a session under `<project>/.agentuse/sessions`.
    pub persist_session: bool,
}

impl RunRequest {
    pub fn new(agent: Agent, project_root: impl Into<PathBuf>) -> Self {
        Self {
            agent,
            project_root: project_root.into(),
            env: HashMap::new(),
            prompt: None,
            model_override: None,
            max_steps_override: None,
            timeout_override: None,
            persist_session: true,
        }
    }
}

/// Execute one agent to completion, streaming events through `tx`.
///
/// Fails early (before any provider is launched) on env pre-flight or model
/// resolution errors; after that point every outcome is an [`ExecSummary`].
pub async fn run_agent(
    req: RunRequest,
    tx: mpsc::Sender<ExecEvent>,
    cancel: oneshot::Receiver<()>,
) -> Result<ExecSummary> {
    // Pre-flight: every required environment variable must be present
    // before any MCP provider is started.
    let check = validate_env(&req.agent.config, &req.env);
    if !check.valid {
        bail!("missing required environment variables: {}", check.missing_summary());
    }

    let model_ref = req
        .model_override
        .clone()
        .unwrap_or_else(|| req.agent.config.model.clone());
    let model = resolve_provider(&model_ref, &req.env)?;

    let session_manager = if req.persist_session {
        Some(SessionManager::new(req.project_root.clone()))
    } else {
        None
    };

    let agent_id = agent_id_for_path(&req.agent.source_path);
    let session = match &session_manager {
        Some(manager) => {
            let snapshot = serde_json::to_value(&req.agent.config)
                .unwrap_or(serde_json::Value::Null);
            match manager.open(&agent_id, snapshot, None) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "cannot open session; running unpersisted");
                    None
                }
            }
        }
        None => None,
    };
    let session_id = session.as_ref().map(|s| s.id().to_string());

    let mut ctx = BuildContext::new(req.project_root.clone(), req.env.clone());
    ctx.session_manager = session_manager;
    ctx.parent_session_id = session_id;
    ctx.model_override = req.model_override.clone();

    let build = build_tool_set(&req.agent, &ctx).await?;
    for failure in &build.provider_failures {
        warn!(provider = %failure.name, error = %failure.error, "provider unavailable for this run");
    }

    let max_steps = req
        .max_steps_override
        .or(req.agent.config.max_steps)
        .unwrap_or(DEFAULT_MAX_STEPS);
    let provider = model_ref.split(':').next().unwrap_or_default().to_string();
    let provider_options = req.agent.config.provider_options.get(&provider).cloned();

    let execution = Execution {
        model,
        tools: build.registry.clone(),
        subagent_names: build.subagent_names.clone(),
        options: ExecOptions {
            max_steps,
            provider_options,
            ..ExecOptions::default()
        },
        context: ContextManager::new(DEFAULT_CONTEXT_LIMIT),
        session,
    };

    let system = system_message(&req.agent, &req.project_root, &build.provider_failures);
    let mut user_message = req.agent.instructions.clone();
    if let Some(prompt) = &req.prompt {
        user_message.push_str("\n\n## Additional instructions\n");
        user_message.push_str(prompt);
    }

    // Whole-run timeout: relay both the external cancel and the deadline
    // into the single cancel signal the executor watches.
    let timeout = req.timeout_override.or(req.agent.config.timeout);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let relay = tokio::spawn(relay_cancel(cancel, timeout, cancel_tx));

    // The loop runs in its own task so that a panic inside it still reaches
    // the close path below.
    let handle = tokio::spawn(execution.run(vec![system], user_message, tx, cancel_rx));
    let result = handle.await;
    build.supervisor.close_all().await;
    relay.abort();

    match result {
        Ok(summary) => {
            info!(
                finish_reason = %summary.finish_reason,
                duration_ms = summary.duration_ms,
                tokens = summary.usage.total(),
                "run complete"
            );
            Ok(summary)
        }
        Err(join_error) => bail!("execution task failed: {join_error}"),
    }
}

async fn relay_cancel(
    external: oneshot::Receiver<()>,
    timeout_secs: Option<u64>,
    cancel_tx: oneshot::Sender<()>,
) {
    // A dropped external sender means "no cancellation wanted", not an
    // abort — park forever in that case; the runner aborts this task once
    // the run finishes.
    let explicit_cancel = async {
        if external.await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    match timeout_secs {
        Some(secs) => {
            tokio::select! {
                _ = explicit_cancel => {}
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    warn!(timeout_secs = secs, "execution timeout reached");
                }
            }
            let _ = cancel_tx.send(());
        }
        None => {
            explicit_cancel.await;
            let _ = cancel_tx.send(());
        }
    }
}

fn system_message(
    agent: &Agent,
    project_root: &std::path::Path,
    failures: &[agentuse_mcp::ProviderFailure],
) -> String {
    let mut out = format!(
        "You are {:?}, an autonomous agent. Work inside the project at {} \
         using only the tools provided. When you are done, answer with the final result.",
        agent.name,
        project_root.display()
    );
    if let Some(description) = &agent.config.description {
        out.push_str("\n\n");
        out.push_str(description);
    }
    if !failures.is_empty() {
        out.push_str("\n\nUnavailable tool providers this run: ");
        out.push_str(
            &failures
                .iter()
                .map(|f| f.name.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        );
    }
    out
}
