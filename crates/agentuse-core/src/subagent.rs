// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent composition: an agent file becomes a tool.
//!
//! The tool name is the (sanitised) sub-agent name under a `subagent__`
//! prefix.  Executing the tool runs a *full* nested execution — own MCP
//! providers, own step budget, own session whose parent pointer is the
//! caller's session — and returns the sub-agent's final text, with duration,
//! token usage, and tool-call counts attached as metadata.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use agentuse_config::{parse_agent_file, Agent, SubAgentSpec};
use agentuse_model::resolve_provider;
use agentuse_tools::{tool::sanitize_tool_name, Tool, ToolCall, ToolOutput};

use crate::context::ContextManager;
use crate::executor::{ExecOptions, Execution, DEFAULT_MAX_STEPS};
use crate::toolset::{build_tool_set, resolve_subagent_path, BuildContext};

pub const SUBAGENT_PREFIX: &str = "subagent__";

pub struct SubAgentTool {
    tool_name: String,
    description: String,
    agent: Agent,
    max_steps: u32,
    ctx: BuildContext,
}

impl SubAgentTool {
    /// Parse and wrap a sub-agent.  The caller has already run cycle
    /// detection over the whole graph; this only loads the file and derives
    /// the tool identity.
    pub fn build(spec: &SubAgentSpec, parent: &Agent, ctx: BuildContext) -> anyhow::Result<Self> {
        let path = resolve_subagent_path(parent, &spec.path);
        let agent = parse_agent_file(&path)?;
        let base_name = spec.name.clone().unwrap_or_else(|| agent.name.clone());
        let tool_name = format!("{SUBAGENT_PREFIX}{}", sanitize_tool_name(&base_name));
        let description = agent
            .config
            .description
            .clone()
            .unwrap_or_else(|| format!("Delegate a task to the {base_name} agent"));
        let max_steps = spec
            .max_steps
            .or(agent.config.max_steps)
            .unwrap_or(DEFAULT_MAX_STEPS);
        Ok(Self { tool_name, description, agent, max_steps, ctx })
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "What the sub-agent should do, in addition to its own instructions"
                },
                "context": {
                    "type": "string",
                    "description": "Background information the sub-agent needs"
                }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let task = call.args.get("task").and_then(|v| v.as_str());
        let context_note = call.args.get("context").and_then(|v| v.as_str());

        // Parent model override wins over the sub-agent's own model.
        let model_ref = self
            .ctx
            .model_override
            .clone()
            .unwrap_or_else(|| self.agent.config.model.clone());
        let model = match resolve_provider(&model_ref, &self.ctx.env) {
            Ok(m) => m,
            Err(e) => return ToolOutput::err(&call.id, format!("sub-agent model error: {e:#}")),
        };

        let build = match build_tool_set(&self.agent, &self.ctx).await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(&call.id, format!("sub-agent setup error: {e:#}")),
        };

        // Nested session, parent-linked to the caller's.
        let session = self.ctx.session_manager.as_ref().and_then(|manager| {
            let agent_id = agentuse_config::agent_id_for_path(&self.agent.source_path);
            let snapshot = serde_json::to_value(&self.agent.config).unwrap_or(Value::Null);
            manager
                .open(&agent_id, snapshot, self.ctx.parent_session_id.clone())
                .map_err(|e| debug!(error = %e, "sub-agent session open failed"))
                .ok()
        });

        let mut user_message = self.agent.instructions.clone();
        if let Some(task) = task {
            user_message.push_str("\n\n## Task\n");
            user_message.push_str(task);
        }
        if let Some(context_note) = context_note {
            user_message.push_str("\n\n## Context\n");
            user_message.push_str(context_note);
        }

        let execution = Execution {
            model,
            tools: build.registry.clone(),
            subagent_names: build.subagent_names.clone(),
            options: ExecOptions {
                max_steps: self.max_steps,
                provider_options: provider_options_for(&self.agent, &model_ref),
                ..ExecOptions::default()
            },
            context: ContextManager::new(crate::context::DEFAULT_CONTEXT_LIMIT),
            session,
        };

        // Nested events are not surfaced to the parent's consumer; drain
        // them so the bounded channel never blocks the nested run.
        let (tx, mut rx) = mpsc::channel(256);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let (_cancel_tx, cancel_rx) = oneshot::channel();

        let summary = execution
            .run(Vec::new(), user_message, tx, cancel_rx)
            .await;
        build.supervisor.close_all().await;
        drop(drain);

        let metadata = json!({
            "durationMs": summary.duration_ms,
            "tokensUsed": summary.usage.total(),
            "toolCalls": summary.tool_calls.len(),
            "sessionId": summary.session_id,
        });

        if summary.finish_reason == "error" {
            ToolOutput::err(
                &call.id,
                format!("sub-agent failed: {}", truncate(&summary.text, 400)),
            )
            .with_metadata(metadata)
        } else {
            let text = if summary.text.is_empty() {
                "(sub-agent produced no text output)".to_string()
            } else {
                summary.text
            };
            ToolOutput::ok(&call.id, text).with_metadata(metadata)
        }
    }
}

fn provider_options_for(agent: &Agent, model_ref: &str) -> Option<Value> {
    let provider = model_ref.split(':').next()?;
    agent
        .config
        .provider_options
        .get(provider)
        .cloned()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use super::*;

    fn write_agent(dir: &Path, name: &str, extra: &str) -> std::path::PathBuf {
        let path = dir.join(format!("{name}.agentuse"));
        std::fs::write(
            &path,
            format!("---\nmodel: local:test-model\n{extra}---\nYou are {name}.\n"),
        )
        .unwrap();
        path
    }

    fn spec(path: &str) -> SubAgentSpec {
        SubAgentSpec { path: path.into(), name: None, max_steps: None }
    }

    #[test]
    fn tool_name_is_prefixed_and_sanitised() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "data helper", "");
        let parent_path = write_agent(tmp.path(), "parent", "");
        let parent = parse_agent_file(&parent_path).unwrap();
        let tool = SubAgentTool::build(
            &spec("./data helper.agentuse"),
            &parent,
            BuildContext::new(tmp.path().to_path_buf(), HashMap::new()),
        )
        .unwrap();
        assert_eq!(tool.name(), "subagent__data_helper");
    }

    #[test]
    fn explicit_name_overrides_file_stem() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "helper", "");
        let parent_path = write_agent(tmp.path(), "parent", "");
        let parent = parse_agent_file(&parent_path).unwrap();
        let mut s = spec("./helper.agentuse");
        s.name = Some("renamed".into());
        let tool = SubAgentTool::build(
            &s,
            &parent,
            BuildContext::new(tmp.path().to_path_buf(), HashMap::new()),
        )
        .unwrap();
        assert_eq!(tool.name(), "subagent__renamed");
    }

    #[test]
    fn spec_max_steps_beats_agent_config() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "helper", "maxSteps: 9\n");
        let parent_path = write_agent(tmp.path(), "parent", "");
        let parent = parse_agent_file(&parent_path).unwrap();

        let without_override = SubAgentTool::build(
            &spec("./helper.agentuse"),
            &parent,
            BuildContext::new(tmp.path().to_path_buf(), HashMap::new()),
        )
        .unwrap();
        assert_eq!(without_override.max_steps, 9);

        let mut s = spec("./helper.agentuse");
        s.max_steps = Some(4);
        let with_override = SubAgentTool::build(
            &s,
            &parent,
            BuildContext::new(tmp.path().to_path_buf(), HashMap::new()),
        )
        .unwrap();
        assert_eq!(with_override.max_steps, 4);
    }

}
