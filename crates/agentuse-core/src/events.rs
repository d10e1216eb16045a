// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use agentuse_model::Usage;

/// Why an execution finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    /// The model produced a final answer.
    Stop,
    /// The tool-call budget was exhausted.
    StepLimit,
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::StepLimit => write!(f, "step-limit"),
        }
    }
}

/// Events emitted by one execution, in strict happens-before order.
/// Consumers (CLI, worker, HTTP streaming) pull them off a bounded channel.
#[derive(Debug, Clone)]
pub enum ExecEvent {
    /// A model call is being opened.
    LlmStart,
    /// First token of the current model turn arrived.
    LlmFirstToken,
    /// A streamed text chunk.
    Text(String),
    /// A streamed reasoning chunk.
    Reasoning(String),
    /// The model requested a tool call.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
        is_subagent: bool,
    },
    /// A tool call completed successfully.
    ToolResult {
        id: String,
        name: String,
        output: String,
        duration_ms: u64,
    },
    /// A tool call failed; the structured error was fed back to the model.
    ToolError {
        id: String,
        name: String,
        error: serde_json::Value,
        duration_ms: u64,
    },
    /// The step budget is nearly or fully consumed.
    StepWarning { used: u32, max: u32 },
    /// The context manager compacted the message buffer.
    Compacted { tokens_before: usize, tokens_after: usize },
    /// Normal completion.
    Finish { reason: FinishReason, usage: Usage },
    /// Abnormal termination (abort or unhandled failure).  Terminal.
    Error { message: String, aborted: bool },
}

/// What kind of work a trace entry measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Tool,
    Subagent,
    Llm,
}

/// One timed unit of work inside a run, for observability and benchmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallTrace {
    pub name: String,
    pub kind: TraceKind,
    pub start_ms: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    pub success: bool,
}

/// How an execution ended, plus everything a caller needs to report it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecSummary {
    /// The final assistant text (last text turn).
    pub text: String,
    /// `stop`, `step-limit`, `aborted`, or `error`.
    pub finish_reason: String,
    pub duration_ms: u64,
    pub usage: Usage,
    pub tool_calls: Vec<ToolCallTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_renders_kebab_case() {
        assert_eq!(FinishReason::Stop.to_string(), "stop");
        assert_eq!(FinishReason::StepLimit.to_string(), "step-limit");
        assert_eq!(
            serde_json::to_string(&FinishReason::StepLimit).unwrap(),
            "\"step-limit\""
        );
    }

    #[test]
    fn summary_serialises_camel_case() {
        let summary = ExecSummary {
            text: "done".into(),
            finish_reason: "stop".into(),
            duration_ms: 42,
            usage: Usage::default(),
            tool_calls: vec![],
            session_id: None,
        };
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"finishReason\""));
        assert!(json.contains("\"durationMs\""));
    }
}
