// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use agentuse_core::{ToolCallTrace, ExecSummary};

pub const ERROR_WORKER_DIED: &str = "WORKER_DIED";
pub const ERROR_TIMEOUT: &str = "TIMEOUT";
pub const ERROR_EXECUTION: &str = "EXECUTION_ERROR";
pub const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";

/// The readiness handshake, printed by the worker once its runtime is up.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyLine {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ReadyLine {
    pub fn new() -> Self {
        Self { kind: "ready".into() }
    }

    pub fn is_ready(&self) -> bool {
        self.kind == "ready"
    }
}

impl Default for ReadyLine {
    fn default() -> Self {
        Self::new()
    }
}

/// A request from the parent, newline-framed on the worker's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    #[serde(rename = "execute", rename_all = "camelCase")]
    Execute {
        id: String,
        agent_path: String,
        project_root: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// Seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_steps: Option<u32>,
        /// Environment snapshot the run executes under.  The parent owns
        /// `.env` loading and hot reload; the worker never consults its own
        /// process environment, so pre-flight and execution always agree.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default)]
        debug: bool,
    },
    /// Abort an in-flight execute with the same id.
    #[serde(rename = "cancel")]
    Cancel { id: String },
}

impl WorkerRequest {
    pub fn id(&self) -> &str {
        match self {
            Self::Execute { id, .. } | Self::Cancel { id } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub text: String,
    pub finish_reason: String,
    pub duration_ms: u64,
    pub tokens: u32,
    pub tool_calls: Vec<ToolCallTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl From<ExecSummary> for WorkerResult {
    fn from(summary: ExecSummary) -> Self {
        Self {
            text: summary.text,
            finish_reason: summary.finish_reason,
            duration_ms: summary.duration_ms,
            tokens: summary.usage.total(),
            tool_calls: summary.tool_calls,
            session_id: summary.session_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerError {
    pub code: String,
    pub message: String,
}

/// A response from the worker, newline-framed on its stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<WorkerResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WorkerError>,
}

impl WorkerResponse {
    pub fn ok(id: impl Into<String>, result: WorkerResult) -> Self {
        Self { id: id.into(), success: true, result: Some(result), error: None }
    }

    pub fn err(id: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(WorkerError { code: code.to_string(), message: message.into() }),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
