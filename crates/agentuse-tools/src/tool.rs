// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// The result of executing a tool.
///
/// Failures are values, not errors: a denied command or a missing file comes
/// back as `is_error = true` so the model can read the message and recover.
/// `metadata` carries structured extras that never enter the conversation —
/// sub-agent tools use it to report token usage and nested tool calls.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub metadata: Option<Value>,
    pub is_error: bool,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            metadata: None,
            is_error: false,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            metadata: None,
            is_error: true,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Trait that every built-in, MCP-backed, and sub-agent tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name, `[A-Za-z0-9_-]+`.
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Execute the tool.  Failures should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

/// Check a tool name against the allowed charset.
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Replace every disallowed character with `_` so arbitrary labels (provider
/// names, sub-agent file stems) become legal tool-name components.
pub fn sanitize_tool_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "tool".to_string()
    } else {
        sanitized
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_and_err_set_is_error() {
        assert!(!ToolOutput::ok("1", "fine").is_error);
        assert!(ToolOutput::err("1", "bad").is_error);
    }

    #[test]
    fn with_metadata_attaches_value() {
        let out = ToolOutput::ok("1", "x").with_metadata(serde_json::json!({"k": 1}));
        assert_eq!(out.metadata.unwrap()["k"], 1);
    }

    #[test]
    fn tool_name_charset() {
        assert!(is_valid_tool_name("bash"));
        assert!(is_valid_tool_name("github_list_issues"));
        assert!(is_valid_tool_name("subagent__helper-2"));
        assert!(!is_valid_tool_name("with space"));
        assert!(!is_valid_tool_name("dot.name"));
        assert!(!is_valid_tool_name(""));
    }

    #[test]
    fn sanitize_replaces_and_never_returns_empty() {
        assert_eq!(sanitize_tool_name("my agent!"), "my_agent_");
        assert_eq!(sanitize_tool_name("ok-name_2"), "ok-name_2");
        assert_eq!(sanitize_tool_name(""), "tool");
    }
}
