// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Classification of MCP call failures.
//!
//! A provider error reaches the model as data, not as an exception.  The
//! classification drives two fields the model actually uses: `retryable`
//! (may the same call succeed if repeated) and `suggestions` (what to try
//! instead).

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpErrorKind {
    /// A validator rejected the request (command or path policy).
    Validation,
    ToolNotFound,
    ServerError,
    RateLimit,
    Timeout,
    AuthError,
    NotFound,
    NetworkError,
    Unknown,
}

impl McpErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ToolNotFound => "tool_not_found",
            Self::ServerError => "server_error",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::AuthError => "auth_error",
            Self::NotFound => "not_found",
            Self::NetworkError => "network_error",
            Self::Unknown => "unknown",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::ServerError | Self::RateLimit | Self::Timeout | Self::NetworkError
        )
    }

    fn suggestions(&self) -> Vec<&'static str> {
        match self {
            Self::Validation => vec![
                "the request violates the agent's security policy; do not retry it verbatim",
                "stay inside the project root and the allowed command patterns",
            ],
            Self::ToolNotFound => vec![
                "check the tool name against the tools listed in your instructions",
                "the provider may expose a similar tool under a different name",
            ],
            Self::RateLimit => vec!["wait before retrying", "reduce the request rate"],
            Self::Timeout => vec!["retry the call", "try a smaller request"],
            Self::AuthError => vec![
                "the provider's credentials are missing or expired; report this to the user",
            ],
            Self::NotFound => vec!["check the identifier or path you passed"],
            Self::ServerError | Self::NetworkError => vec!["retry the call once"],
            Self::Unknown => vec![],
        }
    }
}

/// Best-effort classification from the rendered error message.
pub fn classify_error(message: &str) -> McpErrorKind {
    let m = message.to_ascii_lowercase();
    if m.contains("rejected") || m.contains("not allowed") || m.contains("denied")
        || m.contains("outside the project root")
    {
        McpErrorKind::Validation
    } else if m.contains("unknown tool")
        || m.contains("tool not found")
        || m.contains("method not found")
    {
        McpErrorKind::ToolNotFound
    } else if m.contains("429") || m.contains("rate limit") {
        McpErrorKind::RateLimit
    } else if m.contains("timed out") || m.contains("timeout") || m.contains("deadline") {
        McpErrorKind::Timeout
    } else if m.contains("401") || m.contains("403") || m.contains("unauthorized")
        || m.contains("forbidden") || m.contains("auth")
    {
        McpErrorKind::AuthError
    } else if m.contains("404") || m.contains("not found") || m.contains("no such") {
        McpErrorKind::NotFound
    } else if m.contains("connection") || m.contains("broken pipe") || m.contains("network")
        || m.contains("dns") || m.contains("refused")
    {
        McpErrorKind::NetworkError
    } else if m.contains("500") || m.contains("502") || m.contains("503")
        || m.contains("internal") || m.contains("server error")
    {
        McpErrorKind::ServerError
    } else {
        McpErrorKind::Unknown
    }
}

/// The structured tool result delivered to the model for a failed call.
pub fn structured_error_json(provider: &str, message: &str) -> Value {
    let kind = classify_error(message);
    json!({
        "success": false,
        "error": {
            "type": kind.as_str(),
            "message": format!("{provider}: {message}"),
            "retryable": kind.retryable(),
            "suggestions": kind.suggestions(),
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
