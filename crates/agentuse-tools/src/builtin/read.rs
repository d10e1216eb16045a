// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use agentuse_config::PathPermission;

use crate::policy::path::PathValidator;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Default number of lines returned when no limit is given.  The agent can
/// paginate with offset + limit.
const DEFAULT_LINE_LIMIT: usize = 200;

/// Hard byte ceiling applied in addition to the line limit.
const MAX_BYTES: usize = 20_000;

pub struct ReadTool {
    validator: Arc<PathValidator>,
}

impl ReadTool {
    pub fn new(validator: Arc<PathValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file. Default: 200 lines / 20 KB, whichever comes first.\n\
         Lines are formatted as L{n}:content (1-indexed). When more lines exist,\n\
         a pagination notice shows the next offset. Use offset+limit to read\n\
         large files in windows."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or project-relative path to the file"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start reading from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 200)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        let offset = call.args.get("offset").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let limit = call
            .args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        let decision = self.validator.validate(&path, PathPermission::Read);
        if !decision.allowed {
            return ToolOutput::err(
                &call.id,
                format!("read rejected: {}", decision.error.unwrap_or_default()),
            );
        }

        debug!(path = %decision.resolved_path.display(), offset, limit, "read tool");

        let text = match tokio::fs::read_to_string(&decision.resolved_path).await {
            Ok(t) => t,
            Err(e) => return ToolOutput::err(&call.id, format!("cannot read {path}: {e}")),
        };

        let all_lines: Vec<&str> = text.lines().collect();
        let total = all_lines.len();
        let start = offset.saturating_sub(1).min(total);

        let mut out = String::new();
        let mut emitted = 0usize;
        for (i, line) in all_lines[start..].iter().enumerate() {
            if emitted >= limit || out.len() + line.len() > MAX_BYTES {
                break;
            }
            out.push_str(&format!("L{}:{line}\n", start + i + 1));
            emitted += 1;
        }

        let next = start + emitted;
        if next < total {
            out.push_str(&format!(
                "[{} more lines; continue with offset={}]",
                total - next,
                next + 1
            ));
        }
        if out.is_empty() {
            out = "[empty file]".into();
        }
        ToolOutput::ok(&call.id, out)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
