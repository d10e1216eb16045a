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

pub struct EditTool {
    validator: Arc<PathValidator>,
}

impl EditTool {
    pub fn new(validator: Arc<PathValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. 'oldString' must match exactly once\n\
         unless 'replaceAll' is true. Include enough surrounding context to make\n\
         the match unique."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or project-relative path to the file"
                },
                "oldString": {
                    "type": "string",
                    "description": "Exact text to replace"
                },
                "newString": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replaceAll": {
                    "type": "boolean",
                    "description": "Replace every occurrence (default false)"
                }
            },
            "required": ["path", "oldString", "newString"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        let old_string = match call.args.get("oldString").and_then(|v| v.as_str()) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return ToolOutput::err(&call.id, "missing or empty 'oldString'"),
        };
        let new_string = match call.args.get("newString").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'newString'"),
        };
        let replace_all = call
            .args
            .get("replaceAll")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let decision = self.validator.validate(&path, PathPermission::Edit);
        if !decision.allowed {
            return ToolOutput::err(
                &call.id,
                format!("edit rejected: {}", decision.error.unwrap_or_default()),
            );
        }
        let target = decision.resolved_path;

        let text = match tokio::fs::read_to_string(&target).await {
            Ok(t) => t,
            Err(e) => return ToolOutput::err(&call.id, format!("cannot read {path}: {e}")),
        };

        let occurrences = text.matches(&old_string).count();
        if occurrences == 0 {
            return ToolOutput::err(&call.id, "oldString not found in file");
        }
        if occurrences > 1 && !replace_all {
            return ToolOutput::err(
                &call.id,
                format!(
                    "oldString matches {occurrences} times; add more context or set replaceAll"
                ),
            );
        }

        let updated = if replace_all {
            text.replace(&old_string, &new_string)
        } else {
            text.replacen(&old_string, &new_string, 1)
        };

        debug!(path = %target.display(), occurrences, replace_all, "edit tool");

        match crate::builtin::store::atomic_write(&target, updated.as_bytes()) {
            Ok(()) => {
                let n = if replace_all { occurrences } else { 1 };
                ToolOutput::ok(&call.id, format!("replaced {n} occurrence(s) in {path}"))
            }
            Err(e) => ToolOutput::err(&call.id, format!("cannot write {path}: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
