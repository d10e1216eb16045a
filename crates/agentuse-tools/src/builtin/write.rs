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

pub struct WriteTool {
    validator: Arc<PathValidator>,
}

impl WriteTool {
    pub fn new(validator: Arc<PathValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file with the given content. Parent directories\n\
         are created as needed. The write is atomic: the file is never left\n\
         half-written."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or project-relative path to the file"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content to write"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(p) => p.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'path'"),
        };
        let content = match call.args.get("content").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'content'"),
        };

        let decision = self.validator.validate(&path, PathPermission::Write);
        if !decision.allowed {
            return ToolOutput::err(
                &call.id,
                format!("write rejected: {}", decision.error.unwrap_or_default()),
            );
        }

        let target = decision.resolved_path;
        debug!(path = %target.display(), bytes = content.len(), "write tool");

        if let Some(parent) = target.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(&call.id, format!("cannot create {}: {e}", parent.display()));
            }
        }
        match crate::builtin::store::atomic_write(&target, content.as_bytes()) {
            Ok(()) => ToolOutput::ok(
                &call.id,
                format!("wrote {} bytes to {path}", content.len()),
            ),
            Err(e) => ToolOutput::err(&call.id, format!("cannot write {path}: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use agentuse_config::FilesystemRule;
    use serde_json::json;

    use super::*;

    fn write_tool(tmp: &std::path::Path) -> WriteTool {
        let rules = vec![FilesystemRule {
            path: "${root}/**".into(),
            permissions: vec![PathPermission::Write],
        }];
        WriteTool::new(Arc::new(PathValidator::new(&rules, tmp.to_path_buf())))
    }

    fn call(args: Value) -> ToolCall {
        ToolCall { id: "tc".into(), name: "write".into(), args }
    }

    #[tokio::test]
    async fn writes_new_file_with_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let out = write_tool(tmp.path())
            .execute(&call(json!({"path": "a/b/c.txt", "content": "hello"})))
            .await;
        assert!(!out.is_error, "{}", out.content);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("a/b/c.txt")).unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn overwrites_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f.txt"), "old").unwrap();
        let out = write_tool(tmp.path())
            .execute(&call(json!({"path": "f.txt", "content": "new"})))
            .await;
        assert!(!out.is_error);
        assert_eq!(std::fs::read_to_string(tmp.path().join("f.txt")).unwrap(), "new");
    }

    #[tokio::test]
    async fn write_without_permission_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let rules = vec![FilesystemRule {
            path: "${root}/**".into(),
            permissions: vec![PathPermission::Read],
        }];
        let tool = WriteTool::new(Arc::new(PathValidator::new(&rules, tmp.path().to_path_buf())));
        let out = tool
            .execute(&call(json!({"path": "f.txt", "content": "x"})))
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn env_file_writes_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let out = write_tool(tmp.path())
            .execute(&call(json!({"path": ".env", "content": "SECRET=1"})))
            .await;
        assert!(out.is_error);
    }
}
