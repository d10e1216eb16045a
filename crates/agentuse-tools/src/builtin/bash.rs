// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

use crate::policy::command::CommandValidator;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Hard byte ceiling for combined stdout + stderr returned to the model.
/// 20 KB ≈ 5,000 tokens — keeps a single result from flooding the context.
const OUTPUT_LIMIT_BYTES: usize = 20_000;

/// Lines kept from the head / tail of oversized output.  Errors and
/// summaries almost always appear at the end of build output, so the tail is
/// at least as important as the head.
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

/// Built-in shell tool.  Every command passes the [`CommandValidator`]
/// before it runs; a denial becomes an error result, not an exception, so
/// the model can pick a different command.
pub struct BashTool {
    validator: CommandValidator,
    project_root: PathBuf,
    pub default_timeout_secs: u64,
}

impl BashTool {
    pub fn new(allow_patterns: Vec<String>, project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            validator: CommandValidator::new(allow_patterns, project_root.clone()),
            project_root,
            default_timeout_secs: 30,
        }
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command inside the project root and return stdout + stderr.\n\
         Only commands matching the agent's allowlist run; paths must stay inside\n\
         the project. Output is capped at ~20 KB (first 100 and last 100 lines kept).\n\
         Prefer non-interactive commands; avoid anything that needs a TTY."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c.to_string(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'command'"),
        };
        let timeout = call
            .args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.default_timeout_secs);

        let decision = self.validator.validate(&command);
        if !decision.allowed {
            return ToolOutput::err(
                &call.id,
                format!(
                    "command rejected: {}",
                    decision.error.unwrap_or_else(|| "not allowed".into())
                ),
            );
        }

        debug!(cmd = %command, pattern = ?decision.matched_pattern, "executing bash tool");

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command);
        cmd.current_dir(&self.project_root);
        // Detach from any controlling terminal: stdin from /dev/null, a new
        // session via setsid, and SIGKILL on drop when the timeout fires.
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let result =
            tokio::time::timeout(std::time::Duration::from_secs(timeout), cmd.output()).await;

        match result {
            Ok(Ok(output)) => {
                let mut content = String::new();
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);

                if !stdout.is_empty() {
                    content.push_str(&head_tail_truncate(&stdout));
                }
                if !stderr.is_empty() {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str("[stderr]\n");
                    content.push_str(&head_tail_truncate(&stderr));
                }

                let code = output.status.code().unwrap_or(-1);
                if content.is_empty() {
                    content = format!("[exit {code}]");
                }
                if code == 0 {
                    ToolOutput::ok(&call.id, content)
                } else {
                    ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
                }
            }
            Ok(Err(e)) => ToolOutput::err(&call.id, format!("spawn error: {e}")),
            Err(_) => ToolOutput::err(&call.id, format!("timeout after {timeout}s")),
        }
    }
}

/// Truncate `s` to fit within [`OUTPUT_LIMIT_BYTES`], keeping the first
/// [`HEAD_LINES`] and last [`TAIL_LINES`] lines with an omission marker in
/// between.
fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES {
        return s.to_string();
    }
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= HEAD_LINES + TAIL_LINES {
        // Few but very long lines: hard cut at the byte budget.
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < OUTPUT_LIMIT_BYTES)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        return format!("{}\n[... {} bytes omitted ...]", &s[..cut], s.len() - cut);
    }
    let omitted = lines.len() - HEAD_LINES - TAIL_LINES;
    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[lines.len() - TAIL_LINES..].join("\n");
    format!("{head}\n[... {omitted} lines omitted ...]\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
