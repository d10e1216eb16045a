// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-window management.
//!
//! Token accounting uses real usage reported by the provider when available
//! and the 4-chars-per-token estimate otherwise.  When the accounted size
//! crosses `context_limit × threshold`, the buffer is compacted: everything
//! but the newest messages is replaced with a single model-generated summary
//! (deterministic fallback when the summary call fails).  Compaction only
//! runs between turns and never strands a tool result without its call.

use anyhow::Result;
use futures::StreamExt;
use tracing::warn;

use agentuse_model::{
    CompletionRequest, Message, MessageContent, ModelProvider, ResponseEvent, Role,
};

pub const DEFAULT_CONTEXT_LIMIT: usize = 128_000;
pub const DEFAULT_THRESHOLD: f32 = 0.7;
pub const DEFAULT_KEEP_RECENT: usize = 3;

/// Kill switch honoured at construction time.
pub const DISABLE_ENV_VAR: &str = "AGENTUSE_DISABLE_COMPACTION";

const SUMMARY_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, and tool outputs that may matter for future work. The summary will replace the \
     original history to free up context space.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    Skipped,
    Compacted { tokens_before: usize, tokens_after: usize },
}

#[derive(Debug)]
pub struct ContextManager {
    context_limit: usize,
    threshold: f32,
    keep_recent: usize,
    enabled: bool,
    /// Prompt size of the most recent model call, as reported by the provider.
    last_real_input: Option<usize>,
    /// Message count right after the last compaction, for idempotence.
    compacted_at_len: Option<usize>,
}

impl ContextManager {
    pub fn new(context_limit: usize) -> Self {
        let enabled = std::env::var(DISABLE_ENV_VAR).is_err();
        Self {
            context_limit,
            threshold: DEFAULT_THRESHOLD,
            keep_recent: DEFAULT_KEEP_RECENT,
            enabled,
            last_real_input: None,
            compacted_at_len: None,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Record real usage from a finished model turn.
    pub fn record_usage(&mut self, input_tokens: u32, _output_tokens: u32) {
        self.last_real_input = Some(input_tokens as usize);
    }

    /// Accounted size of the buffer: real usage when we have it, estimate
    /// otherwise — whichever is larger, to stay conservative.
    pub fn accounted_tokens(&self, messages: &[Message]) -> usize {
        let estimated = estimate_tokens(messages);
        match self.last_real_input {
            Some(real) => real.max(estimated),
            None => estimated,
        }
    }

    pub fn should_compact(&self, messages: &[Message]) -> bool {
        if !self.enabled || self.context_limit == 0 {
            return false;
        }
        // Idempotent: nothing new since the last compaction.
        if self.compacted_at_len == Some(messages.len()) {
            return false;
        }
        let bound = (self.context_limit as f32 * self.threshold) as usize;
        self.accounted_tokens(messages) > bound
    }

    /// Compact `messages` in place, keeping the newest [`DEFAULT_KEEP_RECENT`]
    /// messages and replacing the rest with a single summary message.
    ///
    /// Guarantees:
    /// - the retained tail never starts inside a tool-call/tool-result group;
    /// - the buffer strictly shrinks, or the original is left untouched.
    pub async fn compact(
        &mut self,
        messages: &mut Vec<Message>,
        model: &dyn ModelProvider,
    ) -> Result<CompactionOutcome> {
        let tokens_before = estimate_tokens(messages);

        let system: Option<Message> = messages
            .first()
            .filter(|m| m.role == Role::System)
            .cloned();
        let non_system: Vec<Message> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        if non_system.len() <= self.keep_recent {
            return Ok(CompactionOutcome::Skipped);
        }

        // Pairing-safe split: move the cut backwards until the tail does not
        // begin with a tool call or a tool result, so no result is ever
        // separated from its call.
        let mut split = non_system.len() - self.keep_recent;
        while split > 0 {
            match &non_system[split].content {
                MessageContent::ToolResult { .. } | MessageContent::ToolCall { .. } => split -= 1,
                _ => break,
            }
        }
        if split == 0 {
            return Ok(CompactionOutcome::Skipped);
        }

        let old = &non_system[..split];
        let tail = &non_system[split..];
        let summary_text = match self.summarize(old, model).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) | Err(_) => fallback_summary(old),
        };

        let mut candidate = Vec::with_capacity(tail.len() + 2);
        if let Some(sys) = system {
            candidate.push(sys);
        }
        candidate.push(Message::assistant(format!(
            "[Earlier conversation summarised]\n{summary_text}"
        )));
        candidate.extend_from_slice(tail);

        let tokens_after = estimate_tokens(&candidate);
        if tokens_after >= tokens_before {
            // The summary did not shrink the buffer: keep the original.
            return Ok(CompactionOutcome::Skipped);
        }

        *messages = candidate;
        self.compacted_at_len = Some(messages.len());
        self.last_real_input = None;
        Ok(CompactionOutcome::Compacted { tokens_before, tokens_after })
    }

    async fn summarize(&self, old: &[Message], model: &dyn ModelProvider) -> Result<String> {
        let history = serialize_history(old);
        let request = CompletionRequest {
            messages: vec![Message::user(format!("{SUMMARY_PROMPT}\n\n---\n\n{history}"))],
            tools: vec![],
            options: None,
        };
        let mut stream = model.complete(request).await?;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event {
                Ok(ResponseEvent::TextDelta(delta)) => text.push_str(&delta),
                Ok(ResponseEvent::Done) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "summary stream error");
                    break;
                }
            }
        }
        Ok(text)
    }
}

/// Deterministic summary used when the model call fails.
fn fallback_summary(old: &[Message]) -> String {
    let tool_calls = old
        .iter()
        .filter(|m| matches!(m.content, MessageContent::ToolCall { .. }))
        .count();
    format!("{} messages exchanged, {} tool calls", old.len(), tool_calls)
}

pub(crate) fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.approx_tokens()).sum()
}

fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::System => "System",
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
            };
            let text = match &m.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::Reasoning { reasoning } => format!("[reasoning: {reasoning}]"),
                MessageContent::ToolCall { function, .. } => {
                    format!("[tool_call: {}({})]", function.name, function.arguments)
                }
                MessageContent::ToolResult { content, .. } => {
                    format!("[tool_result: {content}]")
                }
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
