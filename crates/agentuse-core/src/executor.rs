// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The execution core: one streaming model ↔ tool loop.
//!
//! [`Execution::run`] drives the model with the current message buffer,
//! executes the tool calls it streams back, feeds results into the next
//! turn, and emits [`ExecEvent`]s over a bounded channel.  It is the single
//! place where tool failures become in-band structured results for the
//! model; everything above it sees a normal completion, a cancellation, or
//! a fatal error.
//!
//! A **step** is one executed tool call.  The budget gates execution: when a
//! call arrives with the budget already spent, the run finishes with reason
//! `step-limit` without executing it — so the model may still emit text
//! after its final tool call.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use agentuse_mcp::structured_error_json;
use agentuse_model::{
    CompletionRequest, Message, ModelProvider, ResponseEvent, Usage,
};
use agentuse_session::{MessagePart, SessionHandle, SessionStatus};
use agentuse_tools::{ToolCall, ToolRegistry};

use crate::context::ContextManager;
use crate::doom::{DoomLoopAction, DoomLoopDetector, DEFAULT_THRESHOLD};
use crate::events::{ExecEvent, ExecSummary, FinishReason, ToolCallTrace, TraceKind};

pub const DEFAULT_MAX_STEPS: u32 = 25;
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Cap on executed tool calls.
    pub max_steps: u32,
    /// Per-tool-call timeout; firing produces an error result, not an abort.
    pub tool_timeout: Duration,
    pub doom_action: DoomLoopAction,
    pub doom_threshold: usize,
    /// Provider-specific request options from the agent front-matter.
    pub provider_options: Option<Value>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            doom_action: DoomLoopAction::default(),
            doom_threshold: DEFAULT_THRESHOLD,
            provider_options: None,
        }
    }
}

/// One run over one agent: model, tools, context manager, session log.
pub struct Execution {
    pub model: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolRegistry>,
    /// Tool names that are sub-agents, for event marking and token
    /// attribution.
    pub subagent_names: HashSet<String>,
    pub options: ExecOptions,
    pub context: ContextManager,
    pub session: Option<SessionHandle>,
}

enum TurnOutcome {
    /// Model turn completed: accumulated text + ordered tool calls.
    Complete(String, Vec<ToolCall>),
    Aborted,
    Failed(String),
}

impl Execution {
    /// Drive the loop to completion, streaming events through `tx`.
    ///
    /// Dropping (or firing) the `cancel` sender aborts at the next
    /// suspension point.  The returned summary is always produced — errors
    /// are reported both as an [`ExecEvent::Error`] and in
    /// `summary.finish_reason`.
    pub async fn run(
        mut self,
        system_messages: Vec<String>,
        user_message: String,
        tx: mpsc::Sender<ExecEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) -> ExecSummary {
        let started = Instant::now();
        let mut buffer: Vec<Message> = Vec::new();
        for system in &system_messages {
            buffer.push(Message::system(system.clone()));
            self.persist("system", vec![MessagePart::Text { text: system.clone() }], None);
        }
        buffer.push(Message::user(user_message.clone()));
        self.persist("user", vec![MessagePart::Text { text: user_message }], None);

        let mut usage = Usage::default();
        let mut traces: Vec<ToolCallTrace> = Vec::new();
        let mut final_text = String::new();
        let mut steps: u32 = 0;
        let mut warned_near_cap = false;
        let mut warned_at_cap = false;
        let mut doom = DoomLoopDetector::new(10, self.options.doom_threshold);

        let schemas: Vec<agentuse_model::ToolSchema> = self
            .tools
            .schemas()
            .into_iter()
            .map(|s| agentuse_model::ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();

        loop {
            // Cancellation is observed between turns and inside the stream.
            // A dropped sender counts as a cancel, same as an explicit one.
            match cancel.try_recv() {
                Err(oneshot::error::TryRecvError::Empty) => {}
                _ => return self.abort(&tx, started, final_text, usage, traces).await,
            }

            // Compaction runs strictly between turns.
            if self.context.should_compact(&buffer) {
                match self.context.compact(&mut buffer, self.model.as_ref()).await {
                    Ok(crate::context::CompactionOutcome::Compacted {
                        tokens_before,
                        tokens_after,
                    }) => {
                        let _ = tx.send(ExecEvent::Compacted { tokens_before, tokens_after }).await;
                    }
                    Ok(crate::context::CompactionOutcome::Skipped) => {}
                    Err(e) => warn!(error = %e, "compaction failed; continuing uncompacted"),
                }
            }

            let _ = tx.send(ExecEvent::LlmStart).await;
            let llm_started = Instant::now();
            let llm_offset = started.elapsed().as_millis() as u64;

            let request = CompletionRequest {
                messages: buffer.clone(),
                tools: schemas.clone(),
                options: self.options.provider_options.clone(),
            };
            let stream = match self.model.complete(request).await {
                Ok(s) => s,
                Err(e) => {
                    return self
                        .fail(&tx, started, final_text, usage, traces, format!("{e:#}"))
                        .await;
                }
            };

            let outcome = self
                .stream_one_turn(stream, &tx, &mut cancel, &mut usage, &mut buffer)
                .await;

            traces.push(ToolCallTrace {
                name: self.model.model_name().to_string(),
                kind: TraceKind::Llm,
                start_ms: llm_offset,
                duration_ms: llm_started.elapsed().as_millis() as u64,
                tokens: Some(usage.total()),
                success: !matches!(outcome, TurnOutcome::Failed(_)),
            });

            let (text, tool_calls) = match outcome {
                TurnOutcome::Complete(text, calls) => (text, calls),
                TurnOutcome::Aborted => {
                    return self.abort(&tx, started, final_text, usage, traces).await;
                }
                TurnOutcome::Failed(message) => {
                    return self.fail(&tx, started, final_text, usage, traces, message).await;
                }
            };

            if !text.is_empty() {
                buffer.push(Message::assistant(text.clone()));
                self.persist("assistant", vec![MessagePart::Text { text: text.clone() }], Some(usage.output_tokens));
                final_text = text;
            }

            if tool_calls.is_empty() {
                return self
                    .finish(&tx, started, final_text, usage, traces, FinishReason::Stop)
                    .await;
            }

            for call in tool_calls {
                // The budget gates the *execution* of the next call.
                if steps >= self.options.max_steps {
                    return self
                        .finish(&tx, started, final_text, usage, traces, FinishReason::StepLimit)
                        .await;
                }

                if doom.record(&call.name, &call.args) {
                    match self.options.doom_action {
                        DoomLoopAction::Warn => {
                            warn!(tool = %call.name, "doom loop detected; continuing");
                        }
                        DoomLoopAction::Error => {
                            steps += 1;
                            let error = serde_json::json!({
                                "success": false,
                                "error": {
                                    "type": "doom-loop-detected",
                                    "message": format!(
                                        "the last {} calls to {} were identical; change approach",
                                        self.options.doom_threshold, call.name
                                    ),
                                    "retryable": false,
                                    "suggestions": ["vary the arguments", "try a different tool"],
                                }
                            });
                            self.push_tool_exchange(&mut buffer, &call, error.to_string());
                            let _ = tx
                                .send(ExecEvent::ToolCall {
                                    id: call.id.clone(),
                                    name: call.name.clone(),
                                    input: call.args.clone(),
                                    is_subagent: false,
                                })
                                .await;
                            let _ = tx
                                .send(ExecEvent::ToolError {
                                    id: call.id.clone(),
                                    name: call.name.clone(),
                                    error,
                                    duration_ms: 0,
                                })
                                .await;
                            continue;
                        }
                        DoomLoopAction::Terminate => {
                            return self
                                .fail(
                                    &tx,
                                    started,
                                    final_text,
                                    usage,
                                    traces,
                                    format!("doom loop detected on tool {:?}", call.name),
                                )
                                .await;
                        }
                    }
                }

                steps += 1;
                let near_cap = (steps as f32) >= (self.options.max_steps as f32) * 0.9;
                if near_cap && !warned_near_cap {
                    warned_near_cap = true;
                    let _ = tx
                        .send(ExecEvent::StepWarning { used: steps, max: self.options.max_steps })
                        .await;
                }
                if steps == self.options.max_steps && !warned_at_cap {
                    warned_at_cap = true;
                    let _ = tx
                        .send(ExecEvent::StepWarning { used: steps, max: self.options.max_steps })
                        .await;
                }

                let is_subagent = self.subagent_names.contains(&call.name);
                buffer.push(Message::tool_call(
                    call.id.clone(),
                    call.name.clone(),
                    call.args.to_string(),
                ));
                self.persist(
                    "assistant",
                    vec![MessagePart::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.args.clone(),
                    }],
                    None,
                );
                let _ = tx
                    .send(ExecEvent::ToolCall {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.args.clone(),
                        is_subagent,
                    })
                    .await;

                let call_started = Instant::now();
                let call_offset = started.elapsed().as_millis() as u64;
                let output = match tokio::time::timeout(
                    self.options.tool_timeout,
                    self.tools.execute(&call),
                )
                .await
                {
                    Ok(output) => output,
                    Err(_) => agentuse_tools::ToolOutput::err(
                        &call.id,
                        format!(
                            "tool call timed out after {}s",
                            self.options.tool_timeout.as_secs()
                        ),
                    ),
                };
                let duration_ms = call_started.elapsed().as_millis() as u64;

                // Sub-agent tools report their nested token usage in metadata.
                let subagent_tokens = output
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("tokensUsed"))
                    .and_then(|v| v.as_u64())
                    .map(|v| v as u32);
                let pre_structured = output
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("structured"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);

                if output.is_error {
                    // Tool failures become in-band structured results.  MCP
                    // proxies arrive pre-structured; everything else is
                    // classified here.
                    let structured: Value = if pre_structured {
                        serde_json::from_str(&output.content)
                            .unwrap_or_else(|_| structured_error_json(&call.name, &output.content))
                    } else {
                        structured_error_json(&call.name, &output.content)
                    };
                    let body = structured.to_string();
                    buffer.push(Message::tool_result(call.id.clone(), body.clone()));
                    self.persist(
                        "tool",
                        vec![MessagePart::ToolResult {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            output: body,
                        }],
                        None,
                    );
                    let _ = tx
                        .send(ExecEvent::ToolError {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            error: structured,
                            duration_ms,
                        })
                        .await;
                } else {
                    buffer.push(Message::tool_result(call.id.clone(), output.content.clone()));
                    self.persist(
                        "tool",
                        vec![MessagePart::ToolResult {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            output: output.content.clone(),
                        }],
                        None,
                    );
                    let _ = tx
                        .send(ExecEvent::ToolResult {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            output: output.content.clone(),
                            duration_ms,
                        })
                        .await;
                }

                if let Some(tokens) = subagent_tokens {
                    usage.add(0, tokens);
                }
                traces.push(ToolCallTrace {
                    name: call.name.clone(),
                    kind: if is_subagent { TraceKind::Subagent } else { TraceKind::Tool },
                    start_ms: call_offset,
                    duration_ms,
                    tokens: subagent_tokens,
                    success: !output.is_error,
                });
            }
        }
    }

    /// Consume one model stream, accumulating text and tool-call deltas.
    async fn stream_one_turn(
        &mut self,
        mut stream: agentuse_model::ResponseStream,
        tx: &mpsc::Sender<ExecEvent>,
        cancel: &mut oneshot::Receiver<()>,
        usage: &mut Usage,
        buffer: &mut Vec<Message>,
    ) -> TurnOutcome {
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut first_token_seen = false;
        let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();

        loop {
            let event = tokio::select! {
                biased;
                _ = &mut *cancel => return TurnOutcome::Aborted,
                event = stream.next() => event,
            };
            let Some(event) = event else {
                break;
            };
            let event = match event {
                Ok(event) => event,
                Err(e) => return TurnOutcome::Failed(format!("{e:#}")),
            };
            match event {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    if !first_token_seen {
                        first_token_seen = true;
                        let _ = tx.send(ExecEvent::LlmFirstToken).await;
                    }
                    text.push_str(&delta);
                    let _ = tx.send(ExecEvent::Text(delta)).await;
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ReasoningDelta(delta) => {
                    if !first_token_seen {
                        first_token_seen = true;
                        let _ = tx.send(ExecEvent::LlmFirstToken).await;
                    }
                    reasoning.push_str(&delta);
                    let _ = tx.send(ExecEvent::Reasoning(delta)).await;
                }
                ResponseEvent::ToolCall { index, id, name, arguments } => {
                    let slot = pending.entry(index).or_default();
                    if !id.is_empty() {
                        slot.id = id;
                    }
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.args_buf.push_str(&arguments);
                }
                ResponseEvent::Usage { input_tokens, output_tokens } => {
                    usage.add(input_tokens, output_tokens);
                    self.context.record_usage(input_tokens, output_tokens);
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(message) => {
                    warn!(%message, "model stream warning");
                }
            }
        }

        if !reasoning.is_empty() {
            buffer.push(Message {
                role: agentuse_model::Role::Assistant,
                content: agentuse_model::MessageContent::Reasoning { reasoning: reasoning.clone() },
            });
            self.persist("assistant", vec![MessagePart::Reasoning { text: reasoning }], None);
        }

        let mut calls = Vec::with_capacity(pending.len());
        for (i, (_, slot)) in pending.into_iter().enumerate() {
            if slot.name.is_empty() {
                warn!(call_id = %slot.id, "dropping tool call with empty name");
                continue;
            }
            calls.push(slot.finish(i));
        }
        TurnOutcome::Complete(text, calls)
    }

    /// Push a synthetic call/result pair (doom-loop replies) so the model
    /// sees a well-formed exchange on the next turn.
    fn push_tool_exchange(&self, buffer: &mut Vec<Message>, call: &ToolCall, result: String) {
        buffer.push(Message::tool_call(
            call.id.clone(),
            call.name.clone(),
            call.args.to_string(),
        ));
        self.persist(
            "assistant",
            vec![MessagePart::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.args.clone(),
            }],
            None,
        );
        buffer.push(Message::tool_result(call.id.clone(), result.clone()));
        self.persist(
            "tool",
            vec![MessagePart::ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                output: result,
            }],
            None,
        );
    }

    fn persist(&self, role: &str, parts: Vec<MessagePart>, tokens: Option<u32>) {
        if let Some(session) = &self.session {
            if let Err(e) = session.append(role, parts, tokens) {
                warn!(error = %e, "failed to persist session message");
            }
        }
    }

    async fn finish(
        mut self,
        tx: &mpsc::Sender<ExecEvent>,
        started: Instant,
        text: String,
        usage: Usage,
        tool_calls: Vec<ToolCallTrace>,
        reason: FinishReason,
    ) -> ExecSummary {
        let _ = tx.send(ExecEvent::Finish { reason, usage }).await;
        let session_id = self.complete_session(SessionStatus::Completed, None);
        ExecSummary {
            text,
            finish_reason: reason.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            usage,
            tool_calls,
            session_id,
        }
    }

    async fn abort(
        mut self,
        tx: &mpsc::Sender<ExecEvent>,
        started: Instant,
        text: String,
        usage: Usage,
        tool_calls: Vec<ToolCallTrace>,
    ) -> ExecSummary {
        debug!("execution aborted");
        let _ = tx
            .send(ExecEvent::Error { message: "aborted".into(), aborted: true })
            .await;
        let session_id = self.complete_session(SessionStatus::Aborted, None);
        ExecSummary {
            text,
            finish_reason: "aborted".into(),
            duration_ms: started.elapsed().as_millis() as u64,
            usage,
            tool_calls,
            session_id,
        }
    }

    async fn fail(
        mut self,
        tx: &mpsc::Sender<ExecEvent>,
        started: Instant,
        text: String,
        usage: Usage,
        tool_calls: Vec<ToolCallTrace>,
        message: String,
    ) -> ExecSummary {
        let _ = tx
            .send(ExecEvent::Error { message: message.clone(), aborted: false })
            .await;
        let session_id = self.complete_session(SessionStatus::Failed, Some(message));
        ExecSummary {
            text,
            finish_reason: "error".into(),
            duration_ms: started.elapsed().as_millis() as u64,
            usage,
            tool_calls,
            session_id,
        }
    }

    fn complete_session(&mut self, status: SessionStatus, error: Option<String>) -> Option<String> {
        let session = self.session.as_mut()?;
        let id = session.id().to_string();
        if let Err(e) = session.complete(status, error) {
            warn!(error = %e, "failed to finalise session");
        }
        Some(id)
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self, ordinal: usize) -> ToolCall {
        // Tool-call input must always be a JSON object; models occasionally
        // stream broken or empty argument payloads.
        let args = if self.args_buf.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool = %self.name,
                        error = %e,
                        "invalid JSON tool arguments; substituting {{}}"
                    );
                    Value::Object(Default::default())
                }
            }
        };
        let id = if self.id.is_empty() {
            format!("tc_synthetic_{ordinal}")
        } else {
            self.id
        };
        ToolCall { id, name: self.name, args }
    }
}
