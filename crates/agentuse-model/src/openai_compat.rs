// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat-completions driver.
//!
//! One driver covers every provider that speaks the `/chat/completions`
//! SSE streaming wire format — OpenAI itself, the gateways (OpenRouter),
//! the fast-inference platforms (Groq, Together), and local llama.cpp-style
//! servers.  Provider-specific request options from the agent front-matter
//! are merged verbatim into the request body.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{provider::ResponseStream, CompletionRequest, MessageContent, ResponseEvent, Role};

pub struct OpenAiCompatProvider {
    driver_name: &'static str,
    model: String,
    /// Full chat completions URL, e.g. `https://api.groq.com/openai/v1/chat/completions`.
    chat_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        driver_name: &'static str,
        model: &str,
        base_url: &str,
        api_key: Option<String>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model: model.to_string(),
            chat_url: format!("{base}/chat/completions"),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let messages = build_wire_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        // Agent-supplied provider options override anything set above.
        if let Some(Value::Object(map)) = &req.options {
            for (k, v) in map {
                body[k] = v.clone();
            }
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = req.messages.len(),
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        // SSE events can be split across TCP packets; keep a line buffer
        // across chunks and only parse complete lines.
        let event_stream = resp
            .bytes_stream()
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(bytes) => {
                        buf.push_str(&String::from_utf8_lossy(&bytes));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Drain all complete `\n`-terminated SSE lines from `buf`, leaving any
/// trailing partial line for the next chunk.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Parse one complete SSE `data:` line.  Empty lines, comments, and
/// unparseable payloads yield `None`.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(Ok(parse_sse_chunk(&v)))
}

fn parse_sse_chunk(v: &Value) -> ResponseEvent {
    // Usage-only chunk (stream_options.include_usage).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        };
    }

    let delta = &v["choices"][0]["delta"];

    // Each SSE chunk carries at most one tool-call delta; the index routes
    // accumulation in the executor.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return ResponseEvent::ToolCall {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        };
    }

    // Reasoning deltas: `reasoning_content` (llama.cpp, DeepSeek) or
    // `reasoning` (OpenRouter).
    if let Some(thinking) = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()))
    {
        if !thinking.is_empty() {
            return ResponseEvent::ReasoningDelta(thinking.to_string());
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return ResponseEvent::TextDelta(text.to_string());
    }

    ResponseEvent::TextDelta(String::new())
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Convert the internal message list into the OpenAI wire-format array.
///
/// Consecutive `ToolCall` messages are coalesced into a single assistant
/// message with a `tool_calls` array (the parallel-tool-call contract), and
/// reasoning blocks are dropped — they are session-log material, not
/// conversation state.
fn build_wire_messages(messages: &[crate::Message]) -> Vec<Value> {
    let mut result: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        match &messages[i].content {
            MessageContent::ToolCall { tool_call_id, function } => {
                let mut calls = vec![tool_call_json(tool_call_id, function)];
                i += 1;
                while i < messages.len() {
                    if let MessageContent::ToolCall { tool_call_id, function } =
                        &messages[i].content
                    {
                        calls.push(tool_call_json(tool_call_id, function));
                        i += 1;
                    } else {
                        break;
                    }
                }
                result.push(json!({ "role": "assistant", "tool_calls": calls }));
            }
            MessageContent::Text(t) => {
                result.push(json!({ "role": role_str(&messages[i].role), "content": t }));
                i += 1;
            }
            MessageContent::ToolResult { tool_call_id, content } => {
                result.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                }));
                i += 1;
            }
            MessageContent::Reasoning { .. } => {
                i += 1;
            }
        }
    }

    result
}

fn tool_call_json(tool_call_id: &str, function: &crate::FunctionCall) -> Value {
    json!({
        "id": tool_call_id,
        "type": "function",
        "function": {
            "name": function.name,
            "arguments": function.arguments,
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    #[test]
    fn consecutive_tool_calls_coalesce_into_one_assistant_message() {
        let messages = vec![
            Message::user("go"),
            Message::tool_call("a", "bash", "{}"),
            Message::tool_call("b", "read", "{}"),
            Message::tool_result("a", "out-a"),
        ];
        let wire = build_wire_messages(&messages);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["role"], "assistant");
        assert_eq!(wire[1]["tool_calls"].as_array().unwrap().len(), 2);
        assert_eq!(wire[2]["role"], "tool");
    }

    #[test]
    fn reasoning_messages_are_not_sent_on_the_wire() {
        let messages = vec![
            Message::user("go"),
            Message {
                role: Role::Assistant,
                content: MessageContent::Reasoning { reasoning: "thinking…".into() },
            },
            Message::assistant("done"),
        ];
        let wire = build_wire_messages(&messages);
        assert_eq!(wire.len(), 2);
    }

    #[test]
    fn sse_done_sentinel_parses() {
        assert!(matches!(
            parse_sse_data_line("data: [DONE]"),
            Some(Ok(ResponseEvent::Done))
        ));
    }

    #[test]
    fn sse_text_delta_parses() {
        let line = r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#;
        match parse_sse_data_line(line) {
            Some(Ok(ResponseEvent::TextDelta(t))) => assert_eq!(t, "hi"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn sse_tool_call_delta_parses() {
        let line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"tc1","function":{"name":"bash","arguments":"{\"c"}}]}}]}"#;
        match parse_sse_data_line(line) {
            Some(Ok(ResponseEvent::ToolCall { id, name, arguments, .. })) => {
                assert_eq!(id, "tc1");
                assert_eq!(name, "bash");
                assert!(arguments.starts_with("{\"c"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn sse_usage_chunk_parses() {
        let line = r#"data: {"usage":{"prompt_tokens":12,"completion_tokens":3},"choices":[]}"#;
        match parse_sse_data_line(line) {
            Some(Ok(ResponseEvent::Usage { input_tokens, output_tokens })) => {
                assert_eq!(input_tokens, 12);
                assert_eq!(output_tokens, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn partial_sse_lines_wait_for_more_bytes() {
        let mut buf = String::from("data: {\"choices\":[{\"delta\":{\"content\":\"par");
        assert!(drain_complete_sse_lines(&mut buf).is_empty());
        buf.push_str("tial\"}}]}\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(buf.is_empty());
    }
}
