// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The minimal MCP client interface and its rmcp-backed implementations.
//!
//! The supervisor only ever needs five operations, so that is the whole
//! trait: `list_tools`, `list_resources`, `call_tool`, `read_resource`,
//! `close`.  Anything that satisfies it can stand in for rmcp — tests use a
//! scripted in-memory client.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParams, ReadResourceRequestParams};
use rmcp::service::{RoleClient, RunningService, ServiceExt};
use serde_json::Value;
use tokio::sync::Mutex;

use agentuse_config::{HttpAuth, HttpServerSpec};

/// How long a closing stdio child gets before SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// A tool as reported by a provider, before prefixing.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A resource as reported by a provider.
#[derive(Debug, Clone, serde::Serialize)]
pub struct McpResourceInfo {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result of one tool call against a provider.
#[derive(Debug, Clone)]
pub struct McpCallOutcome {
    pub content: String,
    pub is_error: bool,
}

#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>>;
    async fn list_resources(&self) -> Result<Vec<McpResourceInfo>>;
    async fn call_tool(&self, name: &str, args: Value) -> Result<McpCallOutcome>;
    async fn read_resource(&self, uri: &str) -> Result<String>;
    /// Close the connection.  Idempotent; errors are for logging only.
    async fn close(&self) -> Result<()>;
}

// ─── rmcp-backed clients ──────────────────────────────────────────────────────

type Service = RunningService<RoleClient, ()>;

/// Stdio provider: a child process speaking line-delimited JSON-RPC.
pub struct StdioClient {
    service: Mutex<Option<Service>>,
    child: Mutex<Option<tokio::process::Child>>,
}

impl StdioClient {
    /// Spawn `command args…` with exactly `env` as its environment and
    /// negotiate the MCP handshake over its stdio.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args);
        cmd.env_clear();
        cmd.envs(env);
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn MCP server {command:?}"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout of {command:?}"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin of {command:?}"))?;
        if let Some(mut stderr) = child.stderr.take() {
            // Drain stderr so a chatty server cannot block on a full pipe.
            tokio::spawn(async move {
                let mut sink = tokio::io::sink();
                let _ = tokio::io::copy(&mut stderr, &mut sink).await;
            });
        }

        let service = ()
            .serve((stdout, stdin))
            .await
            .with_context(|| format!("MCP handshake with {command:?} failed"))?;

        Ok(Self {
            service: Mutex::new(Some(service)),
            child: Mutex::new(Some(child)),
        })
    }

}

#[async_trait]
impl McpClient for StdioClient {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("MCP client already closed"))?;
        let response = service.list_tools(None).await?;
        Ok(response.tools.iter().map(tool_info).collect())
    }

    async fn list_resources(&self) -> Result<Vec<McpResourceInfo>> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("MCP client already closed"))?;
        let response = service.list_resources(None).await?;
        Ok(response.resources.iter().map(resource_info).collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<McpCallOutcome> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("MCP client already closed"))?;
        let result = service
            .call_tool({
                let mut params = CallToolRequestParams::new(name.to_string());
                params.arguments = args.as_object().cloned();
                params
            })
            .await?;
        Ok(call_outcome(&result))
    }

    async fn read_resource(&self, uri: &str) -> Result<String> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("MCP client already closed"))?;
        let result = service
            .read_resource(ReadResourceRequestParams::new(uri.to_string()))
            .await?;
        Ok(resource_text(&result))
    }

    async fn close(&self) -> Result<()> {
        if let Some(service) = self.service.lock().await.take() {
            let _ = service.cancel().await;
        }
        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }
        Ok(())
    }
}

/// HTTP provider: a remote MCP endpoint over streamable HTTP.
pub struct HttpClient {
    service: Mutex<Option<Service>>,
}

impl HttpClient {
    /// Connect to `spec.url` with the configured auth headers.
    pub async fn connect(spec: &HttpServerSpec) -> Result<Self> {
        use rmcp::transport::StreamableHttpClientTransport;
        use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(auth) = &spec.auth {
            match auth {
                HttpAuth::Bearer { token } => {
                    headers.insert(
                        reqwest::header::AUTHORIZATION,
                        format!("Bearer {token}").parse().context("invalid bearer token")?,
                    );
                }
                HttpAuth::Basic { username, password } => {
                    use base64_engine::encode_basic;
                    headers.insert(
                        reqwest::header::AUTHORIZATION,
                        encode_basic(username, password).parse().context("invalid basic auth")?,
                    );
                }
                HttpAuth::Custom { headers: custom } => {
                    for (name, value) in custom {
                        let header_name: reqwest::header::HeaderName =
                            name.parse().with_context(|| format!("invalid header name {name:?}"))?;
                        headers.insert(
                            header_name,
                            value.parse().with_context(|| format!("invalid value for header {name:?}"))?,
                        );
                    }
                }
            }
        }
        if let Some(session) = &spec.session_id {
            headers.insert(
                "Mcp-Session-Id",
                session.parse().context("invalid session id")?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;
        let transport = StreamableHttpClientTransport::with_client(
            client,
            StreamableHttpClientTransportConfig::with_uri(spec.url.clone()),
        );
        let service = ()
            .serve(transport)
            .await
            .with_context(|| format!("failed to connect to MCP server at {}", spec.url))?;

        Ok(Self { service: Mutex::new(Some(service)) })
    }
}

#[async_trait]
impl McpClient for HttpClient {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("MCP client already closed"))?;
        let response = service.list_tools(None).await?;
        Ok(response.tools.iter().map(tool_info).collect())
    }

    async fn list_resources(&self) -> Result<Vec<McpResourceInfo>> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("MCP client already closed"))?;
        let response = service.list_resources(None).await?;
        Ok(response.resources.iter().map(resource_info).collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<McpCallOutcome> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("MCP client already closed"))?;
        let result = service
            .call_tool({
                let mut params = CallToolRequestParams::new(name.to_string());
                params.arguments = args.as_object().cloned();
                params
            })
            .await?;
        Ok(call_outcome(&result))
    }

    async fn read_resource(&self, uri: &str) -> Result<String> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| anyhow!("MCP client already closed"))?;
        let result = service
            .read_resource(ReadResourceRequestParams::new(uri.to_string()))
            .await?;
        Ok(resource_text(&result))
    }

    async fn close(&self) -> Result<()> {
        if let Some(service) = self.service.lock().await.take() {
            let _ = service.cancel().await;
        }
        Ok(())
    }
}

// ─── Wire-type conversion ─────────────────────────────────────────────────────

fn tool_info(tool: &rmcp::model::Tool) -> McpToolInfo {
    McpToolInfo {
        name: tool.name.to_string(),
        description: tool
            .description
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default(),
        input_schema: Value::Object((*tool.input_schema).clone()),
    }
}

fn resource_info(resource: &rmcp::model::Resource) -> McpResourceInfo {
    McpResourceInfo {
        uri: resource.uri.to_string(),
        name: resource.name.to_string(),
        description: resource.description.as_ref().map(|d| d.to_string()),
    }
}

fn call_outcome(result: &rmcp::model::CallToolResult) -> McpCallOutcome {
    let content = result
        .content
        .iter()
        .filter_map(|c| c.as_text().map(|t| t.text.clone()))
        .collect::<Vec<_>>()
        .join("\n");
    McpCallOutcome {
        content,
        is_error: result.is_error.unwrap_or(false),
    }
}

fn resource_text(result: &rmcp::model::ReadResourceResult) -> String {
    result
        .contents
        .iter()
        .map(|c| match c {
            rmcp::model::ResourceContents::TextResourceContents { text, .. } => text.clone(),
            rmcp::model::ResourceContents::BlobResourceContents { uri, .. } => {
                format!("[binary resource: {uri}]")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// Minimal basic-auth encoding; avoids pulling the full base64 crate into the
// dependency graph for one header.
mod base64_engine {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    pub fn encode_basic(username: &str, password: &str) -> String {
        let raw = format!("{username}:{password}");
        let bytes = raw.as_bytes();
        let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
        for chunk in bytes.chunks(3) {
            let b = [
                chunk[0],
                chunk.get(1).copied().unwrap_or(0),
                chunk.get(2).copied().unwrap_or(0),
            ];
            out.push(TABLE[(b[0] >> 2) as usize] as char);
            out.push(TABLE[(((b[0] & 0x03) << 4) | (b[1] >> 4)) as usize] as char);
            out.push(if chunk.len() > 1 {
                TABLE[(((b[1] & 0x0f) << 2) | (b[2] >> 6)) as usize] as char
            } else {
                '='
            });
            out.push(if chunk.len() > 2 {
                TABLE[(b[2] & 0x3f) as usize] as char
            } else {
                '='
            });
        }
        format!("Basic {out}")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn rfc_example() {
            // RFC 7617's Aladdin example.
            assert_eq!(
                encode_basic("Aladdin", "open sesame"),
                "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
            );
        }

        #[test]
        fn padding_variants() {
            assert_eq!(encode_basic("a", ""), "Basic YTo=");
            assert_eq!(encode_basic("ab", ""), "Basic YWI6");
        }
    }
}
