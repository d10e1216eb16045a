// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use agentuse_config::{expand_env_refs, McpServerSpec, StdioServerSpec};
use agentuse_tools::{Tool, ToolCall, ToolOutput, ToolRegistry};

use crate::client::{HttpClient, McpClient, StdioClient};
use crate::error::structured_error_json;

/// Ambient variables every stdio child receives even without an
/// `allowedEnvVars` entry.  Everything else must be listed explicitly.
const DEFAULT_FORWARDED_VARS: &[&str] = &["PATH", "HOME", "LANG", "TMPDIR"];

/// A provider that failed to launch.  Partial failure is allowed: the rest
/// of the tool set still works, and the model is told what is missing.
#[derive(Debug)]
pub struct ProviderFailure {
    pub name: String,
    pub error: String,
}

/// Owns every MCP connection of one execution.
///
/// The owner must call [`McpSupervisor::close_all`] on every exit path —
/// success, error, or cancellation.  Close errors are logged and swallowed.
pub struct McpSupervisor {
    clients: Vec<(String, Arc<dyn McpClient>)>,
}

impl McpSupervisor {
    /// Launch all configured providers concurrently.
    ///
    /// Returns the supervisor over the providers that came up, plus the
    /// failures for those that did not.
    pub async fn launch(
        servers: &BTreeMap<String, McpServerSpec>,
        ambient_env: &HashMap<String, String>,
    ) -> (Self, Vec<ProviderFailure>) {
        let launches = servers.iter().map(|(name, spec)| {
            let name = name.clone();
            let spec = spec.clone();
            let env = ambient_env.clone();
            async move {
                let result: anyhow::Result<Arc<dyn McpClient>> = match &spec {
                    McpServerSpec::Stdio(stdio) => {
                        let child_env = compose_child_env(stdio, &env);
                        StdioClient::spawn(&stdio.command, &stdio.args, &child_env)
                            .await
                            .map(|c| Arc::new(c) as Arc<dyn McpClient>)
                    }
                    McpServerSpec::Http(http) => {
                        let mut resolved = http.clone();
                        resolved.url = expand_env_refs(&http.url, &env);
                        if let Some(agentuse_config::HttpAuth::Bearer { token }) =
                            &mut resolved.auth
                        {
                            *token = expand_env_refs(token, &env);
                        }
                        HttpClient::connect(&resolved)
                            .await
                            .map(|c| Arc::new(c) as Arc<dyn McpClient>)
                    }
                };
                (name, result)
            }
        });

        let mut clients = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in futures::future::join_all(launches).await {
            match result {
                Ok(client) => {
                    debug!(provider = %name, "MCP provider connected");
                    clients.push((name, client));
                }
                Err(e) => {
                    warn!(provider = %name, error = %e, "MCP provider failed to launch");
                    failures.push(ProviderFailure { name, error: format!("{e:#}") });
                }
            }
        }

        (Self { clients }, failures)
    }

    /// Wrap a pre-connected client (used by tests and by nested executions
    /// that share a provider).
    pub fn from_clients(clients: Vec<(String, Arc<dyn McpClient>)>) -> Self {
        Self { clients }
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.clients.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Project every provider's tools into `registry` under a
    /// `<provider>_` prefix, and add the two synthetic resource tools per
    /// provider so resource-oriented servers are reachable through the
    /// tools-only interface.
    pub async fn register_tools(&self, registry: &mut ToolRegistry) -> anyhow::Result<()> {
        for (name, client) in &self.clients {
            let tools = client
                .list_tools()
                .await
                .unwrap_or_else(|e| {
                    warn!(provider = %name, error = %e, "list_tools failed; provider contributes no tools");
                    Vec::new()
                });
            for info in tools {
                registry.register(McpProxyTool {
                    provider: name.clone(),
                    remote_name: info.name.clone(),
                    tool_name: format!("{}_{}", agentuse_tools::tool::sanitize_tool_name(name), info.name),
                    description: info.description,
                    schema: info.input_schema,
                    client: client.clone(),
                })?;
            }
            let prefix = agentuse_tools::tool::sanitize_tool_name(name);
            registry.register(ListResourcesTool {
                provider: name.clone(),
                tool_name: format!("{prefix}_list_resources"),
                client: client.clone(),
            })?;
            registry.register(ReadResourceTool {
                provider: name.clone(),
                tool_name: format!("{prefix}_read_resource"),
                client: client.clone(),
            })?;
        }
        Ok(())
    }

    /// Close every client, swallowing close errors.  Safe to call twice.
    pub async fn close_all(&self) {
        for (name, client) in &self.clients {
            if let Err(e) = client.close().await {
                debug!(provider = %name, error = %e, "error closing MCP client");
            }
        }
    }
}

/// Build the environment for a stdio provider child: minimal defaults, plus
/// the variables named in `allowedEnvVars` (taken from the ambient
/// environment), plus literal `env` overrides (with `${env:VAR}` expanded).
pub fn compose_child_env(
    spec: &StdioServerSpec,
    ambient: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for var in DEFAULT_FORWARDED_VARS {
        if let Some(value) = ambient.get(*var) {
            env.insert((*var).to_string(), value.clone());
        }
    }
    for var in &spec.allowed_env_vars {
        if let Some(value) = ambient.get(var) {
            env.insert(var.clone(), value.clone());
        }
    }
    for var in &spec.required_env_vars {
        if let Some(value) = ambient.get(var) {
            env.insert(var.clone(), value.clone());
        }
    }
    for (key, value) in &spec.env {
        env.insert(key.clone(), expand_env_refs(value, ambient));
    }
    env
}

// ─── Proxy tools ──────────────────────────────────────────────────────────────

struct McpProxyTool {
    provider: String,
    remote_name: String,
    tool_name: String,
    description: String,
    schema: Value,
    client: Arc<dyn McpClient>,
}

#[async_trait]
impl Tool for McpProxyTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.client.call_tool(&self.remote_name, call.args.clone()).await {
            Ok(outcome) if !outcome.is_error => ToolOutput::ok(&call.id, outcome.content),
            Ok(outcome) => structured_failure(&call.id, &self.provider, &outcome.content),
            Err(e) => structured_failure(&call.id, &self.provider, &format!("{e:#}")),
        }
    }
}

/// Provider error → structured result the model can read.  The metadata flag
/// tells the executor the content is already in the structured error shape.
fn structured_failure(call_id: &str, provider: &str, message: &str) -> ToolOutput {
    let body = structured_error_json(provider, message);
    ToolOutput::err(call_id, body.to_string()).with_metadata(json!({ "structured": true }))
}

struct ListResourcesTool {
    provider: String,
    tool_name: String,
    client: Arc<dyn McpClient>,
}

#[async_trait]
impl Tool for ListResourcesTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        "List the resources this provider exposes (uri, name, description)."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.client.list_resources().await {
            Ok(resources) => match serde_json::to_string_pretty(&resources) {
                Ok(s) => ToolOutput::ok(&call.id, s),
                Err(e) => ToolOutput::err(&call.id, e.to_string()),
            },
            Err(e) => structured_failure(&call.id, &self.provider, &format!("{e:#}")),
        }
    }
}

struct ReadResourceTool {
    provider: String,
    tool_name: String,
    client: Arc<dyn McpClient>,
}

#[async_trait]
impl Tool for ReadResourceTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        "Read one resource by uri from this provider."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "uri": { "type": "string" } },
            "required": ["uri"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let uri = match call.args.get("uri").and_then(|v| v.as_str()) {
            Some(u) => u,
            None => return ToolOutput::err(&call.id, "missing required parameter 'uri'"),
        };
        match self.client.read_resource(uri).await {
            Ok(text) => ToolOutput::ok(&call.id, text),
            Err(e) => structured_failure(&call.id, &self.provider, &format!("{e:#}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::client::{McpCallOutcome, McpResourceInfo, McpToolInfo};

    /// In-memory client exposing one echo tool and one resource.
    struct FakeClient {
        fail_calls: bool,
        closed: std::sync::atomic::AtomicBool,
    }

    impl FakeClient {
        fn new(fail_calls: bool) -> Self {
            Self { fail_calls, closed: std::sync::atomic::AtomicBool::new(false) }
        }
    }

    #[async_trait]
    impl McpClient for FakeClient {
        async fn list_tools(&self) -> Result<Vec<McpToolInfo>> {
            Ok(vec![McpToolInfo {
                name: "echo".into(),
                description: "echo".into(),
                input_schema: json!({"type": "object"}),
            }])
        }
        async fn list_resources(&self) -> Result<Vec<McpResourceInfo>> {
            Ok(vec![McpResourceInfo {
                uri: "mem://greeting".into(),
                name: "greeting".into(),
                description: None,
            }])
        }
        async fn call_tool(&self, _name: &str, args: Value) -> Result<McpCallOutcome> {
            if self.fail_calls {
                anyhow::bail!("HTTP 429 rate limited");
            }
            Ok(McpCallOutcome { content: args.to_string(), is_error: false })
        }
        async fn read_resource(&self, uri: &str) -> Result<String> {
            Ok(format!("contents of {uri}"))
        }
        async fn close(&self) -> Result<()> {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall { id: "tc".into(), name: name.into(), args }
    }

    #[tokio::test]
    async fn tools_are_registered_with_provider_prefix() {
        let sup = McpSupervisor::from_clients(vec![(
            "github".into(),
            Arc::new(FakeClient::new(false)) as Arc<dyn McpClient>,
        )]);
        let mut reg = ToolRegistry::new();
        sup.register_tools(&mut reg).await.unwrap();
        let names = reg.names();
        assert!(names.contains(&"github_echo".to_string()));
        assert!(names.contains(&"github_list_resources".to_string()));
        assert!(names.contains(&"github_read_resource".to_string()));
    }

    #[tokio::test]
    async fn proxy_tool_forwards_arguments() {
        let sup = McpSupervisor::from_clients(vec![(
            "p".into(),
            Arc::new(FakeClient::new(false)) as Arc<dyn McpClient>,
        )]);
        let mut reg = ToolRegistry::new();
        sup.register_tools(&mut reg).await.unwrap();
        let out = reg.execute(&call("p_echo", json!({"x": 1}))).await;
        assert!(!out.is_error);
        assert!(out.content.contains("\"x\":1"));
    }

    #[tokio::test]
    async fn provider_error_becomes_structured_result() {
        let sup = McpSupervisor::from_clients(vec![(
            "p".into(),
            Arc::new(FakeClient::new(true)) as Arc<dyn McpClient>,
        )]);
        let mut reg = ToolRegistry::new();
        sup.register_tools(&mut reg).await.unwrap();
        let out = reg.execute(&call("p_echo", json!({}))).await;
        assert!(out.is_error);
        let body: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["type"], "rate_limit");
        assert_eq!(body["error"]["retryable"], true);
        assert_eq!(out.metadata.unwrap()["structured"], true);
    }

    #[tokio::test]
    async fn resource_tools_list_and_read() {
        let sup = McpSupervisor::from_clients(vec![(
            "p".into(),
            Arc::new(FakeClient::new(false)) as Arc<dyn McpClient>,
        )]);
        let mut reg = ToolRegistry::new();
        sup.register_tools(&mut reg).await.unwrap();

        let out = reg.execute(&call("p_list_resources", json!({}))).await;
        assert!(out.content.contains("mem://greeting"));

        let out = reg
            .execute(&call("p_read_resource", json!({"uri": "mem://greeting"})))
            .await;
        assert_eq!(out.content, "contents of mem://greeting");
    }

    #[tokio::test]
    async fn close_all_reaches_every_client() {
        let a = Arc::new(FakeClient::new(false));
        let b = Arc::new(FakeClient::new(false));
        let sup = McpSupervisor::from_clients(vec![
            ("a".into(), a.clone() as Arc<dyn McpClient>),
            ("b".into(), b.clone() as Arc<dyn McpClient>),
        ]);
        sup.close_all().await;
        assert!(a.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(b.closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn child_env_is_minimal_plus_allowed_plus_literal() {
        let spec = StdioServerSpec {
            command: "server".into(),
            args: vec![],
            env: BTreeMap::from([("MODE".to_string(), "prod".to_string())]),
            allowed_env_vars: vec!["GITHUB_TOKEN".into()],
            required_env_vars: vec![],
        };
        let ambient = HashMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("GITHUB_TOKEN".to_string(), "tok".to_string()),
            ("SECRET_UNRELATED".to_string(), "leak-me-not".to_string()),
        ]);
        let env = compose_child_env(&spec, &ambient);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("GITHUB_TOKEN").map(String::as_str), Some("tok"));
        assert_eq!(env.get("MODE").map(String::as_str), Some("prod"));
        assert!(!env.contains_key("SECRET_UNRELATED"));
    }

    #[test]
    fn literal_env_values_expand_refs() {
        let spec = StdioServerSpec {
            command: "server".into(),
            args: vec![],
            env: BTreeMap::from([("KEY".to_string(), "${env:SOURCE}".to_string())]),
            allowed_env_vars: vec![],
            required_env_vars: vec![],
        };
        let ambient = HashMap::from([("SOURCE".to_string(), "resolved".to_string())]);
        let env = compose_child_env(&spec, &ambient);
        assert_eq!(env.get("KEY").map(String::as_str), Some("resolved"));
    }
}
