// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A loaded agent: immutable instructions + configuration.
///
/// `source_path` is the canonicalised path of the file the agent was parsed
/// from; it anchors sub-agent resolution and the deterministic agent id.
#[derive(Debug, Clone)]
pub struct Agent {
    /// Display name, derived from the file stem unless the config overrides it.
    pub name: String,
    /// The markdown body of the agent file.
    pub instructions: String,
    pub config: AgentConfig,
    pub source_path: PathBuf,
}

/// Front-matter configuration of an agent file.
///
/// Keys the runtime does not recognise (`openai`, `anthropic`, …) are
/// collected into `provider_options` and forwarded verbatim to the model
/// driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Model reference, `provider:model-id`.  Required.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whole-run timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Cap on executed tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    /// MCP tool providers, keyed by name.  The key becomes the tool name
    /// prefix (`<name>_…`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mcp_servers: BTreeMap<String, McpServerSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subagents: Vec<SubAgentSpec>,
    #[serde(default, skip_serializing_if = "ToolsConfig::is_empty")]
    pub tools: ToolsConfig,
    /// Cron expression (5 fields, optional seconds) for service mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Provider-specific options forwarded verbatim (`openai:`, `anthropic:`, …).
    #[serde(flatten)]
    pub provider_options: BTreeMap<String, serde_json::Value>,
}

/// One MCP provider.  The two transports are distinguished by shape:
/// stdio specs carry `command`, http specs carry `url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpServerSpec {
    Stdio(StdioServerSpec),
    Http(HttpServerSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Literal environment overrides for the child process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Ambient variables that may be forwarded to the child.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_env_vars: Vec<String>,
    /// Variables that must be set in the ambient environment or pre-flight fails.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_env_vars: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpServerSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HttpAuth>,
}

/// Auth scheme for http providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HttpAuth {
    Bearer { token: String },
    Basic { username: String, password: String },
    Custom { headers: BTreeMap<String, String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAgentSpec {
    /// Agent file path, resolved relative to the parent agent's directory.
    pub path: String,
    /// Tool-name override; defaults to the sub-agent file stem.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
}

/// Built-in tool permissions.  Absent sections mean the tool is unavailable:
/// no `bash` block → no shell tool; empty `filesystem` → all paths denied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bash: Option<BashToolConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filesystem: Vec<FilesystemRule>,
    /// Name of the shared store this agent may access; `true` selects the
    /// agent-scoped default store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<serde_json::Value>,
}

impl ToolsConfig {
    pub fn is_empty(&self) -> bool {
        self.bash.is_none() && self.filesystem.is_empty() && self.store.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BashToolConfig {
    /// Allowlist of glob patterns, e.g. `npm *`, `git push *`.
    #[serde(default)]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemRule {
    /// Doublestar pattern; supports `~`, `${root}`, `${cwd}` prefixes.
    pub path: String,
    pub permissions: Vec<PathPermission>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathPermission {
    Read,
    Write,
    Edit,
}

impl std::fmt::Display for PathPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Edit => write!(f, "edit"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
