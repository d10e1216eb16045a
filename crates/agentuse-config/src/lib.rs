// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `agentuse-config` — agent file model and loading.
//!
//! An agent file (`*.agentuse`) is UTF-8 markdown with a YAML front-matter
//! block between `---` fences.  The front-matter becomes [`AgentConfig`];
//! the markdown body becomes the agent's instructions.  Agents are immutable
//! once loaded — hot reload produces a new [`Agent`] instance.
//!
//! This crate also owns the environment-variable policy: extraction of
//! `${env:VAR}` references, `requiredEnvVars` / `allowedEnvVars` lists, and
//! the pre-flight validation that runs before any MCP provider is started.

mod agent_id;
mod envref;
mod frontmatter;
mod schema;

pub use agent_id::agent_id_for_path;
pub use envref::{expand_env_refs, extract_env_refs, validate_env, EnvCheck, EnvRef, EnvRefKind};
pub use frontmatter::{parse_agent_file, parse_agent_str, AgentParseError};
pub use schema::{
    Agent, AgentConfig, BashToolConfig, FilesystemRule, HttpAuth, HttpServerSpec, McpServerSpec,
    PathPermission, StdioServerSpec, SubAgentSpec, ToolsConfig,
};

/// File extension recognised as an agent definition.
pub const AGENT_FILE_EXTENSION: &str = "agentuse";

/// Directory (under the project root) holding all runtime state:
/// sessions, stores.  Its presence marks the project root.
pub const STATE_DIR_NAME: &str = ".agentuse";

/// Walk up from `start` looking for a directory that contains `.agentuse/`.
/// Falls back to `start` itself when no marker is found, so a bare checkout
/// still gets a sandbox boundary.
pub fn find_project_root(start: &std::path::Path) -> std::path::PathBuf {
    let mut dir = if start.is_file() {
        start.parent().unwrap_or(start)
    } else {
        start
    };
    loop {
        if dir.join(STATE_DIR_NAME).is_dir() {
            return dir.to_path_buf();
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return start.to_path_buf(),
        }
    }
}
