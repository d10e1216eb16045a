// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-set assembly for one execution.
//!
//! Combines, in order: built-in tools gated by the agent's permissions,
//! MCP provider tools (prefixed), and sub-agent tools.  Name uniqueness is
//! enforced by the registry.  Sub-agent cycles are detected *here*, before
//! any MCP provider is launched or model called.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::warn;

use agentuse_config::{parse_agent_file, Agent};
use agentuse_mcp::{McpSupervisor, ProviderFailure};
use agentuse_session::SessionManager;
use agentuse_tools::{
    register_store_tools, BashTool, EditTool, PathValidator, ReadTool, Store, Tool, ToolRegistry,
    WriteTool,
};

use crate::subagent::SubAgentTool;

/// Default cap on sub-agent nesting.
pub const DEFAULT_MAX_DEPTH: usize = 2;

/// Everything an execution needs to know about where and how it runs.
#[derive(Clone)]
pub struct BuildContext {
    pub project_root: PathBuf,
    /// Environment snapshot; the core never reads the process environment.
    pub env: HashMap<String, String>,
    /// Canonical agent paths currently executing, outermost first.
    pub call_stack: Vec<PathBuf>,
    pub depth: usize,
    pub max_depth: usize,
    pub session_manager: Option<SessionManager>,
    pub parent_session_id: Option<String>,
    /// Model override propagated from the caller into sub-agents.
    pub model_override: Option<String>,
}

impl BuildContext {
    pub fn new(project_root: impl Into<PathBuf>, env: HashMap<String, String>) -> Self {
        Self {
            project_root: project_root.into(),
            env,
            call_stack: Vec::new(),
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            session_manager: None,
            parent_session_id: None,
            model_override: None,
        }
    }
}

/// The assembled tool set plus the resources that must be closed with it.
pub struct ToolSetBuild {
    pub registry: Arc<ToolRegistry>,
    pub supervisor: Arc<McpSupervisor>,
    pub subagent_names: HashSet<String>,
    /// Providers that failed to launch (partial failure is allowed).
    pub provider_failures: Vec<ProviderFailure>,
}

impl std::fmt::Debug for ToolSetBuild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSetBuild")
            .field("subagent_names", &self.subagent_names)
            .field("provider_failures", &self.provider_failures)
            .finish_non_exhaustive()
    }
}

/// Build the full tool set for `agent`.
///
/// Fails fast — before launching anything — when the sub-agent graph
/// contains a cycle.
pub async fn build_tool_set(agent: &Agent, ctx: &BuildContext) -> Result<ToolSetBuild> {
    // Cycle detection first: parsing only, no MCP or model activity.
    let mut stack = ctx.call_stack.clone();
    stack.push(agent.source_path.clone());
    validate_subagent_graph(agent, &stack, ctx.depth, ctx.max_depth)?;

    let mut registry = ToolRegistry::new();

    // ── Built-ins, gated by the agent's permission config ────────────────────
    if let Some(bash) = &agent.config.tools.bash {
        registry.register(BashTool::new(bash.commands.clone(), ctx.project_root.clone()))?;
    }
    if !agent.config.tools.filesystem.is_empty() {
        let validator = Arc::new(PathValidator::new(
            &agent.config.tools.filesystem,
            ctx.project_root.clone(),
        ));
        registry.register(ReadTool::new(validator.clone()))?;
        registry.register(WriteTool::new(validator.clone()))?;
        registry.register(EditTool::new(validator))?;
    }
    if let Some(store_config) = &agent.config.tools.store {
        let store_name = store_config
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| agent.name.clone());
        let dir = ctx
            .project_root
            .join(".agentuse")
            .join("store")
            .join(&store_name);
        let store = Store::open(dir, agent.name.clone())
            .with_context(|| format!("cannot open store {store_name:?}"))?;
        register_store_tools(&mut registry, Arc::new(store))?;
    }

    // ── MCP providers ────────────────────────────────────────────────────────
    let (supervisor, provider_failures) =
        McpSupervisor::launch(&agent.config.mcp_servers, &ctx.env).await;
    supervisor.register_tools(&mut registry).await?;

    // ── Sub-agents ───────────────────────────────────────────────────────────
    let mut subagent_names = HashSet::new();
    if !agent.config.subagents.is_empty() {
        if ctx.depth >= ctx.max_depth {
            warn!(
                agent = %agent.name,
                depth = ctx.depth,
                "sub-agent depth cap reached; nested sub-agents are not installed"
            );
        } else {
            for spec in &agent.config.subagents {
                let child_ctx = BuildContext {
                    call_stack: stack.clone(),
                    depth: ctx.depth + 1,
                    ..ctx.clone()
                };
                let tool = SubAgentTool::build(spec, agent, child_ctx)?;
                subagent_names.insert(tool.name().to_string());
                registry.register(tool)?;
            }
        }
    }

    Ok(ToolSetBuild {
        registry: Arc::new(registry),
        supervisor: Arc::new(supervisor),
        subagent_names,
        provider_failures,
    })
}

/// Resolve a sub-agent path relative to its parent agent's directory.
pub fn resolve_subagent_path(parent: &Agent, spec_path: &str) -> PathBuf {
    let raw = Path::new(spec_path);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        parent
            .source_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(raw)
    };
    std::fs::canonicalize(&joined).unwrap_or(joined)
}

/// Recursive parse-only check of the sub-agent graph: no agent path may
/// appear twice in the active chain, and recursion stops at the depth cap.
fn validate_subagent_graph(
    agent: &Agent,
    stack: &[PathBuf],
    depth: usize,
    max_depth: usize,
) -> Result<()> {
    if depth >= max_depth {
        return Ok(());
    }
    for spec in &agent.config.subagents {
        let path = resolve_subagent_path(agent, &spec.path);
        if stack.contains(&path) {
            let chain: Vec<String> = stack
                .iter()
                .chain(std::iter::once(&path))
                .map(|p| {
                    p.file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or("?")
                        .to_string()
                })
                .collect();
            bail!("sub-agent cycle detected: {}", chain.join(" → "));
        }
        let child = parse_agent_file(&path)
            .with_context(|| format!("cannot parse sub-agent {}", path.display()))?;
        let mut child_stack = stack.to_vec();
        child_stack.push(path);
        validate_subagent_graph(&child, &child_stack, depth + 1, max_depth)?;
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
