// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Environment-variable policy.
//!
//! Three kinds of references can appear in an agent's config:
//!
//! - inline `${env:VAR}` placeholders anywhere in a string value — required;
//! - `requiredEnvVars` lists on stdio provider specs — required;
//! - `allowedEnvVars` lists on stdio provider specs — optional.
//!
//! [`validate_env`] is the pre-flight check that runs before any MCP
//! provider is started.  It never reads the process environment itself:
//! callers pass a snapshot, so the core stays free of global mutation.

use std::collections::HashMap;

use regex::Regex;
use serde::Serialize;

use crate::schema::{AgentConfig, McpServerSpec};

/// Where an environment-variable reference came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvRefKind {
    /// `${env:VAR}` inside a string value.
    Inline,
    /// Listed in a provider's `requiredEnvVars`.
    Required,
    /// Listed in a provider's `allowedEnvVars`.
    Allowed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvRef {
    pub var: String,
    pub kind: EnvRefKind,
    /// Human-readable source, e.g. `mcpServers.github` or `config`.
    pub source: String,
}

/// Result of the pre-flight environment check.
#[derive(Debug, Clone, Serialize)]
pub struct EnvCheck {
    pub valid: bool,
    pub missing_required: Vec<EnvRef>,
    pub missing_optional: Vec<EnvRef>,
}

impl EnvCheck {
    /// One-line human-readable summary of missing required variables.
    pub fn missing_summary(&self) -> String {
        self.missing_required
            .iter()
            .map(|r| format!("{} (from {})", r.var, r.source))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn env_ref_pattern() -> Regex {
    // Compiled on demand; the config walk runs once per execution.
    Regex::new(r"\$\{env:([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern")
}

/// Extract every environment-variable reference from an agent's config.
///
/// Inline references are discovered by walking the JSON form of the config,
/// so provider-specific option blocks are covered too.
pub fn extract_env_refs(config: &AgentConfig) -> Vec<EnvRef> {
    let mut refs = Vec::new();
    let pattern = env_ref_pattern();

    let value = serde_json::to_value(config).unwrap_or(serde_json::Value::Null);
    walk_strings(&value, "config", &mut |source, s| {
        for cap in pattern.captures_iter(s) {
            refs.push(EnvRef {
                var: cap[1].to_string(),
                kind: EnvRefKind::Inline,
                source: source.to_string(),
            });
        }
    });

    for (name, spec) in &config.mcp_servers {
        if let McpServerSpec::Stdio(stdio) = spec {
            let source = format!("mcpServers.{name}");
            for var in &stdio.required_env_vars {
                refs.push(EnvRef {
                    var: var.clone(),
                    kind: EnvRefKind::Required,
                    source: source.clone(),
                });
            }
            for var in &stdio.allowed_env_vars {
                refs.push(EnvRef {
                    var: var.clone(),
                    kind: EnvRefKind::Allowed,
                    source: source.clone(),
                });
            }
        }
    }

    // A variable that is both required and allowed is reported once, as
    // required (the stricter source wins).
    refs.sort_by(|a, b| a.var.cmp(&b.var).then_with(|| kind_rank(a.kind).cmp(&kind_rank(b.kind))));
    refs.dedup_by(|a, b| a.var == b.var && a.source == b.source);
    refs
}

fn kind_rank(kind: EnvRefKind) -> u8 {
    match kind {
        EnvRefKind::Inline => 0,
        EnvRefKind::Required => 1,
        EnvRefKind::Allowed => 2,
    }
}

/// Validate the extracted references against an environment snapshot.
pub fn validate_env(config: &AgentConfig, env: &HashMap<String, String>) -> EnvCheck {
    let mut missing_required = Vec::new();
    let mut missing_optional = Vec::new();
    let mut required_vars: Vec<String> = Vec::new();

    for r in extract_env_refs(config) {
        if env.contains_key(&r.var) {
            continue;
        }
        match r.kind {
            EnvRefKind::Inline | EnvRefKind::Required => {
                required_vars.push(r.var.clone());
                missing_required.push(r);
            }
            EnvRefKind::Allowed => {
                if !required_vars.contains(&r.var) {
                    missing_optional.push(r);
                }
            }
        }
    }

    EnvCheck {
        valid: missing_required.is_empty(),
        missing_required,
        missing_optional,
    }
}

/// Substitute `${env:VAR}` placeholders in `input` from the snapshot.
/// Unknown variables are left untouched so the error surfaces where the
/// value is actually used.
pub fn expand_env_refs(input: &str, env: &HashMap<String, String>) -> String {
    env_ref_pattern()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            env.get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn walk_strings(value: &serde_json::Value, path: &str, f: &mut impl FnMut(&str, &str)) {
    match value {
        serde_json::Value::String(s) => f(path, s),
        serde_json::Value::Array(items) => {
            for item in items {
                walk_strings(item, path, f);
            }
        }
        serde_json::Value::Object(map) => {
            for (key, item) in map {
                let child = if path == "config" && (key == "mcpServers" || key == "subagents") {
                    key.clone()
                } else if path == "config" {
                    path.to_string()
                } else {
                    format!("{path}.{key}")
                };
                walk_strings(item, &child, f);
            }
        }
        _ => {}
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
