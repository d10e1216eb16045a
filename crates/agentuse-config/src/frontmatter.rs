// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::schema::{Agent, AgentConfig};

#[derive(Debug, Error)]
pub enum AgentParseError {
    #[error("failed to read agent file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent file has no `---` front-matter block")]
    MissingFrontmatter,
    #[error("front-matter block is not terminated by a closing `---`")]
    UnterminatedFrontmatter,
    #[error("invalid front-matter: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("front-matter is missing the required `model` key")]
    MissingModel,
}

/// Parse an agent file from disk.
///
/// The agent name is the file stem; `source_path` is canonicalised when
/// possible so that cycle detection and agent ids are stable across
/// differently-spelled paths to the same file.
pub fn parse_agent_file(path: &Path) -> Result<Agent, AgentParseError> {
    let text = std::fs::read_to_string(path).map_err(|source| AgentParseError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let source_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let name = source_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("agent")
        .to_string();
    parse_agent_str(&text, name, source_path)
}

/// Parse agent text that has already been read.
pub fn parse_agent_str(
    text: &str,
    name: String,
    source_path: std::path::PathBuf,
) -> Result<Agent, AgentParseError> {
    let (yaml, body) = split_frontmatter(text)?;
    let config = parse_config(&yaml)?;
    Ok(Agent {
        name,
        instructions: body.trim().to_string(),
        config,
        source_path,
    })
}

/// Split the `---`-fenced front-matter from the markdown body.
fn split_frontmatter(text: &str) -> Result<(String, String), AgentParseError> {
    let lines: Vec<&str> = text.lines().collect();
    // Tolerate a UTF-8 BOM and leading blank lines before the opening fence.
    let open = lines
        .iter()
        .position(|l| !l.trim_start_matches('\u{feff}').trim().is_empty())
        .ok_or(AgentParseError::MissingFrontmatter)?;
    if lines[open].trim_start_matches('\u{feff}').trim() != "---" {
        return Err(AgentParseError::MissingFrontmatter);
    }
    let close = lines[open + 1..]
        .iter()
        .position(|l| l.trim() == "---")
        .map(|i| i + open + 1)
        .ok_or(AgentParseError::UnterminatedFrontmatter)?;
    let yaml = lines[open + 1..close].join("\n");
    let body = lines[close + 1..].join("\n");
    Ok((yaml, body))
}

/// Deserialise the front-matter, normalising the deprecated `mcp_servers`
/// spelling into `mcpServers` first (with a warning).
fn parse_config(yaml: &str) -> Result<AgentConfig, AgentParseError> {
    let mut value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    if let serde_yaml::Value::Mapping(map) = &mut value {
        let deprecated = serde_yaml::Value::String("mcp_servers".into());
        let preferred = serde_yaml::Value::String("mcpServers".into());
        if let Some(servers) = map.remove(&deprecated) {
            warn!("`mcp_servers` is deprecated; use `mcpServers`");
            map.entry(preferred).or_insert(servers);
        }
    }
    let config: AgentConfig = serde_yaml::from_value(value)?;
    if config.model.trim().is_empty() {
        return Err(AgentParseError::MissingModel);
    }
    Ok(config)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const MINIMAL: &str = "---\nmodel: openai:gpt-4o-mini\n---\nSay hi\n";

    fn parse(text: &str) -> Result<Agent, AgentParseError> {
        parse_agent_str(text, "test".into(), PathBuf::from("/tmp/test.agentuse"))
    }

    #[test]
    fn minimal_agent_parses() {
        let agent = parse(MINIMAL).unwrap();
        assert_eq!(agent.config.model, "openai:gpt-4o-mini");
        assert_eq!(agent.instructions, "Say hi");
    }

    #[test]
    fn missing_frontmatter_is_an_error() {
        assert!(matches!(
            parse("just markdown, no fences"),
            Err(AgentParseError::MissingFrontmatter)
        ));
    }

    #[test]
    fn unterminated_frontmatter_is_an_error() {
        assert!(matches!(
            parse("---\nmodel: openai:gpt-4o-mini\nno closing fence"),
            Err(AgentParseError::UnterminatedFrontmatter)
        ));
    }

    #[test]
    fn missing_model_is_an_error() {
        assert!(matches!(
            parse("---\ndescription: no model here\n---\nbody"),
            Err(AgentParseError::InvalidYaml(_)) | Err(AgentParseError::MissingModel)
        ));
    }

    #[test]
    fn deprecated_mcp_servers_key_is_normalised() {
        let text = "---\nmodel: openai:gpt-4o-mini\nmcp_servers:\n  fs:\n    command: npx\n---\nbody";
        let agent = parse(text).unwrap();
        assert!(agent.config.mcp_servers.contains_key("fs"));
    }

    #[test]
    fn full_frontmatter_parses() {
        let text = r#"---
model: anthropic:claude-sonnet-4-5
timeout: 120
maxSteps: 10
schedule: "*/5 * * * *"
subagents:
  - path: ./helper.agentuse
tools:
  bash:
    commands: ["echo *", "git status"]
  filesystem:
    - path: "${root}/**"
      permissions: [read]
---
Do the thing.
"#;
        let agent = parse(text).unwrap();
        assert_eq!(agent.config.timeout, Some(120));
        assert_eq!(agent.config.max_steps, Some(10));
        assert_eq!(agent.config.schedule.as_deref(), Some("*/5 * * * *"));
        assert_eq!(agent.config.subagents.len(), 1);
        assert_eq!(
            agent.config.tools.bash.as_ref().unwrap().commands.len(),
            2
        );
    }

    #[test]
    fn leading_blank_lines_are_tolerated() {
        let text = "\n\n---\nmodel: openai:gpt-4o-mini\n---\nbody";
        assert!(parse(text).is_ok());
    }
}
