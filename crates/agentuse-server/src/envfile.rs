// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! `.env` loading for the server's environment snapshot.
//!
//! The snapshot is the process environment overlaid with the project's
//! `.env` file; the core only ever sees the snapshot, so nothing here
//! mutates the process environment.

use std::collections::HashMap;
use std::path::Path;

/// Parse simple `KEY=VALUE` lines.  `#` comments and blank lines are
/// skipped; single or double quotes around the value are stripped;
/// `export ` prefixes are tolerated.
pub fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    vars
}

/// Process environment overlaid with `<project>/.env` (when present).
pub fn env_snapshot(project_root: &Path) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    if let Ok(content) = std::fs::read_to_string(project_root.join(".env")) {
        env.extend(parse_env_file(&content));
    }
    env
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs() {
        let vars = parse_env_file("A=1\nB=two\n");
        assert_eq!(vars.get("A").map(String::as_str), Some("1"));
        assert_eq!(vars.get("B").map(String::as_str), Some("two"));
    }

    #[test]
    fn skips_comments_and_blanks() {
        let vars = parse_env_file("# comment\n\nA=1\n  # indented\n");
        assert_eq!(vars.len(), 1);
    }

    #[test]
    fn strips_quotes_and_export() {
        let vars = parse_env_file("export TOKEN=\"secret value\"\nNAME='single'\n");
        assert_eq!(vars.get("TOKEN").map(String::as_str), Some("secret value"));
        assert_eq!(vars.get("NAME").map(String::as_str), Some("single"));
    }

    #[test]
    fn rejects_invalid_keys() {
        let vars = parse_env_file("BAD KEY=1\n=empty\nOK=1\n");
        assert_eq!(vars.len(), 1);
        assert!(vars.contains_key("OK"));
    }

    #[test]
    fn snapshot_overlays_env_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".env"), "AGENTUSE_TEST_OVERLAY=from-file\n").unwrap();
        let env = env_snapshot(tmp.path());
        assert_eq!(
            env.get("AGENTUSE_TEST_OVERLAY").map(String::as_str),
            Some("from-file")
        );
        assert!(env.contains_key("PATH"));
    }
}
