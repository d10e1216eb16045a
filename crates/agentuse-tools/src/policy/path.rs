// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Filesystem path validation.
//!
//! A path is validated against the agent's `tools.filesystem` rules: each
//! rule grants a permission set for a doublestar pattern.  The *realpath* is
//! what is matched — symlinks are resolved first, so a link inside an
//! allowed tree pointing at `/etc` does not grant access to `/etc`.
//! Env-style files (`.env`, `.env.production`, …) are always denied, no
//! matter what the rules say.

use std::path::{Path, PathBuf};

use agentuse_config::{FilesystemRule, PathPermission};

use super::command::resolve_real;

/// The result of validating one path for one permission.
#[derive(Debug, Clone)]
pub struct PathDecision {
    pub allowed: bool,
    pub error: Option<String>,
    /// The rule pattern that granted access.
    pub matched_pattern: Option<String>,
    /// The fully resolved path the decision applies to.
    pub resolved_path: PathBuf,
}

/// Basename suffixes that un-deny an `.env.<suffix>` file.
const ENV_FILE_EXCEPTIONS: &[&str] = &["example", "sample", "template"];

pub struct PathValidator {
    rules: Vec<CompiledRule>,
    project_root: PathBuf,
}

struct CompiledRule {
    source: String,
    pattern: glob::Pattern,
    permissions: Vec<PathPermission>,
}

/// Doublestar semantics: `**` crosses directory boundaries, `*` does not,
/// and dotfiles are matched like any other name.
const MATCH_OPTIONS: glob::MatchOptions = glob::MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl PathValidator {
    /// Compile the rule list.  Rules with unparseable patterns are dropped
    /// with a warning — a typo must not silently widen access.
    pub fn new(rules: &[FilesystemRule], project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        // Canonicalise so resolved paths and expanded patterns share a prefix.
        let project_root = std::fs::canonicalize(&project_root).unwrap_or(project_root);
        let compiled = rules
            .iter()
            .filter_map(|rule| {
                let expanded = expand_pattern(&rule.path, &project_root);
                match glob::Pattern::new(&expanded) {
                    Ok(pattern) => Some(CompiledRule {
                        source: rule.path.clone(),
                        pattern,
                        permissions: rule.permissions.clone(),
                    }),
                    Err(e) => {
                        tracing::warn!(pattern = %rule.path, error = %e, "dropping invalid filesystem rule");
                        None
                    }
                }
            })
            .collect();
        Self { rules: compiled, project_root }
    }

    /// Validate `path` for `permission`.
    pub fn validate(&self, path: &str, permission: PathPermission) -> PathDecision {
        let resolved = self.resolve(path);

        if let Some(basename) = resolved.file_name().and_then(|n| n.to_str()) {
            if is_env_file(basename) {
                return PathDecision {
                    allowed: false,
                    error: Some(format!("access to environment file {basename:?} is never allowed")),
                    matched_pattern: None,
                    resolved_path: resolved,
                };
            }
        }

        let text = resolved.to_string_lossy();
        for rule in &self.rules {
            if rule.pattern.matches_with(&text, MATCH_OPTIONS)
                && rule.permissions.contains(&permission)
            {
                return PathDecision {
                    allowed: true,
                    error: None,
                    matched_pattern: Some(rule.source.clone()),
                    resolved_path: resolved,
                };
            }
        }

        PathDecision {
            allowed: false,
            error: Some(format!(
                "no filesystem rule grants {permission} on {}",
                resolved.display()
            )),
            matched_pattern: None,
            resolved_path: resolved,
        }
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let expanded = expand_user(raw);
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            self.project_root.join(expanded)
        };
        resolve_real(&joined)
    }
}

/// `.env` and `.env.<anything>` are denied, except the documented templates.
fn is_env_file(basename: &str) -> bool {
    if basename == ".env" {
        return true;
    }
    match basename.strip_prefix(".env.") {
        Some(suffix) => !ENV_FILE_EXCEPTIONS.contains(&suffix),
        None => false,
    }
}

fn expand_user(raw: &str) -> PathBuf {
    if raw == "~" || raw.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(raw.trim_start_matches('~').trim_start_matches('/'));
        }
    }
    PathBuf::from(raw)
}

/// Expand `~`, `${root}`, and `${cwd}` in a rule pattern.
fn expand_pattern(pattern: &str, project_root: &Path) -> String {
    let root = project_root.to_string_lossy();
    let cwd = std::env::current_dir()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_else(|_| root.to_string());
    let mut out = pattern
        .replace("${root}", &root)
        .replace("${cwd}", &cwd);
    if out == "~" || out.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            out = format!("{}{}", home.to_string_lossy(), out.trim_start_matches('~'));
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(path: &str, permissions: &[PathPermission]) -> FilesystemRule {
        FilesystemRule { path: path.into(), permissions: permissions.to_vec() }
    }

    fn validator_in(tmp: &Path, rules: &[FilesystemRule]) -> PathValidator {
        PathValidator::new(rules, tmp.to_path_buf())
    }

    #[test]
    fn empty_config_denies_all() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator_in(tmp.path(), &[]);
        assert!(!v.validate("anything.txt", PathPermission::Read).allowed);
    }

    #[test]
    fn doublestar_grants_whole_tree() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("deep/nested")).unwrap();
        let v = validator_in(tmp.path(), &[rule("${root}/**", &[PathPermission::Read])]);
        assert!(v.validate("deep/nested/file.txt", PathPermission::Read).allowed);
    }

    #[test]
    fn permission_must_be_granted_by_the_matching_rule() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator_in(tmp.path(), &[rule("${root}/**", &[PathPermission::Read])]);
        assert!(!v.validate("file.txt", PathPermission::Write).allowed);
        assert!(!v.validate("file.txt", PathPermission::Edit).allowed);
    }

    #[test]
    fn first_granting_rule_wins_and_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator_in(
            tmp.path(),
            &[
                rule("${root}/docs/**", &[PathPermission::Read]),
                rule("${root}/**", &[PathPermission::Read, PathPermission::Write]),
            ],
        );
        let d = v.validate("docs/x.md", PathPermission::Read);
        assert!(d.allowed);
        assert_eq!(d.matched_pattern.as_deref(), Some("${root}/docs/**"));
        // Write on the same file falls through to the broader rule.
        assert!(v.validate("docs/x.md", PathPermission::Write).allowed);
    }

    #[test]
    fn env_files_are_always_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator_in(tmp.path(), &[rule("${root}/**", &[PathPermission::Read])]);
        for name in [".env", ".env.production", "config/.env", "deep/.env.local"] {
            assert!(
                !v.validate(name, PathPermission::Read).allowed,
                "{name} must be denied"
            );
        }
    }

    #[test]
    fn env_template_files_are_allowed() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator_in(tmp.path(), &[rule("${root}/**", &[PathPermission::Read])]);
        for name in [".env.example", ".env.sample", ".env.template"] {
            assert!(
                v.validate(name, PathPermission::Read).allowed,
                "{name} must be allowed"
            );
        }
    }

    #[test]
    fn dotfiles_match_patterns() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator_in(tmp.path(), &[rule("${root}/**", &[PathPermission::Read])]);
        assert!(v.validate(".gitignore", PathPermission::Read).allowed);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_target_is_what_matters() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "s").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            tmp.path().join("inside.txt"),
        )
        .unwrap();
        let v = validator_in(tmp.path(), &[rule("${root}/**", &[PathPermission::Read])]);
        let d = v.validate("inside.txt", PathPermission::Read);
        assert!(!d.allowed, "symlink escaping the granted tree must be denied");
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        let v = validator_in(tmp.path(), &[rule("${root}/*.txt", &[PathPermission::Read])]);
        assert!(v.validate("top.txt", PathPermission::Read).allowed);
        assert!(!v.validate("sub/nested.txt", PathPermission::Read).allowed);
    }

    #[test]
    fn invalid_pattern_is_dropped_not_widened() {
        let tmp = tempfile::tempdir().unwrap();
        let v = validator_in(tmp.path(), &[rule("${root}/[", &[PathPermission::Read])]);
        assert!(!v.validate("anything", PathPermission::Read).allowed);
    }
}
