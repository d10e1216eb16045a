// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::Path;

use sha2::{Digest, Sha256};

/// Deterministic agent id for a file path.
///
/// The id combines a filesystem-safe slug of the file stem with a truncated
/// SHA-256 of the canonical path, so two agents with the same stem in
/// different directories get distinct ids while the session tree on disk
/// stays human-readable.
pub fn agent_id_for_path(path: &Path) -> String {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hex::encode(hasher.finalize());
    let stem = canonical
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("agent");
    let slug: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("{slug}-{}", &digest[..12])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn id_is_deterministic() {
        let p = PathBuf::from("/nonexistent/dir/research.agentuse");
        assert_eq!(agent_id_for_path(&p), agent_id_for_path(&p));
    }

    #[test]
    fn different_directories_give_different_ids() {
        let a = agent_id_for_path(&PathBuf::from("/nonexistent/a/bot.agentuse"));
        let b = agent_id_for_path(&PathBuf::from("/nonexistent/b/bot.agentuse"));
        assert_ne!(a, b);
        assert!(a.starts_with("bot-"));
        assert!(b.starts_with("bot-"));
    }

    #[test]
    fn non_ascii_stem_is_slugged() {
        let id = agent_id_for_path(&PathBuf::from("/nonexistent/héllo agent.agentuse"));
        assert!(id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
