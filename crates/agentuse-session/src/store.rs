// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::types::{MessageRecord, SessionInfo};

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// flush, rename.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".tmp-{}-{}",
        std::process::id(),
        ulid::Ulid::new().to_string().to_lowercase()
    ));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// Remove `.tmp-*` leftovers from an interrupted writer.  Called on session
/// open and load, so a crashed run never poisons later reads.
pub(crate) fn sweep_temp_files(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(".tmp-") {
            debug!(file = %entry.path().display(), "removing stale temp file");
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

pub(crate) fn write_info(session_dir: &Path, info: &SessionInfo) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(info)?;
    atomic_write(&session_dir.join("info.json"), &bytes)
        .with_context(|| format!("cannot write session info in {}", session_dir.display()))
}

pub(crate) fn write_message(session_dir: &Path, record: &MessageRecord) -> Result<()> {
    let messages = session_dir.join("messages");
    std::fs::create_dir_all(&messages)?;
    let bytes = serde_json::to_vec_pretty(record)?;
    atomic_write(&messages.join(format!("{}.json", record.id)), &bytes)
        .with_context(|| format!("cannot write message {}", record.id))
}

/// Load a session: metadata plus the message log ordered by id.
pub fn load_session(session_dir: &Path) -> Result<(SessionInfo, Vec<MessageRecord>)> {
    sweep_temp_files(session_dir);
    let info_bytes = std::fs::read(session_dir.join("info.json"))
        .with_context(|| format!("no session at {}", session_dir.display()))?;
    let info: SessionInfo = serde_json::from_slice(&info_bytes).context("corrupt info.json")?;

    let messages_dir = session_dir.join("messages");
    let mut records = Vec::new();
    if messages_dir.is_dir() {
        sweep_temp_files(&messages_dir);
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&messages_dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "json"))
            .collect();
        // ULID file names sort chronologically.
        paths.sort();
        for path in paths {
            let bytes = std::fs::read(&path)?;
            let record: MessageRecord = serde_json::from_slice(&bytes)
                .with_context(|| format!("corrupt message file {}", path.display()))?;
            records.push(record);
        }
    }
    Ok((info, records))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
