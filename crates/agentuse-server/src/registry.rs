// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cross-process server registry.
//!
//! Every running server writes `<state-dir>/agentuse/servers/<pid>.json` on
//! start and removes it on shutdown.  `agentuse serve ps` lists the
//! directory, filtering by live pid; files whose pid is gone are removed
//! lazily during the read.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRegistration {
    pub pid: u32,
    pub port: u16,
    pub host: String,
    pub project_root: PathBuf,
    pub start_time: DateTime<Utc>,
    pub agent_count: usize,
    pub schedule_count: usize,
    pub version: String,
}

/// `<state-dir>/agentuse/servers`, honouring `AGENTUSE_STATE_DIR` for tests.
pub fn registry_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AGENTUSE_STATE_DIR") {
        return PathBuf::from(dir).join("servers");
    }
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("agentuse")
        .join("servers")
}

pub fn register(info: &ServerRegistration) -> Result<PathBuf> {
    let dir = registry_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("cannot create registry dir {}", dir.display()))?;
    let path = dir.join(format!("{}.json", info.pid));
    let bytes = serde_json::to_vec_pretty(info)?;
    std::fs::write(&path, bytes)
        .with_context(|| format!("cannot write {}", path.display()))?;
    Ok(path)
}

pub fn deregister(pid: u32) {
    let path = registry_dir().join(format!("{pid}.json"));
    let _ = std::fs::remove_file(path);
}

/// Live servers.  Entries whose pid is no longer running are removed.
pub fn list() -> Vec<ServerRegistration> {
    let dir = registry_dir();
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut servers = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e != "json").unwrap_or(true) {
            continue;
        }
        let Some(info) = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<ServerRegistration>(&bytes).ok())
        else {
            let _ = std::fs::remove_file(&path);
            continue;
        };
        if pid_alive(info.pid) {
            servers.push(info);
        } else {
            debug!(pid = info.pid, "removing stale registry entry");
            let _ = std::fs::remove_file(&path);
        }
    }
    servers.sort_by_key(|s| s.pid);
    servers
}

fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
