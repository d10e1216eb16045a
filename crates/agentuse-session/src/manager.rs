// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use ulid::Ulid;

use crate::store;
use crate::types::{MessagePart, MessageRecord, SessionInfo, SessionStatus};

/// Creates and tracks sessions under one project's state directory.
///
/// Sub-agent executions get a *fresh* manager whose parent pointer is the
/// caller's session id, so the call stack shares no mutable state — the
/// parent/child tree exists only on disk.
#[derive(Debug, Clone)]
pub struct SessionManager {
    sessions_root: PathBuf,
}

impl SessionManager {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            sessions_root: project_root.into().join(".agentuse").join("sessions"),
        }
    }

    /// Open a new running session for `agent_id`.
    pub fn open(
        &self,
        agent_id: &str,
        config_snapshot: serde_json::Value,
        parent_session_id: Option<String>,
    ) -> Result<SessionHandle> {
        let id = Ulid::new().to_string();
        let dir = self.sessions_root.join(agent_id).join(&id);
        std::fs::create_dir_all(dir.join("messages"))
            .with_context(|| format!("cannot create session directory {}", dir.display()))?;
        store::sweep_temp_files(&dir);

        let info = SessionInfo {
            id: id.clone(),
            agent_id: agent_id.to_string(),
            parent_session_id,
            started_at: Utc::now(),
            completed_at: None,
            status: SessionStatus::Running,
            error: None,
            config: config_snapshot,
        };
        store::write_info(&dir, &info)?;
        Ok(SessionHandle { dir, info })
    }

    /// Directory of an existing session.
    pub fn session_dir(&self, agent_id: &str, session_id: &str) -> PathBuf {
        self.sessions_root.join(agent_id).join(session_id)
    }

    /// All session ids recorded for an agent, oldest first.
    pub fn list(&self, agent_id: &str) -> Vec<String> {
        let dir = self.sessions_root.join(agent_id);
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        ids.sort();
        ids
    }
}

/// An open session being written by exactly one execution.
#[derive(Debug)]
pub struct SessionHandle {
    dir: PathBuf,
    info: SessionInfo,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Append one message to the log.
    pub fn append(
        &self,
        role: &str,
        parts: Vec<MessagePart>,
        tokens: Option<u32>,
    ) -> Result<MessageRecord> {
        let record = MessageRecord {
            id: Ulid::new().to_string(),
            time: Utc::now(),
            role: role.to_string(),
            parts,
            tokens,
        };
        store::write_message(&self.dir, &record)?;
        Ok(record)
    }

    /// Final metadata update.  Sets `completed_at` for every non-running
    /// status, upholding the status/timestamp invariant.
    pub fn complete(&mut self, status: SessionStatus, error: Option<String>) -> Result<()> {
        self.info.status = status;
        self.info.error = error;
        self.info.completed_at = if status == SessionStatus::Running {
            None
        } else {
            Some(Utc::now())
        };
        store::write_info(&self.dir, &self.info)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
