// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Hot reload: a recursive file watcher over the project tree.
//!
//! - `*.agentuse` added → parse and register (including any schedule);
//! - changed → reparse and update (the schedule may now be absent);
//! - removed → deregister.
//! - `.env` changed → rebuild the environment snapshot for subsequent runs.
//!
//! The notify callback runs on the watcher's own thread; events are bridged
//! into the async world over a channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use agentuse_config::{parse_agent_file, AGENT_FILE_EXTENSION, STATE_DIR_NAME};

use crate::envfile::env_snapshot;
use crate::server::AppState;

/// Initial scan: find and register every agent file in the project.
pub async fn scan_project(state: &Arc<AppState>) -> usize {
    let root = state.config.project_root.clone();
    let mut count = 0;
    for entry in WalkDir::new(&root)
        .into_iter()
        .filter_entry(|e| e.file_name() != STATE_DIR_NAME)
        .flatten()
    {
        let path = entry.path();
        if entry.file_type().is_file() && has_agent_extension(path) {
            if reconcile_agent(state, path).await {
                count += 1;
            }
        }
    }
    info!(agents = count, "project scan complete");
    count
}

/// Start watching; the returned watcher must be kept alive for the server's
/// lifetime.
pub fn spawn_watcher(state: Arc<AppState>) -> notify::Result<RecommendedWatcher> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<notify::Event>(128);
    let mut watcher = notify::recommended_watcher(
        move |result: notify::Result<notify::Event>| match result {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(e) => warn!(error = %e, "file watcher error"),
        },
    )?;
    watcher.watch(&state.config.project_root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            handle_event(&state, event).await;
        }
    });
    Ok(watcher)
}

async fn handle_event(state: &Arc<AppState>, event: notify::Event) {
    use notify::EventKind;

    for path in &event.paths {
        if path.components().any(|c| c.as_os_str() == STATE_DIR_NAME) {
            continue;
        }
        if is_env_file(path) {
            debug!(".env changed; reloading environment snapshot");
            let snapshot = env_snapshot(&state.config.project_root);
            *state.env.write().await = snapshot;
            continue;
        }
        if !has_agent_extension(path) {
            continue;
        }
        match event.kind {
            EventKind::Remove(_) => remove_agent(state, path).await,
            _ => {
                if path.is_file() {
                    reconcile_agent(state, path).await;
                } else {
                    // Editors often rename-over; a missing file is a removal.
                    remove_agent(state, path).await;
                }
            }
        }
    }
}

/// Parse + register one agent file, reconciling its schedule.
/// Returns `false` when the file does not parse (the previous registration
/// is left as-is so a half-saved file cannot unschedule an agent).
async fn reconcile_agent(state: &Arc<AppState>, path: &Path) -> bool {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    match parse_agent_file(&canonical) {
        Ok(agent) => {
            let schedule = agent.config.schedule.clone();
            state.agents.write().await.insert(canonical.clone(), agent);
            match state
                .scheduler
                .update(&canonical, schedule.as_deref())
                .await
            {
                Ok(()) => debug!(agent = %canonical.display(), schedule = ?schedule, "agent registered"),
                Err(e) => warn!(agent = %canonical.display(), error = %e, "invalid schedule"),
            }
            true
        }
        Err(e) => {
            warn!(agent = %canonical.display(), error = %e, "agent file does not parse; keeping previous registration");
            false
        }
    }
}

async fn remove_agent(state: &Arc<AppState>, path: &Path) {
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    if state.agents.write().await.remove(&canonical).is_some() {
        info!(agent = %canonical.display(), "agent removed");
    }
    state.scheduler.remove_by_agent_path(&canonical).await;
}

fn has_agent_extension(path: &Path) -> bool {
    path.extension()
        .map(|e| e == AGENT_FILE_EXTENSION)
        .unwrap_or(false)
}

fn is_env_file(path: &Path) -> bool {
    path.file_name().map(|n| n == ".env").unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use agentuse_scheduler::Scheduler;
    use agentuse_worker::WorkerHost;

    use super::*;
    use crate::server::{AppState, ServerConfig};

    struct NoopRunner;
    #[async_trait::async_trait]
    impl agentuse_scheduler::ScheduleRunner for NoopRunner {
        async fn run(&self, _agent_path: &Path) -> anyhow::Result<String> {
            Ok("ok".into())
        }
    }

    fn state_for(root: &Path) -> Arc<AppState> {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            project_root: root.to_path_buf(),
            auth_token: None,
            no_auth: true,
        };
        let worker = Arc::new(WorkerHost::new("true", vec![]));
        let scheduler = Arc::new(Scheduler::new(Arc::new(NoopRunner)));
        let env = Arc::new(tokio::sync::RwLock::new(HashMap::new()));
        Arc::new(AppState::new(config, worker, scheduler, env))
    }

    fn write_agent(root: &Path, name: &str, extra: &str) -> PathBuf {
        let path = root.join(name);
        std::fs::write(
            &path,
            format!("---\nmodel: openai:gpt-4o-mini\n{extra}---\nwork\n"),
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn scan_registers_agents_and_schedules() {
        let tmp = tempfile::tempdir().unwrap();
        write_agent(tmp.path(), "plain.agentuse", "");
        write_agent(tmp.path(), "timed.agentuse", "schedule: \"*/5 * * * *\"\n");
        std::fs::write(tmp.path().join("notes.md"), "not an agent").unwrap();

        let state = state_for(tmp.path());
        let count = scan_project(&state).await;
        assert_eq!(count, 2);
        assert_eq!(state.agents.read().await.len(), 2);
        assert_eq!(state.scheduler.len().await, 1);
    }

    #[tokio::test]
    async fn scan_skips_the_state_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let sessions = tmp.path().join(".agentuse").join("sessions");
        std::fs::create_dir_all(&sessions).unwrap();
        write_agent(&sessions, "stray.agentuse", "");

        let state = state_for(tmp.path());
        assert_eq!(scan_project(&state).await, 0);
    }

    #[tokio::test]
    async fn change_updates_schedule_and_removal_drops_it() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_agent(tmp.path(), "a.agentuse", "schedule: \"*/5 * * * *\"\n");
        let state = state_for(tmp.path());

        reconcile_agent(&state, &path).await;
        assert_eq!(state.scheduler.len().await, 1);

        // Schedule removed from the file → schedule deregistered.
        write_agent(tmp.path(), "a.agentuse", "");
        reconcile_agent(&state, &path).await;
        assert_eq!(state.scheduler.len().await, 0);

        // File removed → agent deregistered.
        remove_agent(&state, &path).await;
        assert!(state.agents.read().await.is_empty());
    }

    #[tokio::test]
    async fn broken_file_keeps_previous_registration() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_agent(tmp.path(), "a.agentuse", "");
        let state = state_for(tmp.path());
        reconcile_agent(&state, &path).await;
        assert_eq!(state.agents.read().await.len(), 1);

        std::fs::write(&path, "---\nbroken yaml: [\n").unwrap();
        reconcile_agent(&state, &path).await;
        assert_eq!(
            state.agents.read().await.len(),
            1,
            "unparseable save must not deregister"
        );
    }
}
