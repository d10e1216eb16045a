// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `agentuse-server` — service mode.
//!
//! Assembles the long-running pieces: the worker child (spawned once at
//! startup, while the fd table is pristine), the cron scheduler firing
//! through that worker, the `POST /run` endpoint, the project file watcher,
//! and the cross-process registry entry.  Shutdown (SIGINT) deregisters,
//! stops the scheduler, and kills the worker; serve mode exits 130 when
//! interrupted.

mod envfile;
mod registry;
mod server;
mod watcher;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{Notify, RwLock};
use tracing::{info, warn};

pub use envfile::{env_snapshot, parse_env_file};
pub use registry::{deregister, list as list_servers, register, ServerRegistration};
pub use server::{app, AppState, ServerConfig, NDJSON_CONTENT_TYPE};
pub use watcher::{scan_project, spawn_watcher};

use agentuse_scheduler::{ScheduleRunner, Scheduler};
use agentuse_worker::{WorkerHost, WorkerRequest};

/// Exit code reported after a SIGINT-initiated shutdown.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Fires scheduled agents through the worker, like any HTTP-triggered run.
struct WorkerScheduleRunner {
    worker: Arc<WorkerHost>,
    project_root: std::path::PathBuf,
    /// The server's live environment snapshot, shared with [`AppState`].
    env: Arc<RwLock<HashMap<String, String>>>,
    counter: AtomicU64,
}

#[async_trait]
impl ScheduleRunner for WorkerScheduleRunner {
    async fn run(&self, agent_path: &Path) -> Result<String> {
        let id = format!("sched-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let request = WorkerRequest::Execute {
            id,
            agent_path: agent_path.to_string_lossy().into_owned(),
            project_root: self.project_root.to_string_lossy().into_owned(),
            prompt: None,
            model: None,
            timeout: None,
            max_steps: None,
            env: self.env.read().await.clone(),
            debug: false,
        };
        let response = self.worker.execute(request).await;
        if response.success {
            Ok(response
                .result
                .map(|r| format!("{} ({} tokens)", r.finish_reason, r.tokens))
                .unwrap_or_else(|| "ok".into()))
        } else {
            let error = response
                .error
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_else(|| "unknown worker error".into());
            bail!("{error}")
        }
    }
}

/// Run the server until SIGINT.  Returns the process exit code.
pub async fn serve(config: ServerConfig) -> Result<i32> {
    if !config.is_loopback() && config.auth_token.is_none() && !config.no_auth {
        bail!(
            "refusing to bind {} without an auth token; set one or pass --no-auth",
            config.host
        );
    }

    let project_root = std::fs::canonicalize(&config.project_root)
        .unwrap_or_else(|_| config.project_root.clone());
    let env = Arc::new(RwLock::new(env_snapshot(&project_root)));

    // The worker is spawned here, from the server's startup context, so MCP
    // subprocesses later inherit a clean fd table.
    let worker = Arc::new(WorkerHost::for_current_exe()?);
    worker.start().await.context("worker failed to start")?;

    let runner = Arc::new(WorkerScheduleRunner {
        worker: worker.clone(),
        project_root: project_root.clone(),
        env: env.clone(),
        counter: AtomicU64::new(1),
    });
    let scheduler = Arc::new(Scheduler::new(runner));

    let config = ServerConfig { project_root: project_root.clone(), ..config };
    let state = Arc::new(AppState::new(
        config.clone(),
        worker.clone(),
        scheduler.clone(),
        env,
    ));

    let agent_count = scan_project(&state).await;
    let schedule_count = scheduler.len().await;
    let _watcher = spawn_watcher(state.clone()).context("cannot start file watcher")?;

    let shutdown = Arc::new(Notify::new());
    let timer = tokio::spawn(scheduler.clone().run_timer(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("cannot bind {}:{}", config.host, config.port))?;
    let local_addr = listener.local_addr()?;

    let registration = ServerRegistration {
        pid: std::process::id(),
        port: local_addr.port(),
        host: config.host.clone(),
        project_root: project_root.clone(),
        start_time: chrono::Utc::now(),
        agent_count,
        schedule_count,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Err(e) = register(&registration) {
        warn!(error = %e, "cannot write server registry entry");
    }

    info!(
        addr = %local_addr,
        agents = agent_count,
        schedules = schedule_count,
        "server listening"
    );

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_flag = interrupted.clone();
    let result = axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted_flag.store(true, Ordering::SeqCst);
                info!("interrupt received; shutting down");
            }
        })
        .await;

    deregister(registration.pid);
    shutdown.notify_waiters();
    let _ = timer.await;
    worker.shutdown().await;
    result.context("server error")?;

    Ok(if interrupted.load(Ordering::SeqCst) {
        EXIT_INTERRUPTED
    } else {
        0
    })
}
