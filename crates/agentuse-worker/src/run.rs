// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Worker side: the `--internal-worker` main loop.
//!
//! Reads newline-framed requests from stdin, runs each execution in its own
//! task, and writes responses through a single stdout writer so lines never
//! interleave.  Cancel requests abort the matching in-flight execution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use agentuse_config::parse_agent_file;
use agentuse_core::{run_agent, RunRequest};

use crate::protocol::{
    ReadyLine, WorkerRequest, WorkerResponse, WorkerResult, ERROR_EXECUTION,
    ERROR_INVALID_REQUEST,
};

const ERROR_AGENT_NOT_FOUND: &str = "AGENT_NOT_FOUND";
const ERROR_ENV_MISSING: &str = "ENV_MISSING";
const ERROR_INVALID_PATH: &str = "INVALID_PATH";

type CancelMap = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;

/// Entry point for the worker child process.  Blocks until stdin closes.
pub async fn worker_main() -> Result<()> {
    // Single writer: every response goes through this channel so concurrent
    // executions cannot interleave bytes on stdout.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let ready = serde_json::to_string(&ReadyLine::new())?;
    out_tx.send(ready).await.ok();
    info!("worker ready");

    let cancels: CancelMap = Arc::new(Mutex::new(HashMap::new()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "unparseable request line");
                let response =
                    WorkerResponse::err("", ERROR_INVALID_REQUEST, format!("bad request: {e}"));
                let _ = out_tx.send(serde_json::to_string(&response)?).await;
                continue;
            }
        };

        match request {
            WorkerRequest::Cancel { id } => {
                if let Some(cancel) = cancels.lock().await.remove(&id) {
                    debug!(%id, "cancelling execution");
                    let _ = cancel.send(());
                }
            }
            execute @ WorkerRequest::Execute { .. } => {
                let out_tx = out_tx.clone();
                let cancels = cancels.clone();
                tokio::spawn(async move {
                    let id = execute.id().to_string();
                    let (cancel_tx, cancel_rx) = oneshot::channel();
                    cancels.lock().await.insert(id.clone(), cancel_tx);

                    let response = handle_execute(execute, cancel_rx).await;

                    cancels.lock().await.remove(&id);
                    if let Ok(line) = serde_json::to_string(&response) {
                        let _ = out_tx.send(line).await;
                    }
                });
            }
        }
    }

    // Parent closed stdin: drain the writer and exit.
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_execute(
    request: WorkerRequest,
    cancel: oneshot::Receiver<()>,
) -> WorkerResponse {
    let WorkerRequest::Execute {
        id,
        agent_path,
        project_root,
        prompt,
        model,
        timeout,
        max_steps,
        env,
        debug,
    } = request
    else {
        return WorkerResponse::err("", ERROR_INVALID_REQUEST, "not an execute request");
    };

    let project_root = PathBuf::from(project_root);
    let resolved = resolve_agent_path(&project_root, &agent_path);
    let resolved = match resolved {
        Ok(path) => path,
        Err(message) => return WorkerResponse::err(&id, ERROR_INVALID_PATH, message),
    };

    let agent = match parse_agent_file(&resolved) {
        Ok(agent) => agent,
        Err(e) => {
            let code = if resolved.exists() { ERROR_INVALID_REQUEST } else { ERROR_AGENT_NOT_FOUND };
            return WorkerResponse::err(&id, code, format!("{e:#}"));
        }
    };

    let mut run = RunRequest::new(agent, project_root);
    // The snapshot the parent validated against is the one the run executes
    // under; the worker's own process environment is never consulted.
    run.env = env;
    run.prompt = prompt;
    run.model_override = model;
    run.timeout_override = timeout;
    run.max_steps_override = max_steps;

    // Events stream to the log in debug mode, otherwise into the void —
    // the response carries the summary either way.
    let (events_tx, mut events_rx) = mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if debug {
                debug!(?event, "exec event");
            }
        }
    });

    match run_agent(run, events_tx, cancel).await {
        Ok(summary) => WorkerResponse::ok(&id, WorkerResult::from(summary)),
        Err(e) => {
            let message = format!("{e:#}");
            let code = if message.contains("environment variable") {
                ERROR_ENV_MISSING
            } else {
                ERROR_EXECUTION
            };
            WorkerResponse::err(&id, code, message)
        }
    }
}

/// The agent path must resolve inside the project root.
fn resolve_agent_path(project_root: &Path, agent_path: &str) -> Result<PathBuf, String> {
    let raw = Path::new(agent_path);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        project_root.join(raw)
    };
    let resolved = std::fs::canonicalize(&joined).unwrap_or(joined);
    let root = std::fs::canonicalize(project_root)
        .unwrap_or_else(|_| project_root.to_path_buf());
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(format!(
            "agent path {agent_path:?} resolves outside the project root"
        ))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
