// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Parent side of the worker: spawn, handshake, request correlation.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::protocol::{
    ReadyLine, WorkerRequest, WorkerResponse, ERROR_TIMEOUT, ERROR_WORKER_DIED,
};

/// Extra grace on top of the request's own timeout before the host gives up.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// How many requests may be in flight at once before new ones are rejected.
const MAX_IN_FLIGHT: usize = 64;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<WorkerResponse>>>>;

struct WorkerProcess {
    child: Child,
    writer_tx: mpsc::Sender<String>,
    pending: Pending,
    /// Cleared by the reader task on EOF.  Checked before and after every
    /// enqueue so a request never hangs against a dead worker.
    alive: Arc<std::sync::atomic::AtomicBool>,
}

/// Spawns the worker once and serves all subsequent requests through it.
/// When the worker dies, pending requests fail with `WORKER_DIED` and the
/// next request triggers a respawn.
pub struct WorkerHost {
    program: std::path::PathBuf,
    args: Vec<String>,
    process: Mutex<Option<WorkerProcess>>,
}

impl WorkerHost {
    /// Host that spawns the current executable with `--internal-worker`.
    pub fn for_current_exe() -> Result<Self> {
        let exe = std::env::current_exe().context("cannot determine current executable")?;
        Ok(Self::new(exe, vec!["--internal-worker".to_string()]))
    }

    /// Host over an arbitrary worker program (used by tests).
    pub fn new(program: impl Into<std::path::PathBuf>, args: Vec<String>) -> Self {
        Self { program: program.into(), args, process: Mutex::new(None) }
    }

    /// Spawn the worker eagerly (normally done once at server startup, while
    /// the parent's fd table is still pristine).
    pub async fn start(&self) -> Result<()> {
        let mut guard = self.process.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn().await?);
        }
        Ok(())
    }

    /// Send one execute request and wait for its response.
    ///
    /// The wait is bounded by the request's own timeout plus a grace period;
    /// on expiry the caller gets a `TIMEOUT` error response and a cancel is
    /// sent to the worker.
    pub async fn execute(&self, request: WorkerRequest) -> WorkerResponse {
        let id = request.id().to_string();
        let request_timeout = match &request {
            WorkerRequest::Execute { timeout: Some(secs), .. } => Duration::from_secs(*secs),
            _ => DEFAULT_REQUEST_TIMEOUT,
        } + TIMEOUT_GRACE;

        use std::sync::atomic::Ordering;

        let (send_error, pending, alive, rx) = {
            let mut guard = self.process.lock().await;
            // A previous worker that died stays in the slot until the next
            // request notices and respawns.
            if guard
                .as_ref()
                .map(|p| !p.alive.load(Ordering::SeqCst))
                .unwrap_or(false)
            {
                if let Some(mut dead) = guard.take() {
                    let _ = dead.child.start_kill();
                }
            }
            if guard.is_none() {
                match self.spawn().await {
                    Ok(process) => *guard = Some(process),
                    Err(e) => {
                        return WorkerResponse::err(
                            &id,
                            ERROR_WORKER_DIED,
                            format!("cannot spawn worker: {e:#}"),
                        );
                    }
                }
            }
            let process = guard.as_ref().expect("just ensured");

            let mut pending = process.pending.lock().await;
            if pending.len() >= MAX_IN_FLIGHT {
                return WorkerResponse::err(&id, ERROR_TIMEOUT, "worker is saturated");
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(id.clone(), tx);
            drop(pending);

            let line = match serde_json::to_string(&request) {
                Ok(line) => line,
                Err(e) => {
                    process.pending.lock().await.remove(&id);
                    return WorkerResponse::err(&id, ERROR_WORKER_DIED, e.to_string());
                }
            };
            (
                process.writer_tx.clone().try_send(line).err().map(|e| e.to_string()),
                process.pending.clone(),
                process.alive.clone(),
                rx,
            )
        };
        if let Some(send_error) = send_error {
            pending.lock().await.remove(&id);
            return WorkerResponse::err(
                &id,
                ERROR_WORKER_DIED,
                format!("cannot write to worker: {send_error}"),
            );
        }

        // Close the enqueue/EOF race: if the worker died around the enqueue,
        // either the reader's drain answered us or the entry is still ours
        // to fail.
        if !alive.load(Ordering::SeqCst) && pending.lock().await.remove(&id).is_some() {
            return WorkerResponse::err(&id, ERROR_WORKER_DIED, "worker exited");
        }

        match tokio::time::timeout(request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => WorkerResponse::err(&id, ERROR_WORKER_DIED, "worker exited"),
            Err(_) => {
                self.cancel(&id).await;
                WorkerResponse::err(
                    &id,
                    ERROR_TIMEOUT,
                    format!("no response within {}s", request_timeout.as_secs()),
                )
            }
        }
    }

    /// Best-effort cancellation of an in-flight request.
    pub async fn cancel(&self, id: &str) {
        let guard = self.process.lock().await;
        if let Some(process) = guard.as_ref() {
            process.pending.lock().await.remove(id);
            if let Ok(line) = serde_json::to_string(&WorkerRequest::Cancel { id: id.to_string() }) {
                let _ = process.writer_tx.try_send(line);
            }
        }
    }

    /// Kill the worker (server shutdown).
    pub async fn shutdown(&self) {
        let mut guard = self.process.lock().await;
        if let Some(mut process) = guard.take() {
            fail_all_pending(&process.pending, "server shutting down").await;
            let _ = process.child.start_kill();
        }
    }

    async fn spawn(&self) -> Result<WorkerProcess> {
        info!(program = %self.program.display(), "spawning worker");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("cannot spawn {}", self.program.display()))?;

        let stdin = child.stdin.take().context("worker stdin unavailable")?;
        let stdout = child.stdout.take().context("worker stdout unavailable")?;
        let mut reader = BufReader::new(stdout).lines();

        // Handshake: the first line must be {"type":"ready"}.
        let ready_line = tokio::time::timeout(READY_TIMEOUT, reader.next_line())
            .await
            .context("worker did not become ready in time")?
            .context("worker stdout closed before handshake")?
            .context("worker stdout closed before handshake")?;
        let ready: ReadyLine =
            serde_json::from_str(&ready_line).context("invalid worker handshake")?;
        if !ready.is_ready() {
            bail!("unexpected worker handshake: {ready_line}");
        }
        debug!("worker ready");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(std::sync::atomic::AtomicBool::new(true));

        // Single writer task: serialises all request lines onto stdin.
        let (writer_tx, mut writer_rx) = mpsc::channel::<String>(MAX_IN_FLIGHT);
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = writer_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Single reader task: demultiplexes responses by id.  EOF means the
        // worker died — everything pending fails with WORKER_DIED.
        let reader_pending = pending.clone();
        let reader_alive = alive.clone();
        tokio::spawn(async move {
            let mut lines = reader;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let response: WorkerResponse = match serde_json::from_str(&line) {
                            Ok(response) => response,
                            Err(e) => {
                                warn!(error = %e, line = %line, "unparseable worker response");
                                continue;
                            }
                        };
                        if let Some(tx) =
                            reader_pending.lock().await.remove(&response.id)
                        {
                            let _ = tx.send(response);
                        }
                    }
                    Ok(None) | Err(_) => {
                        warn!("worker stdout closed");
                        reader_alive.store(false, std::sync::atomic::Ordering::SeqCst);
                        fail_all_pending(&reader_pending, "worker exited").await;
                        return;
                    }
                }
            }
        });

        Ok(WorkerProcess { child, writer_tx, pending, alive })
    }
}

async fn fail_all_pending(pending: &Pending, message: &str) {
    let mut map = pending.lock().await;
    for (id, tx) in map.drain() {
        let _ = tx.send(WorkerResponse::err(&id, ERROR_WORKER_DIED, message));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
