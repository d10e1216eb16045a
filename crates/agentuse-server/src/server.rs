// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The HTTP surface: `POST /run`.
//!
//! Requests are validated (auth, agent path confinement, env pre-flight)
//! and forwarded to the worker.  Responses are plain JSON, or
//! newline-delimited JSON streaming when the client sends
//! `Accept: application/x-ndjson`.  A disconnecting client cancels the
//! in-flight worker request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use agentuse_config::{parse_agent_file, validate_env, Agent};
use agentuse_scheduler::Scheduler;
use agentuse_worker::{WorkerHost, WorkerRequest};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub project_root: PathBuf,
    /// Bearer token; required on non-loopback binds unless `no_auth`.
    pub auth_token: Option<String>,
    pub no_auth: bool,
}

impl ServerConfig {
    pub fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), "127.0.0.1" | "::1" | "localhost")
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub worker: Arc<WorkerHost>,
    pub scheduler: Arc<Scheduler>,
    /// Environment snapshot; replaced when `.env` changes.  Shared with the
    /// scheduler's runner so cron-fired runs see the same hot-reloaded
    /// variables as HTTP-triggered ones.
    pub env: Arc<RwLock<HashMap<String, String>>>,
    /// Parsed agents by canonical path, maintained by the file watcher.
    pub agents: RwLock<HashMap<PathBuf, Agent>>,
    request_counter: AtomicU64,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        worker: Arc<WorkerHost>,
        scheduler: Arc<Scheduler>,
        env: Arc<RwLock<HashMap<String, String>>>,
    ) -> Self {
        Self {
            config,
            worker,
            scheduler,
            env,
            agents: RwLock::new(HashMap::new()),
            request_counter: AtomicU64::new(1),
        }
    }

    fn next_request_id(&self) -> String {
        format!("http-{}", self.request_counter.fetch_add(1, Ordering::SeqCst))
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/run", post(run_handler))
        .with_state(state)
}

// ─── Request/response bodies ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunBody {
    agent: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    max_steps: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: ErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    code: &'a str,
    message: String,
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        success: false,
        error: ErrorDetail { code, message: message.into() },
    };
    (status, Json(body)).into_response()
}

fn status_for_code(code: &str) -> StatusCode {
    match code {
        "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
        "NOT_FOUND" | "AGENT_NOT_FOUND" => StatusCode::NOT_FOUND,
        "INVALID_REQUEST" | "MISSING_FIELD" | "INVALID_PATH" => StatusCode::BAD_REQUEST,
        "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        "WORKER_DIED" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ─── Handler ──────────────────────────────────────────────────────────────────

async fn run_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RunBody>,
) -> Response {
    if let Some(denied) = check_auth(&state, &headers) {
        return denied;
    }

    let Some(agent_rel) = body.agent.as_deref().filter(|a| !a.is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "MISSING_FIELD",
            "request body must include 'agent'",
        );
    };

    // The agent path must stay inside the project root.
    let root = &state.config.project_root;
    let Some(agent_path) = confine_path(root, agent_rel) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_PATH",
            format!("agent path {agent_rel:?} resolves outside the project root"),
        );
    };
    if !agent_path.is_file() {
        return error_response(
            StatusCode::NOT_FOUND,
            "AGENT_NOT_FOUND",
            format!("no agent file at {agent_rel:?}"),
        );
    }

    // Env pre-flight: fail before the worker is involved, with the list of
    // missing variables spelled out.  The same snapshot that passes the
    // check travels with the request, so the run executes under exactly the
    // environment that was validated.
    let agent = match parse_agent_file(&agent_path) {
        Ok(agent) => agent,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "INVALID_REQUEST", format!("{e:#}"));
        }
    };
    let env = state.env.read().await.clone();
    let check = validate_env(&agent.config, &env);
    if !check.valid {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ENV_MISSING",
            format!(
                "missing required environment variables: {}",
                check.missing_summary()
            ),
        );
    }

    let id = state.next_request_id();
    let request = WorkerRequest::Execute {
        id: id.clone(),
        agent_path: agent_path.to_string_lossy().into_owned(),
        project_root: root.to_string_lossy().into_owned(),
        prompt: body.prompt,
        model: body.model,
        timeout: body.timeout,
        max_steps: body.max_steps,
        env,
        debug: false,
    };

    let wants_ndjson = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains(NDJSON_CONTENT_TYPE))
        .unwrap_or(false);

    if wants_ndjson {
        stream_response(state, id, request)
    } else {
        json_response(state, request).await
    }
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Option<Response> {
    let Some(expected) = state.config.auth_token.as_deref() else {
        return None;
    };
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if supplied.as_bytes().ct_eq(expected.as_bytes()).into() {
        None
    } else {
        Some(error_response(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "missing or invalid bearer token",
        ))
    }
}

/// Resolve `relative` against `root`; `None` when it escapes.
fn confine_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let raw = Path::new(relative);
    let joined = if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        root.join(raw)
    };
    let resolved = std::fs::canonicalize(&joined).unwrap_or(joined);
    let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    resolved.starts_with(&root).then_some(resolved)
}

async fn json_response(state: Arc<AppState>, request: WorkerRequest) -> Response {
    let response = state.worker.execute(request).await;
    if response.success {
        (StatusCode::OK, Json(serde_json::json!({
            "success": true,
            "result": response.result,
        })))
            .into_response()
    } else {
        let error = response.error.unwrap_or(agentuse_worker::WorkerError {
            code: "INTERNAL_ERROR".into(),
            message: "worker returned no error detail".into(),
        });
        error_response(status_for_code(&error.code), &error.code, error.message)
    }
}

/// NDJSON streaming: one `text` event with the final text, one `finish`
/// event with the duration; failures are a single `error` event.  Client
/// disconnect is observed via the closed channel and cancels the worker
/// request.
fn stream_response(state: Arc<AppState>, id: String, request: WorkerRequest) -> Response {
    let (tx, rx) = mpsc::channel::<Result<String, std::io::Error>>(8);

    tokio::spawn(async move {
        let execute = state.worker.execute(request);
        tokio::pin!(execute);
        let response = tokio::select! {
            _ = tx.closed() => {
                debug!(%id, "client disconnected; cancelling run");
                state.worker.cancel(&id).await;
                return;
            }
            response = &mut execute => response,
        };

        let lines = if response.success {
            let result = response.result.unwrap_or_else(|| agentuse_worker::WorkerResult {
                text: String::new(),
                finish_reason: "stop".into(),
                duration_ms: 0,
                tokens: 0,
                tool_calls: vec![],
                session_id: None,
            });
            vec![
                serde_json::json!({ "type": "text", "text": result.text }).to_string(),
                serde_json::json!({
                    "type": "finish",
                    "reason": result.finish_reason,
                    "duration": result.duration_ms,
                    "tokens": result.tokens,
                })
                .to_string(),
            ]
        } else {
            let error = response.error.unwrap_or(agentuse_worker::WorkerError {
                code: "INTERNAL_ERROR".into(),
                message: "worker returned no error detail".into(),
            });
            vec![serde_json::json!({
                "type": "error",
                "code": error.code,
                "message": error.message,
            })
            .to_string()]
        };
        for line in lines {
            if tx.send(Ok(line + "\n")).await.is_err() {
                warn!(%id, "client disconnected mid-stream");
                return;
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
