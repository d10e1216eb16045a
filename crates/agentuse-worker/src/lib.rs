// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `agentuse-worker` — the execution worker and its stdio protocol.
//!
//! MCP subprocesses need a clean file-descriptor table; spawning them from
//! deep async contexts (HTTP handlers, timer callbacks) is unreliable on
//! some runtimes.  The server therefore spawns **one** child of itself with
//! `--internal-worker` at startup and sends every execution through it over
//! newline-delimited JSON on stdin/stdout:
//!
//! ```text
//! worker → parent   {"type":"ready"}
//! parent → worker   {"id":"1","type":"execute","agentPath":…,"projectRoot":…}
//! worker → parent   {"id":"1","success":true,"result":{…}}
//! ```
//!
//! If the worker dies, every pending request resolves with `WORKER_DIED`
//! and the next request respawns it.

mod host;
mod protocol;
mod run;

pub use host::WorkerHost;
pub use protocol::{
    WorkerError, WorkerRequest, WorkerResponse, WorkerResult, ERROR_TIMEOUT, ERROR_WORKER_DIED,
};
pub use run::worker_main;
