// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `agentuse-mcp` — MCP tool-provider supervision.
//!
//! One execution may declare any number of MCP providers (stdio child
//! processes or streamable-HTTP endpoints).  The [`McpSupervisor`] launches
//! them concurrently with per-provider error isolation, projects their tools
//! (and resources, as synthetic tools) into the execution's tool registry
//! under a `<provider>_` name prefix, and guarantees that every connection
//! is closed on every exit path.
//!
//! Call-time failures never abort the run: they are classified into a
//! structured `{type, message, retryable, suggestions}` result that the
//! model can read and act on.

mod client;
mod error;
mod supervisor;

pub use client::{McpCallOutcome, McpClient, McpResourceInfo, McpToolInfo};
pub use error::{classify_error, structured_error_json, McpErrorKind};
pub use supervisor::{compose_child_env, McpSupervisor, ProviderFailure};
