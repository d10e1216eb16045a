// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `agentuse-core` — the agent execution runtime.
//!
//! The pieces, bottom-up:
//!
//! - [`context`]: token accounting and between-turn compaction;
//! - [`doom`]: repeated-identical-call detection;
//! - [`executor`]: the streaming model ↔ tool loop, emitting [`ExecEvent`]s;
//! - [`subagent`]: agents-as-tools with cycle and depth guards;
//! - [`toolset`]: assembly of built-ins + MCP + sub-agents for one run;
//! - [`runner`]: the orchestration wrapper shared by the CLI and worker.

pub mod context;
pub mod doom;
pub mod events;
pub mod executor;
pub mod runner;
pub mod subagent;
pub mod toolset;
#[cfg(test)]
mod tests;

pub use context::{CompactionOutcome, ContextManager};
pub use doom::{DoomLoopAction, DoomLoopDetector};
pub use events::{ExecEvent, ExecSummary, FinishReason, ToolCallTrace, TraceKind};
pub use executor::{ExecOptions, Execution, DEFAULT_MAX_STEPS};
pub use runner::{run_agent, RunRequest};
pub use subagent::{SubAgentTool, SUBAGENT_PREFIX};
pub use toolset::{build_tool_set, BuildContext, ToolSetBuild, DEFAULT_MAX_DEPTH};
