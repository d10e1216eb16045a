// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod policy;
pub mod registry;
pub mod tool;

pub use policy::command::{CommandDecision, CommandValidator};
pub use policy::path::{PathDecision, PathValidator};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{Tool, ToolCall, ToolOutput};

pub use builtin::bash::BashTool;
pub use builtin::edit::EditTool;
pub use builtin::read::ReadTool;
pub use builtin::store::{register_store_tools, Store, StoreItem};
pub use builtin::write::WriteTool;
