// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `agentuse-session` — append-only on-disk session log.
//!
//! Layout per run:
//!
//! ```text
//! <project>/.agentuse/sessions/<agent_id>/<session_id>/
//!   info.json             session metadata (status, timestamps, config)
//!   messages/<msg_id>.json  one file per message, ordered by ULID
//! ```
//!
//! Sessions are append-only while running; completion is a final metadata
//! update.  Every write is atomic (temp file + rename), so a crash leaves
//! either the old or the new contents — never a torn file.  Leftover temp
//! files from a crash are swept on next access.

mod manager;
mod store;
mod types;

pub use manager::{SessionHandle, SessionManager};
pub use store::load_session;
pub use types::{MessagePart, MessageRecord, SessionInfo, SessionStatus};
