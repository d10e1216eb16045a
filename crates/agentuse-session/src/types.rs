// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

/// Session metadata, persisted as `info.json`.
///
/// `completed_at` is set exactly when `status != Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Sortable ULID.
    pub id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Snapshot of the agent config the run started with.
    pub config: serde_json::Value,
}

/// One part of a persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text { text: String },
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
    },
    Reasoning { text: String },
}

/// One message in the session log, persisted as `messages/<id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Sortable ULID; the on-disk file name.
    pub id: String,
    pub time: DateTime<Utc>,
    /// `system`, `user`, `assistant`, or `tool`.
    pub role: String,
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_part_round_trips_with_type_tags() {
        let parts = vec![
            MessagePart::Text { text: "hi".into() },
            MessagePart::ToolCall {
                id: "tc".into(),
                name: "bash".into(),
                input: serde_json::json!({"command": "ls"}),
            },
            MessagePart::ToolResult {
                id: "tc".into(),
                name: "bash".into(),
                output: "file\n".into(),
            },
            MessagePart::Reasoning { text: "hmm".into() },
        ];
        let json = serde_json::to_string(&parts).unwrap();
        assert!(json.contains("\"tool-call\""));
        assert!(json.contains("\"tool-result\""));
        let back: Vec<MessagePart> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, parts);
    }

    #[test]
    fn session_status_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&SessionStatus::Aborted).unwrap(),
            "\"aborted\""
        );
    }
}
