// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Doom-loop detection.
//!
//! A model that repeats the same tool call with the same arguments is stuck.
//! The detector keeps a sliding window of (tool name, argument fingerprint)
//! pairs; when the most recent `threshold` entries are identical it fires,
//! and the configured action decides whether the run warns, feeds a
//! synthetic error back to the model, or terminates.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What to do when a doom loop is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoomLoopAction {
    /// Log and keep going.
    Warn,
    /// Feed a synthetic `doom-loop-detected` tool error to the model.
    #[default]
    Error,
    /// End the run.
    Terminate,
}

const DEFAULT_WINDOW: usize = 10;
pub const DEFAULT_THRESHOLD: usize = 3;

#[derive(Debug)]
pub struct DoomLoopDetector {
    window: VecDeque<(String, String)>,
    window_size: usize,
    threshold: usize,
}

impl Default for DoomLoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD)
    }
}

impl DoomLoopDetector {
    pub fn new(window_size: usize, threshold: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size,
            threshold: threshold.max(2),
        }
    }

    /// Record a tool call.  Returns `true` when the most recent `threshold`
    /// calls (including this one) are identical.
    pub fn record(&mut self, tool_name: &str, args: &serde_json::Value) -> bool {
        let entry = (tool_name.to_string(), fingerprint(args));
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(entry);

        if self.window.len() < self.threshold {
            return false;
        }
        let recent = self.window.iter().rev().take(self.threshold);
        let mut iter = recent;
        let first = iter.next().expect("threshold >= 2");
        iter.all(|e| e == first)
    }
}

fn fingerprint(args: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(args.to_string().as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
