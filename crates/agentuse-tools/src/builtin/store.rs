// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Agent-scoped JSON document store.
//!
//! Layout: `<project>/.agentuse/store/<storeName>/items.json` holding
//! `{version: 1, items: […]}`, with a sibling `lock` file.  The lock file
//! contains `{pid, agent}` diagnostics; stale locks from dead processes are
//! reclaimed, and reacquisition by the same process is idempotent.  Every
//! write goes through the atomic temp + rename pattern.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use ulid::Ulid;

use crate::registry::ToolRegistry;
use crate::tool::{Tool, ToolCall, ToolOutput};

const STORE_FORMAT_VERSION: u32 = 1;

/// One item in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreItem {
    pub id: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub data: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct StoreDocument {
    version: u32,
    items: Vec<StoreItem>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    agent: String,
}

/// Write `bytes` to `path` atomically: a temp file in the same directory is
/// written, flushed, and renamed over the target.  After any crash the
/// target holds either the old or the new contents, never a mix.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".tmp-{}-{}",
        std::process::id(),
        Ulid::new().to_string().to_lowercase()
    ));
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    match std::fs::rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

/// One named store on disk.
pub struct Store {
    dir: PathBuf,
    agent: String,
}

/// Guard for the store lock file.  The file is removed on drop only by the
/// guard that created it, so nested reacquisition by the same process is a
/// no-op.
struct StoreLock {
    path: PathBuf,
    owned: bool,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Store {
    /// Open (creating if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>, agent: impl Into<String>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, agent: agent.into() })
    }

    fn items_path(&self) -> PathBuf {
        self.dir.join("items.json")
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join("lock")
    }

    fn acquire_lock(&self) -> Result<StoreLock, String> {
        let path = self.lock_path();
        let info = LockInfo { pid: std::process::id(), agent: self.agent.clone() };
        let body = serde_json::to_vec(&info).expect("lock info serialises");

        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    let _ = file.write_all(&body);
                    return Ok(StoreLock { path, owned: true });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder: Option<LockInfo> = std::fs::read(&path)
                        .ok()
                        .and_then(|bytes| serde_json::from_slice(&bytes).ok());
                    match holder {
                        Some(h) if h.pid == std::process::id() => {
                            // Same process already holds the lock.
                            return Ok(StoreLock { path, owned: false });
                        }
                        Some(h) if !pid_alive(h.pid) => {
                            debug!(pid = h.pid, "reclaiming stale store lock");
                            let _ = std::fs::remove_file(&path);
                            continue;
                        }
                        Some(h) => {
                            return Err(format!(
                                "store is locked by pid {} (agent {:?})",
                                h.pid, h.agent
                            ));
                        }
                        None => {
                            // Unreadable lock file: treat as stale.
                            let _ = std::fs::remove_file(&path);
                            continue;
                        }
                    }
                }
                Err(e) => return Err(format!("cannot create store lock: {e}")),
            }
        }
        Err("store lock contention".into())
    }

    fn load(&self) -> Result<StoreDocument, String> {
        match std::fs::read(self.items_path()) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| format!("corrupt store document: {e}")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreDocument {
                version: STORE_FORMAT_VERSION,
                items: Vec::new(),
            }),
            Err(e) => Err(format!("cannot read store: {e}")),
        }
    }

    fn save(&self, doc: &StoreDocument) -> Result<(), String> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(|e| e.to_string())?;
        atomic_write(&self.items_path(), &bytes).map_err(|e| format!("cannot write store: {e}"))
    }

    pub fn create(
        &self,
        item_type: Option<String>,
        title: Option<String>,
        status: Option<String>,
        data: Value,
        tags: Vec<String>,
        parent_id: Option<String>,
    ) -> Result<StoreItem, String> {
        let _lock = self.acquire_lock()?;
        let mut doc = self.load()?;
        let now = Utc::now();
        let item = StoreItem {
            id: Ulid::new().to_string(),
            item_type,
            title,
            status,
            data,
            tags,
            parent_id,
            created_at: now,
            updated_at: now,
            created_by: self.agent.clone(),
        };
        doc.items.push(item.clone());
        self.save(&doc)?;
        Ok(item)
    }

    pub fn get(&self, id: &str) -> Result<Option<StoreItem>, String> {
        let doc = self.load()?;
        Ok(doc.items.into_iter().find(|i| i.id == id))
    }

    pub fn update(&self, id: &str, patch: &Value) -> Result<StoreItem, String> {
        let _lock = self.acquire_lock()?;
        let mut doc = self.load()?;
        let item = doc
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| format!("no item with id {id:?}"))?;

        if let Some(t) = patch.get("type").and_then(|v| v.as_str()) {
            item.item_type = Some(t.to_string());
        }
        if let Some(t) = patch.get("title").and_then(|v| v.as_str()) {
            item.title = Some(t.to_string());
        }
        if let Some(s) = patch.get("status").and_then(|v| v.as_str()) {
            item.status = Some(s.to_string());
        }
        if let Some(d) = patch.get("data") {
            item.data = d.clone();
        }
        if let Some(tags) = patch.get("tags").and_then(|v| v.as_array()) {
            item.tags = tags
                .iter()
                .filter_map(|t| t.as_str().map(String::from))
                .collect();
        }
        item.updated_at = Utc::now();
        let updated = item.clone();
        self.save(&doc)?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<bool, String> {
        let _lock = self.acquire_lock()?;
        let mut doc = self.load()?;
        let before = doc.items.len();
        doc.items.retain(|i| i.id != id);
        let removed = doc.items.len() < before;
        if removed {
            self.save(&doc)?;
        }
        Ok(removed)
    }

    pub fn list(
        &self,
        item_type: Option<&str>,
        status: Option<&str>,
        tag: Option<&str>,
    ) -> Result<Vec<StoreItem>, String> {
        let doc = self.load()?;
        Ok(doc
            .items
            .into_iter()
            .filter(|i| item_type.map_or(true, |t| i.item_type.as_deref() == Some(t)))
            .filter(|i| status.map_or(true, |s| i.status.as_deref() == Some(s)))
            .filter(|i| tag.map_or(true, |t| i.tags.iter().any(|x| x == t)))
            .collect())
    }
}

fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 probes existence without sending anything.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

// ─── Tools ────────────────────────────────────────────────────────────────────

macro_rules! store_tool {
    ($name:ident, $tool_name:literal, $desc:literal, $schema:expr, $body:expr) => {
        pub struct $name(pub Arc<Store>);

        #[async_trait]
        impl Tool for $name {
            fn name(&self) -> &str {
                $tool_name
            }
            fn description(&self) -> &str {
                $desc
            }
            fn parameters_schema(&self) -> Value {
                $schema
            }
            async fn execute(&self, call: &ToolCall) -> ToolOutput {
                #[allow(clippy::redundant_closure_call)]
                ($body)(&self.0, call)
            }
        }
    };
}

fn ok_json(call_id: &str, value: impl Serialize) -> ToolOutput {
    match serde_json::to_string_pretty(&value) {
        Ok(s) => ToolOutput::ok(call_id, s),
        Err(e) => ToolOutput::err(call_id, format!("cannot serialise result: {e}")),
    }
}

fn string_arg(call: &ToolCall, key: &str) -> Option<String> {
    call.args.get(key).and_then(|v| v.as_str()).map(String::from)
}

store_tool!(
    StoreCreateTool,
    "store_create",
    "Create an item in the store. 'data' is an arbitrary JSON value; type, title, status, tags, and parentId are optional.",
    json!({
        "type": "object",
        "properties": {
            "type":     { "type": "string" },
            "title":    { "type": "string" },
            "status":   { "type": "string" },
            "data":     { "description": "Arbitrary JSON payload" },
            "tags":     { "type": "array", "items": { "type": "string" } },
            "parentId": { "type": "string" }
        },
        "required": ["data"],
        "additionalProperties": false
    }),
    |store: &Arc<Store>, call: &ToolCall| {
        let data = match call.args.get("data") {
            Some(d) => d.clone(),
            None => return ToolOutput::err(&call.id, "missing required parameter 'data'"),
        };
        let tags = call
            .args
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|t| t.as_str().map(String::from)).collect())
            .unwrap_or_default();
        match store.create(
            string_arg(call, "type"),
            string_arg(call, "title"),
            string_arg(call, "status"),
            data,
            tags,
            string_arg(call, "parentId"),
        ) {
            Ok(item) => ok_json(&call.id, item),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
);

store_tool!(
    StoreGetTool,
    "store_get",
    "Fetch one store item by id.",
    json!({
        "type": "object",
        "properties": { "id": { "type": "string" } },
        "required": ["id"],
        "additionalProperties": false
    }),
    |store: &Arc<Store>, call: &ToolCall| {
        let id = match string_arg(call, "id") {
            Some(id) => id,
            None => return ToolOutput::err(&call.id, "missing required parameter 'id'"),
        };
        match store.get(&id) {
            Ok(Some(item)) => ok_json(&call.id, item),
            Ok(None) => ToolOutput::err(&call.id, format!("no item with id {id:?}")),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
);

store_tool!(
    StoreUpdateTool,
    "store_update",
    "Update fields of an existing store item. Only the supplied fields change.",
    json!({
        "type": "object",
        "properties": {
            "id":     { "type": "string" },
            "type":   { "type": "string" },
            "title":  { "type": "string" },
            "status": { "type": "string" },
            "data":   { "description": "Replacement JSON payload" },
            "tags":   { "type": "array", "items": { "type": "string" } }
        },
        "required": ["id"],
        "additionalProperties": false
    }),
    |store: &Arc<Store>, call: &ToolCall| {
        let id = match string_arg(call, "id") {
            Some(id) => id,
            None => return ToolOutput::err(&call.id, "missing required parameter 'id'"),
        };
        match store.update(&id, &call.args) {
            Ok(item) => ok_json(&call.id, item),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
);

store_tool!(
    StoreDeleteTool,
    "store_delete",
    "Delete a store item by id.",
    json!({
        "type": "object",
        "properties": { "id": { "type": "string" } },
        "required": ["id"],
        "additionalProperties": false
    }),
    |store: &Arc<Store>, call: &ToolCall| {
        let id = match string_arg(call, "id") {
            Some(id) => id,
            None => return ToolOutput::err(&call.id, "missing required parameter 'id'"),
        };
        match store.delete(&id) {
            Ok(true) => ToolOutput::ok(&call.id, format!("deleted {id}")),
            Ok(false) => ToolOutput::err(&call.id, format!("no item with id {id:?}")),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
);

store_tool!(
    StoreListTool,
    "store_list",
    "List store items, optionally filtered by type, status, or tag.",
    json!({
        "type": "object",
        "properties": {
            "type":   { "type": "string" },
            "status": { "type": "string" },
            "tag":    { "type": "string" }
        },
        "additionalProperties": false
    }),
    |store: &Arc<Store>, call: &ToolCall| {
        match store.list(
            call.args.get("type").and_then(|v| v.as_str()),
            call.args.get("status").and_then(|v| v.as_str()),
            call.args.get("tag").and_then(|v| v.as_str()),
        ) {
            Ok(items) => ok_json(&call.id, items),
            Err(e) => ToolOutput::err(&call.id, e),
        }
    }
);

/// Register the five store tools against one shared [`Store`].
pub fn register_store_tools(registry: &mut ToolRegistry, store: Arc<Store>) -> anyhow::Result<()> {
    registry.register(StoreCreateTool(store.clone()))?;
    registry.register(StoreGetTool(store.clone()))?;
    registry.register(StoreUpdateTool(store.clone()))?;
    registry.register(StoreDeleteTool(store.clone()))?;
    registry.register(StoreListTool(store))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
