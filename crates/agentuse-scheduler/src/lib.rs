// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `agentuse-scheduler` — cron-driven agent firing.
//!
//! Each schedule maps an agent file to a cron expression (5 fields, or 6/7
//! with a seconds field).  One timer task sleeps until the earliest
//! `next_fire_at`, fires everything due, recomputes, and goes back to
//! sleep.  Overlap is prevented per schedule: while a previous invocation
//! is still running, the fire is skipped with a warning and the schedule
//! simply advances to its next slot.
//!
//! Hot reload mutates the table under a mutex (`add` / `update` /
//! `remove_by_agent_path`); the timer is woken after every mutation so a
//! nearer fire time takes effect immediately.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidExpression { expression: String, reason: String },
    #[error("expression {0:?} never fires")]
    NeverFires(String),
}

/// Executes one scheduled agent run.  The server wires this to the worker;
/// tests substitute scripted runners.
#[async_trait]
pub trait ScheduleRunner: Send + Sync {
    async fn run(&self, agent_path: &Path) -> anyhow::Result<String>;
}

/// Snapshot of one schedule for display.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInfo {
    pub agent_path: PathBuf,
    pub expression: String,
    pub next_fire_at: Option<DateTime<Local>>,
    pub last_fire_at: Option<DateTime<Local>>,
    pub last_result: Option<String>,
    pub running: bool,
}

struct Entry {
    expression: String,
    schedule: cron::Schedule,
    next_fire_at: Option<DateTime<Local>>,
    last_fire_at: Option<DateTime<Local>>,
    last_result: Option<String>,
    /// Set while an invocation is in flight; a due fire observed while set
    /// is skipped.
    running: Arc<AtomicBool>,
}

pub struct Scheduler {
    entries: Arc<Mutex<HashMap<PathBuf, Entry>>>,
    wakeup: Arc<Notify>,
    runner: Arc<dyn ScheduleRunner>,
}

/// Normalise a 5-field expression to the 6-field (seconds-bearing) format
/// the `cron` crate parses; 6- and 7-field expressions pass through.
fn normalize_expression(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

fn parse_expression(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    cron::Schedule::from_str(&normalize_expression(expression)).map_err(|e| {
        ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
    })
}

impl Scheduler {
    pub fn new(runner: Arc<dyn ScheduleRunner>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            wakeup: Arc::new(Notify::new()),
            runner,
        }
    }

    /// Register (or replace) the schedule for an agent path.
    pub async fn add(&self, agent_path: &Path, expression: &str) -> Result<(), ScheduleError> {
        let schedule = parse_expression(expression)?;
        let next = schedule.after(&Local::now()).next();
        if next.is_none() {
            return Err(ScheduleError::NeverFires(expression.to_string()));
        }
        let mut entries = self.entries.lock().await;
        info!(agent = %agent_path.display(), expression, next = ?next, "schedule registered");
        entries.insert(
            agent_path.to_path_buf(),
            Entry {
                expression: expression.to_string(),
                schedule,
                next_fire_at: next,
                last_fire_at: None,
                last_result: None,
                running: Arc::new(AtomicBool::new(false)),
            },
        );
        drop(entries);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Update after a file change: a new expression replaces the schedule,
    /// `None` removes it (the agent no longer declares one).
    pub async fn update(
        &self,
        agent_path: &Path,
        expression: Option<&str>,
    ) -> Result<(), ScheduleError> {
        match expression {
            Some(expression) => self.add(agent_path, expression).await,
            None => {
                self.remove_by_agent_path(agent_path).await;
                Ok(())
            }
        }
    }

    pub async fn remove_by_agent_path(&self, agent_path: &Path) {
        let mut entries = self.entries.lock().await;
        if entries.remove(agent_path).is_some() {
            info!(agent = %agent_path.display(), "schedule removed");
        }
        drop(entries);
        self.wakeup.notify_one();
    }

    pub async fn list(&self) -> Vec<ScheduleInfo> {
        let entries = self.entries.lock().await;
        let mut list: Vec<ScheduleInfo> = entries
            .iter()
            .map(|(path, entry)| ScheduleInfo {
                agent_path: path.clone(),
                expression: entry.expression.clone(),
                next_fire_at: entry.next_fire_at,
                last_fire_at: entry.last_fire_at,
                last_result: entry.last_result.clone(),
                running: entry.running.load(Ordering::SeqCst),
            })
            .collect();
        list.sort_by(|a, b| a.agent_path.cmp(&b.agent_path));
        list
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Run the timer loop until `shutdown` is notified.  Spawn this once.
    pub async fn run_timer(self: Arc<Self>, shutdown: Arc<Notify>) {
        loop {
            let next = self.earliest_fire().await;
            let sleep_for = match next {
                Some(at) => {
                    let now = Local::now();
                    (at - now)
                        .to_std()
                        .unwrap_or(std::time::Duration::ZERO)
                }
                // Nothing scheduled: park until a mutation wakes us.
                None => std::time::Duration::from_secs(3600),
            };
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("scheduler timer stopping");
                    return;
                }
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {
                    self.fire_due(Local::now()).await;
                }
            }
        }
    }

    async fn earliest_fire(&self) -> Option<DateTime<Local>> {
        let entries = self.entries.lock().await;
        entries.values().filter_map(|e| e.next_fire_at).min()
    }

    /// Fire every schedule due at `now`; returns the paths that actually
    /// started (skipped-overlap ones are excluded).
    pub async fn fire_due(&self, now: DateTime<Local>) -> Vec<PathBuf> {
        let mut started = Vec::new();
        let mut entries = self.entries.lock().await;
        for (path, entry) in entries.iter_mut() {
            let Some(due_at) = entry.next_fire_at else {
                continue;
            };
            if due_at > now {
                continue;
            }
            // Advance regardless of whether we fire: next_fire_at moves
            // strictly monotonically.
            entry.next_fire_at = entry.schedule.after(&now).next();

            if entry.running.load(Ordering::SeqCst) {
                warn!(
                    agent = %path.display(),
                    "previous scheduled run still in progress; skipping this fire"
                );
                continue;
            }
            entry.running.store(true, Ordering::SeqCst);
            entry.last_fire_at = Some(now);
            started.push(path.clone());

            let running = entry.running.clone();
            let runner = self.runner.clone();
            let agent_path = path.clone();
            let entries_handle = self.entries.clone();
            tokio::spawn(async move {
                let result = runner.run(&agent_path).await;
                let outcome = match &result {
                    Ok(summary) => summary.clone(),
                    Err(e) => format!("error: {e:#}"),
                };
                if let Err(e) = &result {
                    warn!(agent = %agent_path.display(), error = %e, "scheduled run failed");
                }
                running.store(false, Ordering::SeqCst);
                let mut entries = entries_handle.lock().await;
                if let Some(entry) = entries.get_mut(&agent_path) {
                    entry.last_result = Some(outcome);
                }
            });
        }
        started
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use super::*;

    struct CountingRunner {
        fired: AtomicU32,
        delay: Duration,
    }

    #[async_trait]
    impl ScheduleRunner for CountingRunner {
        async fn run(&self, _agent_path: &Path) -> anyhow::Result<String> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok("ok".into())
        }
    }

    fn scheduler(delay: Duration) -> (Arc<Scheduler>, Arc<CountingRunner>) {
        let runner = Arc::new(CountingRunner { fired: AtomicU32::new(0), delay });
        (Arc::new(Scheduler::new(runner.clone())), runner)
    }

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        assert_eq!(normalize_expression("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_expression("0 * * * * *"), "0 * * * * *");
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(parse_expression("not a cron").is_err());
        assert!(parse_expression("*/5 * * * *").is_ok());
        assert!(parse_expression("30 */2 * * * *").is_ok());
    }

    #[tokio::test]
    async fn add_computes_a_future_fire_time() {
        let (s, _) = scheduler(Duration::ZERO);
        s.add(Path::new("/a.agentuse"), "*/1 * * * *").await.unwrap();
        let list = s.list().await;
        assert_eq!(list.len(), 1);
        let next = list[0].next_fire_at.unwrap();
        assert!(next > Local::now());
    }

    #[tokio::test]
    async fn update_with_none_removes_the_schedule() {
        let (s, _) = scheduler(Duration::ZERO);
        s.add(Path::new("/a.agentuse"), "*/1 * * * *").await.unwrap();
        s.update(Path::new("/a.agentuse"), None).await.unwrap();
        assert!(s.is_empty().await);
    }

    #[tokio::test]
    async fn update_replaces_the_expression() {
        let (s, _) = scheduler(Duration::ZERO);
        s.add(Path::new("/a.agentuse"), "*/1 * * * *").await.unwrap();
        s.update(Path::new("/a.agentuse"), Some("*/30 * * * *"))
            .await
            .unwrap();
        let list = s.list().await;
        assert_eq!(list[0].expression, "*/30 * * * *");
    }

    #[tokio::test]
    async fn due_schedule_fires_once() {
        let (s, runner) = scheduler(Duration::ZERO);
        s.add(Path::new("/a.agentuse"), "*/1 * * * *").await.unwrap();
        // Pretend the fire time has arrived.
        let fire_at = s.list().await[0].next_fire_at.unwrap();
        let started = s.fire_due(fire_at).await;
        assert_eq!(started.len(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overlapping_fire_is_skipped_and_next_advances() {
        let (s, runner) = scheduler(Duration::from_secs(60));
        s.add(Path::new("/slow.agentuse"), "*/1 * * * *").await.unwrap();

        let first_due = s.list().await[0].next_fire_at.unwrap();
        let started = s.fire_due(first_due).await;
        assert_eq!(started.len(), 1, "first fire starts");

        let second_due = s.list().await[0].next_fire_at.unwrap();
        assert!(second_due > first_due, "next fire advanced monotonically");

        // The slow run is still in flight when the second slot arrives.
        let started = s.fire_due(second_due).await;
        assert!(started.is_empty(), "overlapping fire must be skipped");

        let third_due = s.list().await[0].next_fire_at.unwrap();
        assert!(third_due > second_due, "skipping still reschedules");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            runner.fired.load(Ordering::SeqCst),
            1,
            "exactly one invocation started"
        );
    }

    #[tokio::test]
    async fn not_yet_due_schedule_does_not_fire() {
        let (s, runner) = scheduler(Duration::ZERO);
        s.add(Path::new("/a.agentuse"), "*/1 * * * *").await.unwrap();
        let started = s.fire_due(Local::now()).await;
        assert!(started.is_empty());
        assert_eq!(runner.fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn last_result_is_recorded_after_completion() {
        let (s, _) = scheduler(Duration::ZERO);
        s.add(Path::new("/a.agentuse"), "*/1 * * * *").await.unwrap();
        let due = s.list().await[0].next_fire_at.unwrap();
        s.fire_due(due).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let list = s.list().await;
        assert_eq!(list[0].last_result.as_deref(), Some("ok"));
        assert!(!list[0].running);
    }
}
