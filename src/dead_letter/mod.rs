//! Dead-letter and retry queue.
//!
//! Holds deliveries and tasks whose immediate retry budget ran out. The
//! engine's sweeper claims entries once `next_retry_at` has passed and
//! replays them. Renewed failures back off further; entries that reach the
//! attempt ceiling leave the queue as permanent failures.
//!
//! The queue is loaded from an optional JSON file at startup and flushed to
//! it at shutdown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::delegator::backoff_delay;
use crate::metrics::{SharedMetrics, names};
use crate::models::{AgentTask, WorkUnitKey};
use crate::webhook::Delivery;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetterItem {
    Delivery(Delivery),
    /// The task as it stood when it was dead-lettered, enough to dispatch
    /// it again after a restart.
    Task { task: Box<AgentTask> },
    /// A report whose publication was interrupted.
    Report { work_unit: WorkUnitKey },
}

impl DeadLetterItem {
    pub fn work_unit(&self) -> &WorkUnitKey {
        match self {
            Self::Delivery(delivery) => delivery.event.key(),
            Self::Task { task } => &task.work_unit,
            Self::Report { work_unit } => work_unit,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Delivery(_) => "delivery",
            Self::Task { .. } => "task",
            Self::Report { .. } => "report",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub item: DeadLetterItem,
    /// Replays attempted so far, counting the failure that enqueued it.
    pub attempts: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub path: Option<PathBuf>,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(60_000),
            path: None,
        }
    }
}

/// What happened to an entry whose replay failed.
#[derive(Debug, Clone, PartialEq)]
pub enum Rescheduled {
    Retry { next_retry_at: DateTime<Utc> },
    /// Hit the attempt ceiling; the entry has left the queue.
    PermanentlyFailed(DeadLetterEntry),
}

pub struct DeadLetterQueue {
    config: DeadLetterConfig,
    entries: Mutex<Vec<DeadLetterEntry>>,
    permanent_failures: AtomicU64,
    metrics: SharedMetrics,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

impl DeadLetterQueue {
    pub fn new(config: DeadLetterConfig, metrics: SharedMetrics) -> Self {
        Self {
            config,
            entries: Mutex::new(Vec::new()),
            permanent_failures: AtomicU64::new(0),
            metrics,
        }
    }

    /// Create the queue, restoring entries persisted at the configured path.
    pub fn load(config: DeadLetterConfig, metrics: SharedMetrics) -> Result<Self> {
        let restored = match &config.path {
            Some(path) if path.exists() => read_entries(path)?,
            _ => Vec::new(),
        };
        let queue = Self::new(config, metrics);
        if !restored.is_empty() {
            info!(entries = restored.len(), "restored dead-letter queue");
        }
        *queue.lock() = restored;
        queue.publish();
        Ok(queue)
    }

    /// Write every entry to the configured path, if there is one.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.config.path else {
            return Ok(());
        };
        let entries = self.entries();
        let content = serde_json::to_string_pretty(&entries)
            .context("Failed to serialize dead-letter queue")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write dead-letter file: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace dead-letter file: {}", path.display()))?;
        info!(entries = entries.len(), path = %path.display(), "dead-letter queue flushed");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DeadLetterEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self) {
        let size = self.lock().len();
        self.metrics
            .gauge(names::DEAD_LETTER_SIZE, &[], size as f64);
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn permanent_failures(&self) -> u64 {
        self.permanent_failures.load(Ordering::Relaxed)
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.lock().clone()
    }

    /// Enqueue `item` for a replay at `next_retry_at`.
    pub fn push(
        &self,
        item: DeadLetterItem,
        next_retry_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Uuid {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            item,
            attempts: 1,
            next_retry_at,
            last_error: error.into(),
            created_at: Utc::now(),
        };
        let id = entry.id;
        warn!(
            entry = %id,
            kind = entry.item.kind(),
            work_unit = %entry.item.work_unit(),
            next_retry_at = %entry.next_retry_at,
            error = %entry.last_error,
            "dead-lettered"
        );
        self.lock().push(entry);
        self.publish();
        id
    }

    /// Enqueue `item` for a replay after the first backoff step.
    pub fn push_with_backoff(&self, item: DeadLetterItem, error: impl Into<String>) -> Uuid {
        let delay = backoff_delay(self.config.backoff_base, self.config.backoff_max, 0);
        self.push(item, Utc::now() + to_chrono(delay), error)
    }

    /// Remove and return every entry due at `now`.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Vec<DeadLetterEntry> {
        let mut entries = self.lock();
        let (due, pending): (Vec<_>, Vec<_>) = entries
            .drain(..)
            .partition(|e| e.next_retry_at <= now);
        *entries = pending;
        drop(entries);
        if !due.is_empty() {
            debug!(claimed = due.len(), "claimed due dead-letter entries");
            self.publish();
        }
        due
    }

    /// Put back an entry whose replay failed, or retire it at the ceiling.
    pub fn reschedule(&self, mut entry: DeadLetterEntry, error: impl Into<String>) -> Rescheduled {
        entry.last_error = error.into();
        if entry.attempts >= self.config.max_attempts {
            self.permanent_failures.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(
                names::ERRORS,
                &[("type", "permanent_failure"), ("component", "dead_letter")],
            );
            warn!(
                entry = %entry.id,
                kind = entry.item.kind(),
                work_unit = %entry.item.work_unit(),
                attempts = entry.attempts,
                error = %entry.last_error,
                "dead-letter entry permanently failed"
            );
            self.publish();
            return Rescheduled::PermanentlyFailed(entry);
        }
        let delay = backoff_delay(
            self.config.backoff_base,
            self.config.backoff_max,
            entry.attempts,
        );
        entry.attempts += 1;
        entry.next_retry_at = Utc::now() + to_chrono(delay);
        let next_retry_at = entry.next_retry_at;
        debug!(entry = %entry.id, attempts = entry.attempts, %next_retry_at, "dead-letter entry rescheduled");
        self.lock().push(entry);
        self.publish();
        Rescheduled::Retry { next_retry_at }
    }

    /// Drop a claimed entry whose replay succeeded or became moot.
    pub fn resolve(&self, entry: &DeadLetterEntry) {
        info!(entry = %entry.id, kind = entry.item.kind(), work_unit = %entry.item.work_unit(), "dead-letter entry resolved");
        self.metrics.increment(
            names::TASK_OPERATIONS,
            &[("operation", "dead_letter_replay"), ("status", "resolved")],
        );
    }
}

fn read_entries(path: &Path) -> Result<Vec<DeadLetterEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dead-letter file: {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse dead-letter file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use crate::models::{FailureReason, Priority, TaskPayload, TaskType};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn security_task() -> AgentTask {
        AgentTask::new(
            TaskType::SecurityReview,
            Priority::High,
            WorkUnitKey::pull_request("octo/repo", 1),
            1,
            TaskPayload::SecurityReview {
                files: vec!["src/auth.rs".into()],
                concerns: vec![],
            },
        )
        .unwrap()
    }

    fn task_item() -> DeadLetterItem {
        DeadLetterItem::Task {
            task: Box::new(security_task()),
        }
    }

    fn queue(max_attempts: u32, path: Option<PathBuf>) -> (DeadLetterQueue, Arc<InMemoryMetrics>) {
        let metrics = Arc::new(InMemoryMetrics::new());
        let queue = DeadLetterQueue::new(
            DeadLetterConfig {
                max_attempts,
                backoff_base: Duration::from_secs(1),
                backoff_max: Duration::from_secs(10),
                path,
            },
            metrics.clone(),
        );
        (queue, metrics)
    }

    #[test]
    fn test_claim_only_due_entries() {
        let (queue, metrics) = queue(5, None);
        let now = Utc::now();
        queue.push(task_item(), now - chrono::Duration::seconds(1), "circuit open");
        queue.push(task_item(), now + chrono::Duration::seconds(60), "circuit open");
        assert_eq!(metrics.gauge_value(names::DEAD_LETTER_SIZE, &[]), Some(2.0));

        let due = queue.claim_due(now);
        assert_eq!(due.len(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(metrics.gauge_value(names::DEAD_LETTER_SIZE, &[]), Some(1.0));

        let later = queue.claim_due(now + chrono::Duration::seconds(61));
        assert_eq!(later.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reschedule_backs_off_until_ceiling() {
        let (queue, metrics) = queue(3, None);
        queue.push(task_item(), Utc::now(), "boom");
        let far = Utc::now() + chrono::Duration::days(1);

        let mut gaps = Vec::new();
        for _ in 0..2 {
            let entry = queue.claim_due(far).remove(0);
            let before = Utc::now();
            match queue.reschedule(entry, "still failing") {
                Rescheduled::Retry { next_retry_at } => gaps.push(next_retry_at - before),
                other => panic!("expected retry, got {other:?}"),
            }
        }
        // attempt 1 -> 2s, attempt 2 -> 4s
        assert!(gaps[0] >= chrono::Duration::milliseconds(1_900));
        assert!(gaps[1] >= chrono::Duration::milliseconds(3_900));

        let entry = queue.claim_due(far).remove(0);
        assert_eq!(entry.attempts, 3);
        match queue.reschedule(entry, "gave up") {
            Rescheduled::PermanentlyFailed(e) => assert_eq!(e.last_error, "gave up"),
            other => panic!("expected permanent failure, got {other:?}"),
        }
        assert!(queue.is_empty());
        assert_eq!(queue.permanent_failures(), 1);
        assert_eq!(
            metrics.counter(
                names::ERRORS,
                &[("type", "permanent_failure"), ("component", "dead_letter")]
            ),
            1
        );
    }

    #[test]
    fn test_flush_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("dead-letter.json");
        let (queue, _) = queue(5, Some(path.clone()));
        let id = queue.push(task_item(), Utc::now(), "exhausted");
        queue.flush().unwrap();
        assert!(path.exists());

        let restored = DeadLetterQueue::load(
            DeadLetterConfig {
                path: Some(path),
                ..DeadLetterConfig::default()
            },
            Arc::new(InMemoryMetrics::new()),
        )
        .unwrap();
        let entries = restored.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].last_error, "exhausted");
    }

    #[test]
    fn test_task_snapshot_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dead-letter.json");
        let mut task = security_task();
        task.start("sec-1").unwrap();
        task.fail(FailureReason::Exhausted).unwrap();
        let item = DeadLetterItem::Task {
            task: Box::new(task.clone()),
        };

        let (queue, _) = queue(5, Some(path.clone()));
        queue.push(item.clone(), Utc::now(), "retries exhausted");
        queue.flush().unwrap();

        let restored = DeadLetterQueue::load(
            DeadLetterConfig {
                path: Some(path),
                ..DeadLetterConfig::default()
            },
            Arc::new(InMemoryMetrics::new()),
        )
        .unwrap();
        let entry = restored.claim_due(Utc::now()).remove(0);
        assert_eq!(entry.item, item);
        let DeadLetterItem::Task { task: restored_task } = entry.item else {
            panic!("expected a task entry");
        };
        assert_eq!(restored_task.payload, task.payload);
        assert_eq!(restored_task.failure_reason, Some(FailureReason::Exhausted));
        assert_eq!(restored_task.attempts[0].agent.as_deref(), Some("sec-1"));
    }

    #[test]
    fn test_load_without_file_is_empty() {
        let dir = tempdir().unwrap();
        let queue = DeadLetterQueue::load(
            DeadLetterConfig {
                path: Some(dir.path().join("missing.json")),
                ..DeadLetterConfig::default()
            },
            Arc::new(InMemoryMetrics::new()),
        )
        .unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_load_rejects_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dead-letter.json");
        std::fs::write(&path, "{ nope").unwrap();
        let err = DeadLetterQueue::load(
            DeadLetterConfig {
                path: Some(path),
                ..DeadLetterConfig::default()
            },
            Arc::new(InMemoryMetrics::new()),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("Failed to parse dead-letter file"));
    }
}
