//! WorkUnit store.
//!
//! Every task lives inside its work unit, and every task mutation goes
//! through a [`WorkUnitStore`] accessor. Each unit also carries an async
//! pipeline lock that serializes task generation and reporting for it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::analyzer::{Analyzed, PrAnalyzed};
use crate::errors::TaskError;
use crate::metrics::{SharedMetrics, names};
use crate::models::{
    AgentTask, FailureReason, Priority, TaskResult, TaskStatus, TaskType, WorkUnitKey,
};

/// Side effects the reporter has completed for one task-set fingerprint.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ReportStep {
    Labels,
    Comment,
    Merge,
    Close,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportLedger {
    pub fingerprint: Option<String>,
    pub completed: BTreeSet<ReportStep>,
    /// Labels applied across every report, never re-sent.
    pub labels_applied: BTreeSet<String>,
    pub reports: u32,
}

impl ReportLedger {
    /// Start tracking `fingerprint`; returns false if it is already tracked.
    pub fn begin(&mut self, fingerprint: &str) -> bool {
        if self.fingerprint.as_deref() == Some(fingerprint) {
            return false;
        }
        self.fingerprint = Some(fingerprint.to_string());
        self.completed.clear();
        self.reports += 1;
        true
    }

    pub fn is_done(&self, step: ReportStep) -> bool {
        self.completed.contains(&step)
    }
}

#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub key: WorkUnitKey,
    /// Incremented by every plan installed on the unit.
    pub cycle: u32,
    pub tasks: Vec<AgentTask>,
    pub analysis: Option<Analyzed>,
    pub ledger: ReportLedger,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retired: bool,
    /// Closed on the platform. Failed tasks are not retried until the next cycle.
    pub closed: bool,
}

impl WorkUnit {
    fn new(key: WorkUnitKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            cycle: 0,
            tasks: Vec::new(),
            analysis: None,
            ledger: ReportLedger::default(),
            created_at: now,
            updated_at: now,
            retired: false,
            closed: false,
        }
    }

    pub fn task(&self, id: Uuid) -> Option<&AgentTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn has_active(&self) -> bool {
        self.tasks.iter().any(AgentTask::is_active)
    }

    /// The newest task of each type that was not superseded, in type order.
    pub fn latest_per_type(&self) -> Vec<&AgentTask> {
        let mut latest: BTreeMap<TaskType, &AgentTask> = BTreeMap::new();
        for task in &self.tasks {
            if task.failure_reason == Some(FailureReason::Superseded) {
                continue;
            }
            latest
                .entry(task.task_type)
                .and_modify(|t| {
                    if task.created_at >= t.created_at {
                        *t = task;
                    }
                })
                .or_insert(task);
        }
        latest.into_values().collect()
    }

    pub fn pr_analysis(&self) -> Option<&Arc<PrAnalyzed>> {
        match &self.analysis {
            Some(Analyzed::PullRequest(pr)) => Some(pr),
            _ => None,
        }
    }
}

/// Row of the `/tasks` listing.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,
    pub work_unit: String,
    pub assigned_agent: Option<String>,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&AgentTask> for TaskSummary {
    fn from(task: &AgentTask) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type,
            priority: task.priority,
            status: task.status,
            work_unit: task.work_unit.to_string(),
            assigned_agent: task.assigned_agent.clone(),
            attempt: task.attempt(),
            created_at: task.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

struct UnitState {
    unit: WorkUnit,
    tokens: HashMap<Uuid, CancellationToken>,
}

struct Slot {
    state: Mutex<UnitState>,
    pipeline: Arc<tokio::sync::Mutex<()>>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, UnitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkUnitStore {
    units: DashMap<WorkUnitKey, Arc<Slot>>,
    metrics: SharedMetrics,
}

impl WorkUnitStore {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            units: DashMap::new(),
            metrics,
        }
    }

    fn slot(&self, key: &WorkUnitKey) -> Arc<Slot> {
        let entry = self.units.entry(key.clone()).or_insert_with(|| {
            Arc::new(Slot {
                state: Mutex::new(UnitState {
                    unit: WorkUnit::new(key.clone()),
                    tokens: HashMap::new(),
                }),
                pipeline: Arc::new(tokio::sync::Mutex::new(())),
            })
        });
        entry.value().clone()
    }

    fn existing(&self, key: &WorkUnitKey) -> Option<Arc<Slot>> {
        self.units.get(key).map(|s| s.value().clone())
    }

    fn record(&self, operation: &str, status: &str) {
        self.metrics.increment(
            names::TASK_OPERATIONS,
            &[("operation", operation), ("status", status)],
        );
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Lock serializing generation and reporting for `key`.
    pub fn pipeline(&self, key: &WorkUnitKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.slot(key).pipeline)
    }

    pub fn get(&self, key: &WorkUnitKey) -> Option<WorkUnit> {
        let slot = self.existing(key)?;
        let unit = slot.lock().unit.clone();
        Some(unit)
    }

    pub fn last_analysis_id(&self, key: &WorkUnitKey) -> Option<u64> {
        let slot = self.existing(key)?;
        let id = slot.lock().unit.analysis.as_ref().map(Analyzed::id);
        id
    }

    pub fn record_analysis(&self, key: &WorkUnitKey, analysis: Analyzed) {
        let slot = self.slot(key);
        let mut state = slot.lock();
        state.unit.analysis = Some(analysis);
        state.unit.updated_at = Utc::now();
    }

    /// Open the next review cycle and return its number.
    pub fn next_cycle(&self, key: &WorkUnitKey) -> u32 {
        let slot = self.slot(key);
        let mut state = slot.lock();
        state.unit.cycle += 1;
        state.unit.retired = false;
        state.unit.closed = false;
        state.unit.cycle
    }

    /// Add `tasks` to the unit. An outstanding task of the same type is
    /// superseded: failed with `superseded` and its token cancelled.
    pub fn install(
        &self,
        key: &WorkUnitKey,
        tasks: Vec<AgentTask>,
    ) -> Vec<(AgentTask, CancellationToken)> {
        let slot = self.slot(key);
        let mut state = slot.lock();
        let UnitState { unit, tokens } = &mut *state;
        let mut installed = Vec::with_capacity(tasks.len());

        for task in tasks {
            for old in unit
                .tasks
                .iter_mut()
                .filter(|t| t.is_active() && t.task_type == task.task_type)
            {
                if old.fail(FailureReason::Superseded).is_ok() {
                    if let Some(token) = tokens.remove(&old.id) {
                        token.cancel();
                    }
                    info!(work_unit = %key, task_id = %old.id, task_type = %old.task_type, "task superseded");
                    self.record("supersede", "failed");
                }
            }
            let token = CancellationToken::new();
            tokens.insert(task.id, token.clone());
            debug!(work_unit = %key, task_id = %task.id, task_type = %task.task_type, priority = %task.priority, "task created");
            self.record("create", "pending");
            installed.push((task.clone(), token));
            unit.tasks.push(task);
        }
        unit.updated_at = Utc::now();
        installed
    }

    fn mutate<R>(
        &self,
        key: &WorkUnitKey,
        id: Uuid,
        f: impl FnOnce(&mut AgentTask) -> Result<R, TaskError>,
    ) -> Result<R, TaskError> {
        let slot = self.existing(key).ok_or(TaskError::NotFound(id))?;
        let mut state = slot.lock();
        let UnitState { unit, tokens } = &mut *state;
        let task = unit
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(TaskError::NotFound(id))?;
        let out = f(task)?;
        if task.status.is_terminal() {
            tokens.remove(&id);
        }
        unit.updated_at = Utc::now();
        Ok(out)
    }

    pub fn start(&self, key: &WorkUnitKey, id: Uuid, agent_id: &str) -> Result<(), TaskError> {
        self.mutate(key, id, |t| t.start(agent_id))?;
        self.record("start", "in_progress");
        Ok(())
    }

    /// Record the agent's result. Fails if the task was superseded or
    /// cancelled meanwhile, which discards the late result.
    pub fn complete(
        &self,
        key: &WorkUnitKey,
        id: Uuid,
        result: TaskResult,
    ) -> Result<(), TaskError> {
        self.mutate(key, id, |t| t.complete(result))?;
        self.record("complete", "completed");
        Ok(())
    }

    pub fn fail(&self, key: &WorkUnitKey, id: Uuid, reason: FailureReason) -> Result<(), TaskError> {
        self.mutate(key, id, |t| t.fail(reason))?;
        self.record("fail", reason.as_str());
        Ok(())
    }

    /// Reopen a failed task for another attempt under the same id. Refused
    /// when the unit is closed, the task was superseded, or a newer task of
    /// its type is active.
    pub fn retry(
        &self,
        key: &WorkUnitKey,
        id: Uuid,
    ) -> Result<(AgentTask, CancellationToken), TaskError> {
        let slot = self.existing(key).ok_or(TaskError::NotFound(id))?;
        let mut state = slot.lock();
        let UnitState { unit, tokens } = &mut *state;
        if unit.closed {
            return Err(TaskError::UnitClosed(key.clone()));
        }
        let task_type = unit.task(id).ok_or(TaskError::NotFound(id))?.task_type;
        let newer_active = unit
            .tasks
            .iter()
            .any(|t| t.id != id && t.task_type == task_type && t.is_active());
        let task = unit
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(TaskError::NotFound(id))?;
        let replaceable = task
            .failure_reason
            .is_some_and(|r| r.counts_as_failure());
        if newer_active || !replaceable {
            return Err(TaskError::InvalidTransition {
                from: task.status,
                to: TaskStatus::Pending,
            });
        }
        task.retry()?;
        let token = CancellationToken::new();
        tokens.insert(id, token.clone());
        unit.retired = false;
        unit.updated_at = Utc::now();
        let snapshot = task.clone();
        drop(state);
        self.record("retry", "pending");
        Ok((snapshot, token))
    }

    /// Put a task snapshot back into its unit, e.g. one read from the
    /// dead-letter file after a restart. Returns false if the unit already
    /// holds a task with that id.
    pub fn restore(&self, task: &AgentTask) -> bool {
        let slot = self.slot(&task.work_unit);
        let mut state = slot.lock();
        let unit = &mut state.unit;
        if unit.task(task.id).is_some() {
            return false;
        }
        unit.cycle = unit.cycle.max(task.cycle);
        unit.tasks.push(task.clone());
        unit.updated_at = Utc::now();
        drop(state);
        info!(work_unit = %task.work_unit, task_id = %task.id, task_type = %task.task_type, "task restored");
        self.record("restore", task.status.as_str());
        true
    }

    /// Fail the unit's outstanding tasks with `work_unit_closed` and retire
    /// it. The closed mark holds until the next cycle.
    pub fn close(&self, key: &WorkUnitKey) -> Vec<Uuid> {
        let cancelled = self.cancel_active(key, FailureReason::WorkUnitClosed);
        let slot = self.slot(key);
        let mut state = slot.lock();
        state.unit.closed = true;
        if !state.unit.has_active() {
            state.unit.retired = true;
        }
        state.unit.updated_at = Utc::now();
        cancelled
    }

    /// Fail every outstanding task of the unit with `reason`.
    pub fn cancel_active(&self, key: &WorkUnitKey, reason: FailureReason) -> Vec<Uuid> {
        self.cancel_where(key, reason, |_| true)
    }

    /// Fail those of `ids` that are still outstanding.
    pub fn cancel_tasks(&self, key: &WorkUnitKey, ids: &[Uuid], reason: FailureReason) -> Vec<Uuid> {
        self.cancel_where(key, reason, |t| ids.contains(&t.id))
    }

    fn cancel_where(
        &self,
        key: &WorkUnitKey,
        reason: FailureReason,
        pick: impl Fn(&AgentTask) -> bool,
    ) -> Vec<Uuid> {
        let Some(slot) = self.existing(key) else {
            return Vec::new();
        };
        let mut state = slot.lock();
        let UnitState { unit, tokens } = &mut *state;
        let mut cancelled = Vec::new();
        for task in unit.tasks.iter_mut().filter(|t| t.is_active() && pick(t)) {
            if task.fail(reason).is_ok() {
                if let Some(token) = tokens.remove(&task.id) {
                    token.cancel();
                }
                cancelled.push(task.id);
            }
        }
        unit.updated_at = Utc::now();
        drop(state);
        for id in &cancelled {
            debug!(work_unit = %key, task_id = %id, reason = reason.as_str(), "task cancelled");
            self.record("cancel", reason.as_str());
        }
        cancelled
    }

    pub fn ledger(&self, key: &WorkUnitKey) -> ReportLedger {
        let Some(slot) = self.existing(key) else {
            return ReportLedger::default();
        };
        let ledger = slot.lock().unit.ledger.clone();
        ledger
    }

    pub fn update_ledger<R>(&self, key: &WorkUnitKey, f: impl FnOnce(&mut ReportLedger) -> R) -> R {
        let slot = self.slot(key);
        let mut state = slot.lock();
        f(&mut state.unit.ledger)
    }

    /// Mark the unit done until its next cycle.
    pub fn retire(&self, key: &WorkUnitKey) {
        if let Some(slot) = self.existing(key) {
            let mut state = slot.lock();
            if !state.unit.has_active() && !state.unit.retired {
                state.unit.retired = true;
                state.unit.updated_at = Utc::now();
            }
        }
    }

    /// Drop retired units untouched for `idle`. Units still referenced
    /// elsewhere, or for which `keep` returns true, stay.
    pub fn evict_retired(
        &self,
        idle: chrono::Duration,
        now: DateTime<Utc>,
        keep: impl Fn(&WorkUnitKey) -> bool,
    ) -> usize {
        let mut evicted = 0;
        self.units.retain(|key, slot| {
            if Arc::strong_count(slot) > 1 || Arc::strong_count(&slot.pipeline) > 1 || keep(key) {
                return true;
            }
            let state = slot.lock();
            let unit = &state.unit;
            let idle_retired = unit.retired && !unit.has_active() && unit.updated_at + idle <= now;
            if idle_retired {
                evicted += 1;
            }
            !idle_retired
        });
        if evicted > 0 {
            debug!(evicted, remaining = self.units.len(), "retired work units evicted");
        }
        evicted
    }

    /// Pending and in-progress tasks across all units, highest priority first.
    pub fn active_tasks(&self) -> Vec<TaskSummary> {
        let slots: Vec<Arc<Slot>> = self.units.iter().map(|e| Arc::clone(e.value())).collect();
        let mut out: Vec<TaskSummary> = slots
            .iter()
            .flat_map(|slot| {
                slot.lock()
                    .unit
                    .tasks
                    .iter()
                    .filter(|t| t.is_active())
                    .map(TaskSummary::from)
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort_by_key(|t| (std::cmp::Reverse(t.priority), t.created_at));
        out
    }

    pub fn counts(&self) -> TaskCounts {
        let slots: Vec<Arc<Slot>> = self.units.iter().map(|e| Arc::clone(e.value())).collect();
        let mut counts = TaskCounts::default();
        for slot in slots {
            for task in &slot.lock().unit.tasks {
                match task.status {
                    TaskStatus::Pending => counts.pending += 1,
                    TaskStatus::InProgress => counts.in_progress += 1,
                    TaskStatus::Completed => counts.completed += 1,
                    TaskStatus::Failed => counts.failed += 1,
                }
            }
        }
        counts
    }
}
