//! The orchestration engine.
//!
//! Every accepted delivery is processed on its own tokio task:
//!
//! 1. analyze the work unit (joining an in-flight analysis when there is one)
//! 2. under the unit's pipeline lock, install the generated tasks
//! 3. dispatch them concurrently, bounded by the aggregation horizon
//! 4. under the pipeline lock again, build and publish the report
//!
//! Deliveries, tasks and reports that fail in a retryable way go to the
//! dead-letter queue; [`spawn_dead_letter_sweeper`] replays them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::{Aggregator, Reporter, render_status};
use crate::analyzer::{Analyzed, Analyzer, PrAnalyzed};
use crate::config::Config;
use crate::dead_letter::{DeadLetterEntry, DeadLetterItem, DeadLetterQueue, Rescheduled};
use crate::delegator::circuit_breaker::CircuitBreakerConfig;
use crate::delegator::client::AgentClient;
use crate::delegator::{Delegator, DelegatorConfig};
use crate::errors::{DispatchError, EngineError, PlatformError, TaskError, WebhookError};
use crate::metrics::{SharedMetrics, names};
use crate::models::{AgentStatus, AgentTask, EntityKind, MergeStrategy, TaskType, WorkUnitKey};
use crate::platform::PlatformClient;
use crate::registry::AgentRegistry;
use crate::tasks::{self, TaskCounts, TaskSummary, WorkUnitStore};
use crate::webhook::command::Command;
use crate::webhook::{
    DEFAULT_LOG_CAPACITY, Delivery, DeliveryState, InboundDelivery, IssueAction, PrAction,
    RouteOutcome, RoutedEvent, WebhookRouter,
};

/// Knobs the engine is built from.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub webhook_secret: String,
    pub delivery_log_capacity: usize,
    pub stale_after: chrono::Duration,
    pub aggregation_timeout: Duration,
    pub merge_strategies: Vec<MergeStrategy>,
    pub delegator: DelegatorConfig,
    /// How long a retired work unit is kept before the sweeper forgets it.
    pub retired_retention: chrono::Duration,
}

const DEFAULT_RETIRED_RETENTION_HOURS: i64 = 24;

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            webhook_secret: String::new(),
            delivery_log_capacity: DEFAULT_LOG_CAPACITY,
            stale_after: chrono::Duration::days(30),
            aggregation_timeout: Duration::from_millis(1_800_000),
            merge_strategies: vec![MergeStrategy::Squash, MergeStrategy::Rebase, MergeStrategy::Merge],
            delegator: DelegatorConfig::default(),
            retired_retention: chrono::Duration::hours(DEFAULT_RETIRED_RETENTION_HOURS),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let dispatch = &config.dispatch;
        Self {
            webhook_secret: config.github.webhook_secret.clone(),
            delivery_log_capacity: DEFAULT_LOG_CAPACITY,
            stale_after: config.review.stale_after,
            aggregation_timeout: config.review.aggregation_timeout,
            merge_strategies: config.review.merge_strategies.clone(),
            delegator: DelegatorConfig::default()
                .with_max_concurrent_tasks(dispatch.max_concurrent_tasks)
                .with_task_timeout(dispatch.task_timeout)
                .with_retry_attempts(dispatch.retry_attempts)
                .with_backoff(dispatch.retry_backoff, dispatch.retry_backoff_max),
            retired_retention: chrono::Duration::hours(DEFAULT_RETIRED_RETENTION_HOURS),
        }
    }
}

/// Breaker settings for every agent in the registry.
pub fn breaker_config(config: &Config) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: config.dispatch.circuit_breaker_threshold,
        cooldown: config.dispatch.circuit_breaker_cooldown,
        ..CircuitBreakerConfig::default()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentCounts {
    pub online: usize,
    pub offline: usize,
    pub busy: usize,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub tasks: TaskCounts,
    pub agents: AgentCounts,
    pub dead_letter: usize,
    pub permanent_failures: u64,
    pub queued_dispatches: usize,
    pub in_flight_dispatches: usize,
    pub work_units: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

/// Outcome of one dead-letter sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub resolved: usize,
    pub rescheduled: usize,
    pub permanently_failed: usize,
}

pub struct Engine {
    router: WebhookRouter,
    analyzer: Analyzer,
    store: Arc<WorkUnitStore>,
    delegator: Delegator,
    aggregator: Aggregator,
    reporter: Reporter,
    dead_letter: Arc<DeadLetterQueue>,
    platform: Arc<dyn PlatformClient>,
    metrics: SharedMetrics,
    retired_retention: chrono::Duration,
    started_at: DateTime<Utc>,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        platform: Arc<dyn PlatformClient>,
        registry: Arc<AgentRegistry>,
        client: Arc<dyn AgentClient>,
        dead_letter: Arc<DeadLetterQueue>,
        metrics: SharedMetrics,
    ) -> Self {
        let store = Arc::new(WorkUnitStore::new(metrics.clone()));
        Self {
            router: WebhookRouter::new(
                settings.webhook_secret,
                settings.delivery_log_capacity,
                metrics.clone(),
            ),
            analyzer: Analyzer::new(Arc::clone(&platform), settings.stale_after),
            delegator: Delegator::new(settings.delegator, registry, client, metrics.clone()),
            aggregator: Aggregator::new(
                Arc::clone(&store),
                settings.aggregation_timeout,
                metrics.clone(),
            ),
            reporter: Reporter::new(
                Arc::clone(&platform),
                Arc::clone(&store),
                settings.merge_strategies,
                metrics.clone(),
            ),
            store,
            dead_letter,
            platform,
            metrics,
            retired_retention: settings.retired_retention,
            started_at: Utc::now(),
        }
    }

    pub fn router(&self) -> &WebhookRouter {
        &self.router
    }

    pub fn analyzer(&self) -> &Analyzer {
        &self.analyzer
    }

    pub fn store(&self) -> &Arc<WorkUnitStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        self.delegator.registry()
    }

    pub fn dead_letter(&self) -> &Arc<DeadLetterQueue> {
        &self.dead_letter
    }

    /// Validate and classify an inbound delivery.
    pub fn accept(&self, inbound: InboundDelivery<'_>) -> Result<RouteOutcome, WebhookError> {
        self.router.route(inbound)
    }

    pub fn status(&self) -> StatusReport {
        let registry = self.registry();
        StatusReport {
            tasks: self.store.counts(),
            agents: AgentCounts {
                online: registry.count_by_status(AgentStatus::Online),
                offline: registry.count_by_status(AgentStatus::Offline),
                busy: registry.count_by_status(AgentStatus::Busy),
            },
            dead_letter: self.dead_letter.len(),
            permanent_failures: self.dead_letter.permanent_failures(),
            queued_dispatches: self.delegator.queued(),
            in_flight_dispatches: self.delegator.in_flight(),
            work_units: self.store.len(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    pub fn active_tasks(&self) -> Vec<TaskSummary> {
        self.store.active_tasks()
    }

    fn record_error(&self, kind: &str) {
        self.metrics
            .increment(names::ERRORS, &[("type", kind), ("component", "engine")]);
    }

    /// Run an accepted delivery to completion and record its final state.
    pub async fn process(&self, delivery: Delivery) {
        let log = self.router.log();
        match self.handle(&delivery.event).await {
            Ok(()) => {
                debug!(delivery_id = %delivery.id, "delivery processed");
                log.finish(&delivery.id, DeliveryState::Processed);
            }
            Err(e) if e.is_retryable() => {
                warn!(delivery_id = %delivery.id, work_unit = %delivery.event.key(), error = %e, "delivery failed, dead-lettering");
                self.record_error("delivery");
                let error = e.to_string();
                let id = delivery.id.clone();
                self.dead_letter
                    .push_with_backoff(DeadLetterItem::Delivery(delivery), error);
                log.finish(&id, DeliveryState::DeadLettered);
            }
            Err(e) => {
                error!(delivery_id = %delivery.id, work_unit = %delivery.event.key(), error = %e, "delivery failed");
                self.record_error("delivery");
                log.finish(&delivery.id, DeliveryState::Failed);
            }
        }
    }

    async fn handle(&self, event: &RoutedEvent) -> Result<(), EngineError> {
        match event {
            RoutedEvent::PullRequest {
                key,
                action: PrAction::Analyze,
            }
            | RoutedEvent::Issue {
                key,
                action: IssueAction::Analyze,
            } => self.review(key, false).await,
            RoutedEvent::PullRequest {
                key,
                action: PrAction::Closed,
            }
            | RoutedEvent::Issue {
                key,
                action: IssueAction::Closed,
            } => {
                self.close(key).await;
                Ok(())
            }
            RoutedEvent::Command {
                key,
                command,
                author,
            } => self.command(key, command, author).await,
        }
    }

    /// Analyze the unit and run a review cycle for what the analysis asks.
    async fn review(&self, key: &WorkUnitKey, force_all: bool) -> Result<(), EngineError> {
        let analyzed = self.analyzer.analyze(key).await?;

        let installed = {
            let pipeline = self.store.pipeline(key);
            let _guard = pipeline.lock().await;
            if !force_all && self.store.last_analysis_id(key) == Some(analyzed.id()) {
                debug!(work_unit = %key, analysis = analyzed.id(), "analysis already planned");
                return Ok(());
            }
            self.store.record_analysis(key, analyzed.clone());
            let cycle = self.store.next_cycle(key);
            let plan = match &analyzed {
                Analyzed::PullRequest(pr) if force_all => {
                    let mut analysis = pr.analysis.clone();
                    analysis.force_all();
                    let forced = PrAnalyzed {
                        id: pr.id,
                        context: pr.context.clone(),
                        analysis,
                    };
                    tasks::plan_pr(key, cycle, &forced)?
                }
                Analyzed::PullRequest(pr) => tasks::plan_pr(key, cycle, pr)?,
                Analyzed::Issue(issue) => {
                    self.apply_labels(key, &issue.analysis.suggested_labels)
                        .await?;
                    tasks::plan_issue(key, cycle, issue)?
                }
            };
            info!(work_unit = %key, cycle, tasks = plan.len(), "review cycle planned");
            self.store.install(key, plan)
        };
        self.run_cycle(key, installed).await
    }

    /// Dispatch installed tasks and report once they settle.
    async fn run_cycle(
        &self,
        key: &WorkUnitKey,
        installed: Vec<(AgentTask, CancellationToken)>,
    ) -> Result<(), EngineError> {
        if installed.is_empty() {
            self.store.retire(key);
            return Ok(());
        }
        let ids: Vec<Uuid> = installed.iter().map(|(t, _)| t.id).collect();
        let runs = join_all(
            installed
                .into_iter()
                .map(|(task, token)| self.run_task(task, token)),
        );
        self.aggregator
            .collect(key, &ids, async {
                runs.await;
            })
            .await;
        self.finish_cycle(key).await;
        Ok(())
    }

    /// Deliver one task and record its outcome on the unit.
    async fn run_task(&self, task: AgentTask, token: CancellationToken) {
        let key = &task.work_unit;
        let store = &self.store;
        let outcome = self
            .delegator
            .dispatch(&task, &token, |agent| {
                if let Err(e) = store.start(key, task.id, agent) {
                    debug!(work_unit = %key, task_id = %task.id, error = %e, "task not started");
                }
            })
            .await;

        match outcome {
            Ok(dispatched) => {
                if let Err(e) = self.store.complete(key, task.id, dispatched.result) {
                    debug!(work_unit = %key, task_id = %task.id, error = %e, "late result discarded");
                }
            }
            Err(DispatchError::Superseded) => {}
            Err(e) => {
                let reason = e.failure_reason();
                if self.store.fail(key, task.id, reason).is_err() {
                    return;
                }
                if e.is_dead_letter() {
                    self.dead_letter_task(&task, &e);
                }
            }
        }
    }

    /// Queue the task as recorded after its failure, so the entry can be
    /// replayed even when the store no longer holds it.
    fn dead_letter_task(&self, task: &AgentTask, e: &DispatchError) {
        let snapshot = self
            .store
            .get(&task.work_unit)
            .and_then(|unit| unit.task(task.id).cloned())
            .unwrap_or_else(|| task.clone());
        let item = DeadLetterItem::Task {
            task: Box::new(snapshot),
        };
        match e {
            DispatchError::CircuitOpen { retry_in, .. } => {
                let retry_in = chrono::Duration::from_std(*retry_in)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                self.dead_letter
                    .push(item, Utc::now() + retry_in, e.to_string());
            }
            _ => {
                self.dead_letter.push_with_backoff(item, e.to_string());
            }
        }
    }

    /// Publish the unit's report if it is ready. An interrupted publication
    /// is handed to the dead-letter queue.
    async fn finish_cycle(&self, key: &WorkUnitKey) {
        if let Err(e) = self.publish_report(key).await {
            self.record_error("report");
            if e.is_retryable() {
                self.dead_letter.push_with_backoff(
                    DeadLetterItem::Report {
                        work_unit: key.clone(),
                    },
                    e.to_string(),
                );
            } else {
                error!(work_unit = %key, error = %e, "report publication failed");
            }
        }
    }

    async fn publish_report(&self, key: &WorkUnitKey) -> Result<(), PlatformError> {
        let pipeline = self.store.pipeline(key);
        let _guard = pipeline.lock().await;
        let Some(report) = self.aggregator.ready_report(key) else {
            return Ok(());
        };
        self.reporter.publish(&report).await?;
        self.store.retire(key);
        Ok(())
    }

    /// Cancel everything outstanding on a closed unit.
    async fn close(&self, key: &WorkUnitKey) {
        let pipeline = self.store.pipeline(key);
        let _guard = pipeline.lock().await;
        let cancelled = self.store.close(key);
        info!(work_unit = %key, cancelled = cancelled.len(), "work unit closed");
    }

    /// Forget retired units idle past the retention. Units the dead-letter
    /// queue still refers to are kept.
    pub fn evict_idle_units(&self, now: DateTime<Utc>) -> usize {
        let held: HashSet<WorkUnitKey> = self
            .dead_letter
            .entries()
            .iter()
            .map(|entry| entry.item.work_unit().clone())
            .collect();
        self.store
            .evict_retired(self.retired_retention, now, |key| held.contains(key))
    }

    /// Add the labels not applied before, remembering them in the ledger.
    async fn apply_labels(
        &self,
        key: &WorkUnitKey,
        labels: &[String],
    ) -> Result<Vec<String>, PlatformError> {
        let applied = self.store.ledger(key).labels_applied;
        let new: Vec<String> = labels
            .iter()
            .filter(|l| !applied.contains(*l))
            .cloned()
            .collect();
        if new.is_empty() {
            return Ok(new);
        }
        self.platform.add_labels(key, &new).await?;
        self.store
            .update_ledger(key, |l| l.labels_applied.extend(new.iter().cloned()));
        Ok(new)
    }

    async fn command(
        &self,
        key: &WorkUnitKey,
        command: &Command,
        author: &str,
    ) -> Result<(), EngineError> {
        info!(work_unit = %key, command = %command, author, "command received");
        self.metrics.increment(
            names::TASK_OPERATIONS,
            &[("operation", "command"), ("status", command.name())],
        );

        match command {
            Command::Status => {
                let body = match self.store.get(key) {
                    Some(unit) => render_status(&unit),
                    None => "No review activity recorded yet.".to_string(),
                };
                self.platform.post_comment(key, &body).await?;
                Ok(())
            }
            Command::FullReview => self.review(key, true).await,
            Command::Retriage => self.triage(key, false).await,
            Command::Reestimate => self.triage(key, true).await,
            Command::LinkPr { number } => {
                self.apply_labels(key, &["has-pr".to_string()]).await?;
                self.platform
                    .post_comment(key, &format!("Linked to pull request #{}.", number))
                    .await?;
                Ok(())
            }
            Command::MarkDuplicate { number } => {
                self.apply_labels(key, &["duplicate".to_string()]).await?;
                self.platform
                    .post_comment(key, &format!("Closing as a duplicate of #{}.", number))
                    .await?;
                self.platform.close(key).await?;
                self.close(key).await;
                Ok(())
            }
            other => match other.direct_task() {
                Some(task_type) => {
                    let instructions = self.instructions(key, other);
                    self.command_cycle(key, task_type, instructions).await
                }
                None => Ok(()),
            },
        }
    }

    /// Generation instructions carried by a code-review task.
    fn instructions(&self, key: &WorkUnitKey, command: &Command) -> Option<String> {
        let subject = match self.store.get(key).and_then(|u| u.analysis) {
            Some(Analyzed::Issue(issue)) => {
                format!("issue #{} ({})", issue.context.number, issue.context.title)
            }
            _ => format!("#{}", key.number),
        };
        match command {
            Command::GenerateCode => Some(format!("Generate an implementation for {}", subject)),
            Command::CreatePr => Some(format!("Prepare a pull request resolving {}", subject)),
            _ => None,
        }
    }

    /// One task for a command, built from the stored snapshot without
    /// re-analysis. A PR seen for the first time is fetched once.
    async fn command_cycle(
        &self,
        key: &WorkUnitKey,
        task_type: TaskType,
        instructions: Option<String>,
    ) -> Result<(), EngineError> {
        let stored = self
            .store
            .get(key)
            .and_then(|u| u.pr_analysis().cloned());
        let pr = match (stored, key.kind) {
            (Some(pr), _) => Some(pr),
            (None, EntityKind::PullRequest) => match self.analyzer.analyze(key).await? {
                Analyzed::PullRequest(pr) => Some(pr),
                Analyzed::Issue(_) => None,
            },
            (None, EntityKind::Issue) => None,
        };

        let installed = {
            let pipeline = self.store.pipeline(key);
            let _guard = pipeline.lock().await;
            let cycle = self.store.next_cycle(key);
            let task = tasks::command_task(key, cycle, task_type, pr.as_deref(), instructions)?;
            info!(work_unit = %key, cycle, task_id = %task.id, task_type = %task_type, "command task planned");
            self.store.install(key, vec![task])
        };
        self.run_cycle(key, installed).await
    }

    /// Re-analyze an issue and apply its labels or post its estimate.
    async fn triage(&self, key: &WorkUnitKey, estimate: bool) -> Result<(), EngineError> {
        let analyzed = self.analyzer.analyze(key).await?;
        let Analyzed::Issue(issue) = &analyzed else {
            return Ok(());
        };
        {
            let pipeline = self.store.pipeline(key);
            let _guard = pipeline.lock().await;
            self.store.record_analysis(key, analyzed.clone());
        }
        if estimate {
            let analysis = &issue.analysis;
            let body = format!(
                "Estimated effort: about {} minutes ({} complexity, {} priority).",
                analysis.estimated_minutes,
                analysis.complexity.as_str(),
                analysis.priority,
            );
            self.platform.post_comment(key, &body).await?;
        } else {
            let added = self
                .apply_labels(key, &issue.analysis.suggested_labels)
                .await?;
            info!(work_unit = %key, issue_type = issue.analysis.issue_type.as_str(), labels = ?added, "issue retriaged");
        }
        Ok(())
    }

    // ── Dead-letter replay ───────────────────────────────────────────

    /// Replay every dead-letter entry due at `now`.
    pub async fn replay_due(&self, now: DateTime<Utc>) -> ReplaySummary {
        let mut summary = ReplaySummary::default();
        for entry in self.dead_letter.claim_due(now) {
            match self.replay(&entry).await {
                Ok(()) => {
                    if let DeadLetterItem::Delivery(delivery) = &entry.item {
                        self.router
                            .log()
                            .finish(&delivery.id, DeliveryState::Processed);
                    }
                    self.dead_letter.resolve(&entry);
                    summary.resolved += 1;
                }
                Err(error) => match self.dead_letter.reschedule(entry, error) {
                    Rescheduled::Retry { .. } => summary.rescheduled += 1,
                    Rescheduled::PermanentlyFailed(entry) => {
                        if let DeadLetterItem::Delivery(delivery) = &entry.item {
                            self.router.log().finish(&delivery.id, DeliveryState::Failed);
                        }
                        self.notify_permanent_failure(&entry).await;
                        summary.permanently_failed += 1;
                    }
                },
            }
        }
        if summary != ReplaySummary::default() {
            info!(
                resolved = summary.resolved,
                rescheduled = summary.rescheduled,
                permanently_failed = summary.permanently_failed,
                "dead-letter sweep finished"
            );
        }
        summary
    }

    async fn replay(&self, entry: &DeadLetterEntry) -> Result<(), String> {
        debug!(entry = %entry.id, kind = entry.item.kind(), attempts = entry.attempts, "replaying dead-letter entry");
        match &entry.item {
            DeadLetterItem::Delivery(delivery) => {
                self.handle(&delivery.event).await.map_err(|e| e.to_string())
            }
            DeadLetterItem::Task { task } => self.replay_task(task).await,
            DeadLetterItem::Report { work_unit } => self.replay_report(work_unit).await,
        }
    }

    fn count_replay(&self, status: &str) {
        self.metrics.increment(
            names::TASK_OPERATIONS,
            &[("operation", "dead_letter_replay"), ("status", status)],
        );
    }

    /// Retry a dead-lettered task under its original id, restoring it from
    /// its snapshot if the store lost it. Tasks that were superseded, or
    /// whose unit was closed meanwhile, resolve without a call.
    async fn replay_task(&self, snapshot: &AgentTask) -> Result<(), String> {
        let key = &snapshot.work_unit;
        let id = snapshot.id;
        if self.store.restore(snapshot) {
            info!(work_unit = %key, task_id = %id, "dead-lettered task restored from its snapshot");
        }
        let (task, token) = match self.store.retry(key, id) {
            Ok(reopened) => reopened,
            Err(TaskError::UnitClosed(_)) => {
                info!(work_unit = %key, task_id = %id, "work unit closed, dropping dead-lettered task");
                self.count_replay("closed");
                return Ok(());
            }
            Err(e) => {
                debug!(work_unit = %key, task_id = %id, error = %e, "dead-lettered task no longer replayable");
                self.count_replay("stale");
                return Ok(());
            }
        };
        let store = &self.store;
        let outcome = self
            .delegator
            .dispatch(&task, &token, |agent| {
                if let Err(e) = store.start(key, id, agent) {
                    debug!(work_unit = %key, task_id = %id, error = %e, "task not started");
                }
            })
            .await;

        match outcome {
            Ok(dispatched) => {
                if self.store.complete(key, id, dispatched.result).is_ok() {
                    info!(work_unit = %key, task_id = %id, attempt = task.attempt(), "dead-lettered task recovered");
                    self.finish_cycle(key).await;
                }
                Ok(())
            }
            Err(DispatchError::Superseded) => Ok(()),
            Err(e) => {
                if let Err(err) = self.store.fail(key, id, e.failure_reason()) {
                    warn!(work_unit = %key, task_id = %id, error = %err, "could not record replay failure");
                    self.record_error("replay");
                    return Ok(());
                }
                if e.is_dead_letter() {
                    Err(e.to_string())
                } else {
                    self.finish_cycle(key).await;
                    Ok(())
                }
            }
        }
    }

    /// Publish a dead-lettered report. When the unit's review state is gone,
    /// as after a restart, the unit is reviewed again instead.
    async fn replay_report(&self, key: &WorkUnitKey) -> Result<(), String> {
        match self.store.get(key) {
            Some(unit) if unit.closed => {
                info!(work_unit = %key, "work unit closed, dropping dead-lettered report");
                self.count_replay("closed");
                Ok(())
            }
            Some(unit) if !unit.tasks.is_empty() => {
                self.publish_report(key).await.map_err(|e| e.to_string())
            }
            _ => {
                info!(work_unit = %key, "no review state for dead-lettered report, reviewing again");
                self.review(key, false).await.map_err(|e| e.to_string())
            }
        }
    }

    async fn notify_permanent_failure(&self, entry: &DeadLetterEntry) {
        let key = entry.item.work_unit();
        let what = match &entry.item {
            DeadLetterItem::Task { task } => format!("the {} review", task.task_type.category()),
            DeadLetterItem::Delivery(delivery) => format!("the `{}` event", delivery.event_type),
            DeadLetterItem::Report { .. } => "the review report".to_string(),
        };
        let body = format!(
            "Giving up on {} after {} attempts. Last error: {}",
            what, entry.attempts, entry.last_error
        );
        if let Err(e) = self.platform.post_comment(key, &body).await {
            warn!(work_unit = %key, entry = %entry.id, error = %e, "could not report permanent failure");
        }
    }
}

/// Replay due dead-letter entries every `interval` until cancelled.
pub fn spawn_dead_letter_sweeper(
    engine: Arc<Engine>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    engine.replay_due(Utc::now()).await;
                    engine.evict_idle_units(Utc::now());
                }
            }
        }
        debug!("dead-letter sweeper stopped");
    })
}
