//! Publishes a [`FinalReport`] to the platform.
//!
//! Each side effect is recorded in the work unit's ledger under the
//! report's fingerprint. Publishing the same fingerprint again only
//! performs the steps that have not completed yet.

use std::sync::Arc;

use tracing::{info, warn};

use super::report::{FinalReport, render};
use crate::errors::PlatformError;
use crate::metrics::{SharedMetrics, names};
use crate::models::{EntityKind, MergeStrategy};
use crate::platform::PlatformClient;
use crate::tasks::{ReportStep, WorkUnitStore};

/// Side effects performed by one publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Published {
    /// The fingerprint had already been fully published.
    pub unchanged: bool,
    pub labels_added: Vec<String>,
    pub labels_removed: Vec<String>,
    pub commented: bool,
    pub reviewed: bool,
    pub merged: Option<MergeStrategy>,
    pub closed: bool,
}

pub struct Reporter {
    platform: Arc<dyn PlatformClient>,
    store: Arc<WorkUnitStore>,
    merge_strategies: Vec<MergeStrategy>,
    metrics: SharedMetrics,
}

impl Reporter {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        store: Arc<WorkUnitStore>,
        merge_strategies: Vec<MergeStrategy>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            platform,
            store,
            merge_strategies,
            metrics,
        }
    }

    fn done(&self, report: &FinalReport, step: ReportStep) -> bool {
        self.store.ledger(&report.work_unit).is_done(step)
    }

    fn mark(&self, report: &FinalReport, step: ReportStep) {
        self.store
            .update_ledger(&report.work_unit, |l| {
                l.completed.insert(step);
            });
    }

    fn count(&self, status: &str) {
        self.metrics.increment(
            names::TASK_OPERATIONS,
            &[("operation", "report"), ("status", status)],
        );
    }

    /// Run the report's outstanding steps in order: labels, comment, then
    /// merge or close. A failing step stops the run and stays outstanding.
    /// A stale pull request is only closed once every merge strategy was
    /// refused; a retryable merge error leaves the merge step outstanding.
    pub async fn publish(&self, report: &FinalReport) -> Result<Published, PlatformError> {
        let key = &report.work_unit;
        let fresh = self
            .store
            .update_ledger(key, |l| l.begin(&report.fingerprint));
        let mut out = Published::default();

        if !fresh && self.done(report, ReportStep::Comment) && !self.merge_pending(report) {
            out.unchanged = true;
            self.count("unchanged");
            return Ok(out);
        }

        if let Err(e) = self.run_steps(report, &mut out).await {
            warn!(work_unit = %key, error = %e, "report publication interrupted");
            self.count("failed");
            self.metrics.increment(
                names::ERRORS,
                &[("type", "report"), ("component", "reporter")],
            );
            return Err(e);
        }
        info!(
            work_unit = %key,
            cycle = report.cycle,
            labels = out.labels_added.len(),
            labels_removed = out.labels_removed.len(),
            merged = ?out.merged,
            closed = out.closed,
            "report published"
        );
        self.count("published");
        Ok(out)
    }

    fn merge_pending(&self, report: &FinalReport) -> bool {
        self.wants_merge(report)
            && !self.done(report, ReportStep::Merge)
            && !self.done(report, ReportStep::Close)
    }

    fn wants_merge(&self, report: &FinalReport) -> bool {
        report.work_unit.kind == EntityKind::PullRequest
            && report.all_required_passed
            && report.auto_merge_eligible
    }

    async fn run_steps(
        &self,
        report: &FinalReport,
        out: &mut Published,
    ) -> Result<(), PlatformError> {
        let key = &report.work_unit;

        if !self.done(report, ReportStep::Labels) {
            let applied = self.store.ledger(key).labels_applied;
            let new: Vec<String> = report
                .labels
                .iter()
                .filter(|l| !applied.contains(*l))
                .cloned()
                .collect();
            if !new.is_empty() {
                self.platform.add_labels(key, &new).await?;
                self.store
                    .update_ledger(key, |l| l.labels_applied.extend(new.iter().cloned()));
            }
            for label in report.superseded_labels(&applied) {
                self.platform.remove_label(key, &label).await?;
                self.store.update_ledger(key, |l| {
                    l.labels_applied.remove(&label);
                });
                out.labels_removed.push(label);
            }
            self.mark(report, ReportStep::Labels);
            out.labels_added = new;
        }

        if !self.done(report, ReportStep::Comment) {
            let body = render(report);
            out.reviewed = self.try_review(report, &body).await;
            if !out.reviewed {
                self.platform.post_comment(key, &body).await?;
                out.commented = true;
            }
            self.mark(report, ReportStep::Comment);
        }

        if self.merge_pending(report) {
            for strategy in &self.merge_strategies {
                match self.platform.merge(&key.repository, key.number, *strategy).await {
                    Ok(()) => {
                        info!(work_unit = %key, strategy = strategy.as_str(), "pull request merged");
                        out.merged = Some(*strategy);
                        break;
                    }
                    // the platform, not the strategy, is failing: retry the step later
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => {
                        warn!(work_unit = %key, strategy = strategy.as_str(), error = %e, "merge strategy failed");
                    }
                }
            }
            if out.merged.is_some() {
                self.mark(report, ReportStep::Merge);
            } else if report.stale {
                self.platform.close(key).await?;
                info!(work_unit = %key, "stale pull request closed after merges failed");
                out.closed = true;
                self.mark(report, ReportStep::Close);
            } else {
                // one round of merge attempts per fingerprint
                self.mark(report, ReportStep::Merge);
            }
        }
        Ok(())
    }

    /// Post the comment as a structured review when a verdict exists and
    /// the platform supports it. Returns false to fall back to a comment.
    async fn try_review(&self, report: &FinalReport, body: &str) -> bool {
        let key = &report.work_unit;
        let (Some(recommendation), Some(reviewer), EntityKind::PullRequest) = (
            report.recommendation,
            self.platform.review_commenter(),
            key.kind,
        ) else {
            return false;
        };
        match reviewer
            .post_review(&key.repository, key.number, recommendation, body)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(work_unit = %key, error = %e, "structured review failed, posting a comment instead");
                false
            }
        }
    }
}
