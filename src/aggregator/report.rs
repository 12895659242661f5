//! Final report construction and rendering.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{
    AgentTask, FailureReason, Recommendation, ResultStatus, ReviewIssue, RiskLevel, TaskStatus,
    TaskType, WorkUnitKey,
};
use crate::tasks::WorkUnit;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Partial,
    Failed,
}

impl Outcome {
    const ALL: [Outcome; 3] = [Outcome::Passed, Outcome::Partial, Outcome::Failed];

    fn label_suffix(&self) -> &'static str {
        match self {
            Self::Passed => "reviewed",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    fn icon(&self) -> &'static str {
        match self {
            Self::Passed => "✅",
            Self::Partial => "⚠️",
            Self::Failed => "❌",
        }
    }
}

/// One category's contribution to the report.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryResult {
    pub task_id: Uuid,
    pub task_type: TaskType,
    pub outcome: Outcome,
    pub agent_id: Option<String>,
    pub feedback: Option<String>,
    pub issues: Vec<ReviewIssue>,
    pub suggestions: Vec<String>,
    pub recommendation: Option<Recommendation>,
    pub failure_reason: Option<FailureReason>,
    pub execution_time_ms: u64,
}

impl CategoryResult {
    pub fn label(&self) -> String {
        format!("{}-{}", self.task_type.category(), self.outcome.label_suffix())
    }

    /// The category's labels for every other outcome.
    fn other_labels(&self) -> impl Iterator<Item = String> + '_ {
        Outcome::ALL
            .into_iter()
            .filter(|o| *o != self.outcome)
            .map(|o| format!("{}-{}", self.task_type.category(), o.label_suffix()))
    }

    fn from_task(task: &AgentTask) -> Self {
        let (outcome, agent_id, feedback, issues, suggestions, recommendation, execution_time_ms) =
            match &task.result {
                Some(result) => (
                    match result.status {
                        ResultStatus::Success => Outcome::Passed,
                        ResultStatus::Partial => Outcome::Partial,
                        ResultStatus::Failure => Outcome::Failed,
                    },
                    Some(result.agent_id.clone()),
                    result.feedback.clone(),
                    result.issues.clone(),
                    result.suggestions.clone(),
                    result.recommendation,
                    result.metrics.execution_time,
                ),
                None => (
                    Outcome::Failed,
                    task.assigned_agent.clone(),
                    None,
                    Vec::new(),
                    Vec::new(),
                    None,
                    0,
                ),
            };
        Self {
            task_id: task.id,
            task_type: task.task_type,
            outcome,
            agent_id,
            feedback,
            issues,
            suggestions,
            recommendation,
            failure_reason: task.failure_reason,
            execution_time_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMetrics {
    pub risk_level: Option<RiskLevel>,
    pub total_issues: u32,
    pub execution_time_ms: u64,
    pub categories: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Consolidated outcome of a work unit's latest tasks.
#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    pub work_unit: WorkUnitKey,
    pub cycle: u32,
    pub summary: String,
    pub results: Vec<CategoryResult>,
    pub recommendations: Vec<String>,
    pub recommendation: Option<Recommendation>,
    pub metrics: ReportMetrics,
    pub labels: Vec<String>,
    pub all_required_passed: bool,
    pub auto_merge_eligible: bool,
    pub stale: bool,
    pub timed_out: bool,
    pub fingerprint: String,
}

impl FinalReport {
    /// Outcome and risk labels from earlier reports that this one replaces.
    pub fn superseded_labels(&self, applied: &BTreeSet<String>) -> Vec<String> {
        let mut stale: Vec<String> = self
            .results
            .iter()
            .flat_map(CategoryResult::other_labels)
            .filter(|l| applied.contains(l))
            .collect();
        if self.metrics.risk_level.is_some() {
            stale.extend(
                applied
                    .iter()
                    .filter(|l| l.starts_with("risk:") && !self.labels.contains(*l))
                    .cloned(),
            );
        }
        stale
    }
}

/// Tasks that feed a report: the latest judged task of each type.
fn reportable(unit: &WorkUnit) -> Vec<&AgentTask> {
    unit.latest_per_type()
        .into_iter()
        .filter(|t| t.failure_reason.is_none_or(|r| r.counts_as_failure()))
        .collect()
}

/// Stable digest of the task set a report covers.
pub fn fingerprint(tasks: &[&AgentTask]) -> String {
    let mut hasher = Sha256::new();
    for task in tasks {
        let result_status = task
            .result
            .as_ref()
            .map(|r| format!("{:?}", r.status))
            .unwrap_or_default();
        hasher.update(format!(
            "{}:{}:{}:{}\n",
            task.id,
            task.attempt(),
            task.status,
            result_status
        ));
    }
    hex::encode(hasher.finalize())
}

/// Strongest verdict among the results; absent if no agent gave one.
fn overall_recommendation(results: &[CategoryResult]) -> Option<Recommendation> {
    let verdicts: Vec<Recommendation> = results.iter().filter_map(|r| r.recommendation).collect();
    if verdicts.contains(&Recommendation::RequestChanges) {
        Some(Recommendation::RequestChanges)
    } else if verdicts.contains(&Recommendation::Comment) {
        Some(Recommendation::Comment)
    } else if verdicts.contains(&Recommendation::Approve) {
        Some(Recommendation::Approve)
    } else {
        None
    }
}

/// Report over `unit`, or `None` while tasks are outstanding or there is
/// nothing to report.
pub fn build(unit: &WorkUnit) -> Option<FinalReport> {
    if unit.has_active() {
        return None;
    }
    let tasks = reportable(unit);
    if tasks.is_empty() {
        return None;
    }

    let results: Vec<CategoryResult> = tasks.iter().map(|t| CategoryResult::from_task(t)).collect();
    let passed = results.iter().filter(|r| r.outcome == Outcome::Passed).count();
    let failed = results.iter().filter(|r| r.outcome == Outcome::Failed).count();
    let total_issues: u32 = tasks
        .iter()
        .filter_map(|t| t.result.as_ref())
        .map(|r| r.issue_count())
        .sum();
    let execution_time_ms = results.iter().map(|r| r.execution_time_ms).sum();
    let timed_out = tasks
        .iter()
        .any(|t| t.failure_reason == Some(FailureReason::AggregationTimeout));

    let pr = unit.pr_analysis();
    let risk_level = pr.map(|p| p.analysis.risk_level);

    let mut labels: Vec<String> = results.iter().map(CategoryResult::label).collect();
    if let Some(risk) = risk_level {
        labels.push(format!("risk:{}", risk.as_str()));
    }

    let mut recommendations: Vec<String> = results
        .iter()
        .flat_map(|r| r.suggestions.iter().cloned())
        .collect();
    for result in results.iter().filter(|r| r.outcome == Outcome::Failed) {
        let advice = match result.failure_reason {
            Some(FailureReason::CircuitOpen) | Some(FailureReason::Exhausted) => format!(
                "The {} agent is unavailable; the review will be retried automatically.",
                result.task_type.category()
            ),
            Some(FailureReason::AggregationTimeout) => format!(
                "The {} review timed out; comment `/status` to check progress or re-run it.",
                result.task_type.category()
            ),
            Some(FailureReason::Rejected) => format!(
                "The {} agent rejected the task; check the change for unsupported content.",
                result.task_type.category()
            ),
            _ => format!("Address the {} findings before merging.", result.task_type.category()),
        };
        recommendations.push(advice);
    }

    let all_required_passed = passed == results.len();
    let summary = format!(
        "{} of {} review categories passed, {} issue{} found{}",
        passed,
        results.len(),
        total_issues,
        if total_issues == 1 { "" } else { "s" },
        risk_level
            .map(|r| format!(", risk {}", r.as_str()))
            .unwrap_or_default(),
    );

    Some(FinalReport {
        work_unit: unit.key.clone(),
        cycle: unit.cycle,
        summary,
        recommendation: overall_recommendation(&results),
        metrics: ReportMetrics {
            risk_level,
            total_issues,
            execution_time_ms,
            categories: results.len(),
            passed,
            failed,
        },
        labels,
        all_required_passed,
        auto_merge_eligible: pr.is_some_and(|p| p.analysis.auto_merge_eligible),
        stale: pr.is_some_and(|p| p.analysis.stale),
        timed_out,
        fingerprint: fingerprint(&tasks),
        results,
        recommendations,
    })
}

/// Markdown body of the consolidated comment.
pub fn render(report: &FinalReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Automated review");
    let _ = writeln!(out);
    let _ = writeln!(out, "**{}**", report.summary);
    if report.timed_out {
        let _ = writeln!(out);
        let _ = writeln!(out, "_Some reviews did not finish in time._");
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "| Category | Result | Issues | Agent |");
    let _ = writeln!(out, "|---|---|---|---|");
    for result in &report.results {
        let status = match result.failure_reason {
            Some(reason) => format!("{} {}", result.outcome.icon(), reason.as_str()),
            None => format!("{} {:?}", result.outcome.icon(), result.outcome).to_lowercase(),
        };
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} |",
            result.task_type.category(),
            status,
            result.issues.len(),
            result.agent_id.as_deref().unwrap_or("-"),
        );
    }

    for result in report.results.iter().filter(|r| r.feedback.is_some() || !r.issues.is_empty()) {
        let _ = writeln!(out);
        let _ = writeln!(out, "### {}", result.task_type.category());
        if let Some(feedback) = &result.feedback {
            let _ = writeln!(out, "{}", feedback);
        }
        for issue in &result.issues {
            let location = match (&issue.file, issue.line) {
                (Some(file), Some(line)) => format!(" (`{}:{}`)", file, line),
                (Some(file), None) => format!(" (`{}`)", file),
                _ => String::new(),
            };
            let severity = issue
                .severity
                .as_deref()
                .map(|s| format!("**{}** ", s))
                .unwrap_or_default();
            let _ = writeln!(out, "- {}{}{}", severity, issue.message, location);
        }
    }

    if !report.recommendations.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "### Recommendations");
        for rec in &report.recommendations {
            let _ = writeln!(out, "- {}", rec);
        }
    }
    let _ = writeln!(out);
    let _ = write!(out, "<sub>report {}</sub>", &report.fingerprint[..12.min(report.fingerprint.len())]);
    out
}

/// Body of the `/status` reply.
pub fn render_status(unit: &WorkUnit) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Review status");
    let _ = writeln!(out);
    let latest = unit.latest_per_type();
    if latest.is_empty() {
        let _ = write!(out, "No review tasks yet.");
        return out;
    }
    let _ = writeln!(out, "| Category | Status | Agent | Attempt |");
    let _ = writeln!(out, "|---|---|---|---|");
    for task in latest {
        let status = match (task.status, task.failure_reason) {
            (TaskStatus::Failed, Some(reason)) => format!("failed ({})", reason.as_str()),
            (status, _) => status.to_string(),
        };
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} |",
            task.task_type.category(),
            status,
            task.assigned_agent.as_deref().unwrap_or("-"),
            task.attempt(),
        );
    }
    let _ = write!(out, "\nCycle {}", unit.cycle);
    out
}
