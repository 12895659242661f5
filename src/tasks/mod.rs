//! Task generation.
//!
//! Maps an analysis (or a comment command) to typed [`AgentTask`]s. The
//! mapping is pure; installing the tasks on a work unit, including
//! superseding outstanding tasks of the same type, is [`work_unit`]'s job.

pub mod work_unit;

use std::cmp::Reverse;

use crate::analyzer::{IssueAnalyzed, PrAnalyzed};
use crate::errors::TaskError;
use crate::models::{AgentTask, Complexity, Priority, Severity, TaskPayload, TaskType, WorkUnitKey};

pub use work_unit::{ReportLedger, ReportStep, TaskCounts, TaskSummary, WorkUnit, WorkUnitStore};

/// Critical first, then the fixed type order.
pub fn sort_tasks(tasks: &mut [AgentTask]) {
    tasks.sort_by_key(|t| (Reverse(t.priority), t.task_type));
}

fn complexity_priority(complexity: Complexity) -> Priority {
    match complexity {
        Complexity::Low => Priority::Low,
        Complexity::Medium => Priority::Medium,
        Complexity::High => Priority::High,
    }
}

/// Priority of a PR task of `task_type`.
pub fn pr_priority(pr: &PrAnalyzed, task_type: TaskType) -> Priority {
    let critical = pr
        .analysis
        .security_concerns
        .iter()
        .any(|c| c.severity == Severity::Critical);
    if task_type == TaskType::SecurityReview && critical {
        Priority::Critical
    } else {
        complexity_priority(pr.analysis.complexity)
    }
}

fn estimate(task_type: TaskType, complexity: Complexity) -> u32 {
    let base = match task_type {
        TaskType::SecurityReview => 20,
        TaskType::CodeReview => 15,
        TaskType::Testing => 10,
        TaskType::Documentation => 5,
        TaskType::Performance => 15,
        TaskType::Deployment => 10,
    };
    match complexity {
        Complexity::Low => base,
        Complexity::Medium => base * 2,
        Complexity::High => base * 4,
    }
}

/// Payload for a PR task of `task_type`, drawn from the analysis lists.
pub fn pr_payload(pr: &PrAnalyzed, task_type: TaskType) -> TaskPayload {
    let analysis = &pr.analysis;
    let changed: Vec<String> = pr.context.files.iter().map(|f| f.path.clone()).collect();
    let or_changed = |list: &Vec<String>| {
        if list.is_empty() {
            changed.clone()
        } else {
            list.clone()
        }
    };
    match task_type {
        TaskType::SecurityReview => TaskPayload::SecurityReview {
            files: changed.clone(),
            concerns: analysis.security_concerns.clone(),
        },
        TaskType::CodeReview => TaskPayload::CodeReview {
            files: or_changed(&analysis.source_files),
            languages: analysis.languages.clone(),
            complexity: analysis.complexity,
            instructions: None,
        },
        TaskType::Testing => TaskPayload::Testing {
            test_files: analysis.test_files.clone(),
            changed_files: or_changed(&analysis.source_files),
        },
        TaskType::Documentation => TaskPayload::Documentation {
            doc_files: analysis.documentation_files.clone(),
            changed_files: changed.clone(),
        },
        TaskType::Performance => TaskPayload::Performance {
            paths: or_changed(&analysis.performance_paths),
        },
        TaskType::Deployment => TaskPayload::Deployment {
            base_branch: pr.context.base_branch.clone(),
            head_sha: pr.context.head_sha.clone(),
        },
    }
}

/// Payload for a task with no snapshot to draw from.
pub fn bare_payload(task_type: TaskType, instructions: Option<String>) -> Option<TaskPayload> {
    let payload = match task_type {
        TaskType::SecurityReview => TaskPayload::SecurityReview {
            files: Vec::new(),
            concerns: Vec::new(),
        },
        TaskType::CodeReview => TaskPayload::CodeReview {
            files: Vec::new(),
            languages: Vec::new(),
            complexity: Complexity::Medium,
            instructions,
        },
        TaskType::Testing => TaskPayload::Testing {
            test_files: Vec::new(),
            changed_files: Vec::new(),
        },
        TaskType::Documentation => TaskPayload::Documentation {
            doc_files: Vec::new(),
            changed_files: Vec::new(),
        },
        TaskType::Performance => TaskPayload::Performance { paths: Vec::new() },
        // needs a branch and head commit
        TaskType::Deployment => return None,
    };
    Some(payload)
}

/// Tasks for every category the PR analysis requires.
pub fn plan_pr(key: &WorkUnitKey, cycle: u32, pr: &PrAnalyzed) -> Result<Vec<AgentTask>, TaskError> {
    let mut tasks = pr
        .analysis
        .required()
        .into_iter()
        .map(|task_type| {
            AgentTask::new(
                task_type,
                pr_priority(pr, task_type),
                key.clone(),
                cycle,
                pr_payload(pr, task_type),
            )
            .map(|t| t.with_estimate(estimate(task_type, pr.analysis.complexity)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    sort_tasks(&mut tasks);
    Ok(tasks)
}

/// Tasks the issue triage calls for.
pub fn plan_issue(
    key: &WorkUnitKey,
    cycle: u32,
    issue: &IssueAnalyzed,
) -> Result<Vec<AgentTask>, TaskError> {
    let instructions = format!(
        "Investigate issue #{}: {}",
        issue.context.number, issue.context.title
    );
    let mut tasks = Vec::new();
    for task_type in &issue.analysis.task_types {
        let Some(payload) = bare_payload(*task_type, Some(instructions.clone())) else {
            continue;
        };
        tasks.push(
            AgentTask::new(
                *task_type,
                issue.analysis.priority,
                key.clone(),
                cycle,
                payload,
            )?
            .with_estimate(issue.analysis.estimated_minutes),
        );
    }
    sort_tasks(&mut tasks);
    Ok(tasks)
}

/// One task of `task_type` for a comment command, using the last PR
/// snapshot when there is one.
pub fn command_task(
    key: &WorkUnitKey,
    cycle: u32,
    task_type: TaskType,
    pr: Option<&PrAnalyzed>,
    instructions: Option<String>,
) -> Result<AgentTask, TaskError> {
    let (payload, priority) = match pr {
        Some(pr) => {
            let mut payload = pr_payload(pr, task_type);
            if let TaskPayload::CodeReview {
                instructions: slot, ..
            } = &mut payload
            {
                *slot = instructions;
            }
            (payload, pr_priority(pr, task_type))
        }
        None => {
            let payload = bare_payload(task_type, instructions).ok_or_else(|| {
                TaskError::InvalidPayload(format!("{} needs a pull request snapshot", task_type))
            })?;
            (payload, Priority::Medium)
        }
    };
    // explicit requests jump ahead of routine work
    AgentTask::new(task_type, priority.max(Priority::High), key.clone(), cycle, payload)
}
