//! Slash commands embedded in comment text.
//!
//! A command is a line whose first non-space character is `/`, followed by
//! a `[a-z][a-z-]*` token (ASCII case-insensitive) and optional
//! whitespace-separated arguments. The first recognized command wins; lines
//! inside fenced code blocks never count.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{EntityKind, TaskType};

static COMMAND_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*/([A-Za-z][A-Za-z-]*)(?:\s+(.*))?$").expect("command regex is valid")
});

/// A recognized comment command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    // pull requests
    RerunTests,
    SecurityReview,
    PerformanceCheck,
    FullReview,
    // issues
    Retriage,
    Reestimate,
    AssignAgent { task_type: TaskType },
    GenerateCode,
    GenerateDocs,
    LinkPr { number: u64 },
    MarkDuplicate { number: u64 },
    CreatePr,
    // both
    Status,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RerunTests => "rerun-tests",
            Self::SecurityReview => "security-review",
            Self::PerformanceCheck => "performance-check",
            Self::FullReview => "full-review",
            Self::Retriage => "retriage",
            Self::Reestimate => "reestimate",
            Self::AssignAgent { .. } => "assign-agent",
            Self::GenerateCode => "generate-code",
            Self::GenerateDocs => "generate-docs",
            Self::LinkPr { .. } => "link-pr",
            Self::MarkDuplicate { .. } => "mark-duplicate",
            Self::CreatePr => "create-pr",
            Self::Status => "status",
        }
    }

    /// The task type a command maps to directly, without re-analysis.
    pub fn direct_task(&self) -> Option<TaskType> {
        match self {
            Self::RerunTests => Some(TaskType::Testing),
            Self::SecurityReview => Some(TaskType::SecurityReview),
            Self::PerformanceCheck => Some(TaskType::Performance),
            Self::AssignAgent { task_type } => Some(*task_type),
            Self::GenerateCode | Self::CreatePr => Some(TaskType::CodeReview),
            Self::GenerateDocs => Some(TaskType::Documentation),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.name())?;
        match self {
            Self::AssignAgent { task_type } => write!(f, " {}", task_type),
            Self::LinkPr { number } | Self::MarkDuplicate { number } => write!(f, " {}", number),
            _ => Ok(()),
        }
    }
}

fn parse_number(arg: Option<&str>) -> Option<u64> {
    arg?.trim_start_matches('#').parse().ok()
}

fn recognize(kind: EntityKind, token: &str, args: &[&str]) -> Option<Command> {
    let first = args.first().copied();
    let command = match (kind, token) {
        (_, "status") => Command::Status,
        (EntityKind::PullRequest, "rerun-tests") => Command::RerunTests,
        (EntityKind::PullRequest, "security-review") => Command::SecurityReview,
        (EntityKind::PullRequest, "performance-check") => Command::PerformanceCheck,
        (EntityKind::PullRequest, "full-review") => Command::FullReview,
        (EntityKind::Issue, "retriage") => Command::Retriage,
        (EntityKind::Issue, "reestimate") => Command::Reestimate,
        (EntityKind::Issue, "assign-agent") => Command::AssignAgent {
            task_type: first?.parse().ok()?,
        },
        (EntityKind::Issue, "generate-code") => Command::GenerateCode,
        (EntityKind::Issue, "generate-docs") => Command::GenerateDocs,
        (EntityKind::Issue, "link-pr") => Command::LinkPr {
            number: parse_number(first)?,
        },
        (EntityKind::Issue, "mark-duplicate") => Command::MarkDuplicate {
            number: parse_number(first)?,
        },
        (EntityKind::Issue, "create-pr") => Command::CreatePr,
        _ => return None,
    };
    Some(command)
}

/// First recognized command in `text` for an entity of `kind`.
pub fn parse(text: &str, kind: EntityKind) -> Option<Command> {
    let mut in_fence = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let Some(caps) = COMMAND_LINE.captures(line) else {
            continue;
        };
        let token = caps[1].to_ascii_lowercase();
        let args: Vec<&str> = caps
            .get(2)
            .map(|m| m.as_str().split_whitespace().collect())
            .unwrap_or_default();
        match recognize(kind, &token, &args) {
            Some(command) => return Some(command),
            None => debug!(command = %token, kind = %kind, "ignoring unrecognized command"),
        }
    }
    None
}
