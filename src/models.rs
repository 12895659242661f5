use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::errors::TaskError;

// ── Work units ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    PullRequest,
    Issue,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PullRequest => "pull_request",
            Self::Issue => "issue",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a WorkUnit: one pull request or issue in one repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WorkUnitKey {
    pub repository: String,
    pub kind: EntityKind,
    pub number: u64,
}

impl WorkUnitKey {
    pub fn pull_request(repository: impl Into<String>, number: u64) -> Self {
        Self {
            repository: repository.into(),
            kind: EntityKind::PullRequest,
            number,
        }
    }

    pub fn issue(repository: impl Into<String>, number: u64) -> Self {
        Self {
            repository: repository.into(),
            kind: EntityKind::Issue,
            number,
        }
    }
}

impl fmt::Display for WorkUnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.repository, self.number, self.kind)
    }
}

// ── Task classification ─────────────────────────────────────────────

/// Review category a task belongs to. Declaration order is the fixed
/// tie-break order used when sorting generated tasks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SecurityReview,
    CodeReview,
    Testing,
    Documentation,
    Performance,
    Deployment,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        Self::SecurityReview,
        Self::CodeReview,
        Self::Testing,
        Self::Documentation,
        Self::Performance,
        Self::Deployment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecurityReview => "security_review",
            Self::CodeReview => "code_review",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
            Self::Performance => "performance",
            Self::Deployment => "deployment",
        }
    }

    /// Short category name used in labels (`security-reviewed`).
    pub fn category(&self) -> &'static str {
        match self {
            Self::SecurityReview => "security",
            Self::CodeReview => "code-review",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
            Self::Performance => "performance",
            Self::Deployment => "deployment",
        }
    }

    /// Infix of the `AGENT_<TYPE>_URL` environment keys.
    pub fn env_key(&self) -> &'static str {
        match self {
            Self::SecurityReview => "SECURITY",
            Self::CodeReview => "CODE_REVIEW",
            Self::Testing => "TESTING",
            Self::Documentation => "DOCUMENTATION",
            Self::Performance => "PERFORMANCE",
            Self::Deployment => "DEPLOYMENT",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    /// Accepts the snake_case name, its kebab-case form, or the short category.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "security_review" | "security" => Ok(Self::SecurityReview),
            "code_review" | "code" => Ok(Self::CodeReview),
            "testing" | "tests" => Ok(Self::Testing),
            "documentation" | "docs" => Ok(Self::Documentation),
            "performance" | "perf" => Ok(Self::Performance),
            "deployment" | "deploy" => Ok(Self::Deployment),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Forward-only transitions. Re-entering `Pending` goes through
    /// [`AgentTask::retry`] instead.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Failed)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Superseded,
    CircuitOpen,
    Exhausted,
    Rejected,
    AggregationTimeout,
    WorkUnitClosed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Superseded => "superseded",
            Self::CircuitOpen => "circuit_open",
            Self::Exhausted => "exhausted",
            Self::Rejected => "rejected",
            Self::AggregationTimeout => "aggregation_timeout",
            Self::WorkUnitClosed => "work_unit_closed",
        }
    }

    /// Superseded and closed-unit tasks were never judged; they are not failures.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, Self::Superseded | Self::WorkUnitClosed)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Analysis vocabulary shared with payloads ────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityConcern {
    pub kind: String,
    pub file: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[default]
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ── Task payloads ───────────────────────────────────────────────────

/// Per-type task context sent to the agent. Exactly one shape per
/// [`TaskType`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    SecurityReview {
        files: Vec<String>,
        concerns: Vec<SecurityConcern>,
    },
    CodeReview {
        files: Vec<String>,
        languages: Vec<String>,
        complexity: Complexity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instructions: Option<String>,
    },
    Testing {
        test_files: Vec<String>,
        changed_files: Vec<String>,
    },
    Documentation {
        doc_files: Vec<String>,
        changed_files: Vec<String>,
    },
    Performance {
        paths: Vec<String>,
    },
    Deployment {
        base_branch: String,
        head_sha: String,
    },
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::SecurityReview { .. } => TaskType::SecurityReview,
            Self::CodeReview { .. } => TaskType::CodeReview,
            Self::Testing { .. } => TaskType::Testing,
            Self::Documentation { .. } => TaskType::Documentation,
            Self::Performance { .. } => TaskType::Performance,
            Self::Deployment { .. } => TaskType::Deployment,
        }
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        let paths: Vec<&String> = match self {
            Self::SecurityReview { files, concerns } => {
                if let Some(c) = concerns.iter().find(|c| c.file.trim().is_empty()) {
                    return Err(TaskError::InvalidPayload(format!(
                        "security concern {} has no file",
                        c.kind
                    )));
                }
                files.iter().collect()
            }
            Self::CodeReview {
                files,
                instructions,
                ..
            } => {
                if instructions.as_deref().is_some_and(|i| i.trim().is_empty()) {
                    return Err(TaskError::InvalidPayload(
                        "code review instructions are empty".into(),
                    ));
                }
                files.iter().collect()
            }
            Self::Testing {
                test_files,
                changed_files,
            } => test_files.iter().chain(changed_files).collect(),
            Self::Documentation {
                doc_files,
                changed_files,
            } => doc_files.iter().chain(changed_files).collect(),
            Self::Performance { paths } => paths.iter().collect(),
            Self::Deployment {
                base_branch,
                head_sha,
            } => {
                if base_branch.trim().is_empty() || head_sha.trim().is_empty() {
                    return Err(TaskError::InvalidPayload(
                        "deployment needs a base branch and head sha".into(),
                    ));
                }
                Vec::new()
            }
        };
        if paths.iter().any(|p| p.trim().is_empty()) {
            return Err(TaskError::InvalidPayload("empty file path".into()));
        }
        Ok(())
    }
}

// ── Tasks ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub agent: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
}

impl AttemptRecord {
    fn new(attempt: u32) -> Self {
        Self {
            attempt,
            agent: None,
            started_at: None,
            ended_at: None,
            failure_reason: None,
        }
    }
}

/// One unit of delegated work of a single review category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTask {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: Priority,
    pub work_unit: WorkUnitKey,
    /// Review cycle of the work unit that generated this task.
    pub cycle: u32,
    pub assigned_agent: Option<String>,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub estimated_minutes: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_reason: Option<FailureReason>,
    pub attempts: Vec<AttemptRecord>,
    pub result: Option<TaskResult>,
}

impl AgentTask {
    pub fn new(
        task_type: TaskType,
        priority: Priority,
        work_unit: WorkUnitKey,
        cycle: u32,
        payload: TaskPayload,
    ) -> Result<Self, TaskError> {
        if payload.task_type() != task_type {
            return Err(TaskError::PayloadMismatch {
                expected: task_type,
                found: payload.task_type(),
            });
        }
        payload.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            task_type,
            priority,
            work_unit,
            cycle,
            assigned_agent: None,
            status: TaskStatus::Pending,
            payload,
            created_at: now,
            updated_at: now,
            estimated_minutes: None,
            start_time: None,
            end_time: None,
            failure_reason: None,
            attempts: vec![AttemptRecord::new(1)],
            result: None,
        })
    }

    pub fn with_estimate(mut self, minutes: u32) -> Self {
        self.estimated_minutes = Some(minutes);
        self
    }

    /// Pending or in progress.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn attempt(&self) -> u32 {
        self.attempts.len() as u32
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn current_attempt(&mut self) -> Option<&mut AttemptRecord> {
        self.attempts.last_mut()
    }

    pub fn start(&mut self, agent_id: &str) -> Result<(), TaskError> {
        self.transition(TaskStatus::InProgress)?;
        let now = self.updated_at;
        self.assigned_agent = Some(agent_id.to_string());
        self.start_time = Some(now);
        if let Some(record) = self.current_attempt() {
            record.agent = Some(agent_id.to_string());
            record.started_at = Some(now);
        }
        Ok(())
    }

    pub fn complete(&mut self, result: TaskResult) -> Result<(), TaskError> {
        self.transition(TaskStatus::Completed)?;
        let now = self.updated_at;
        self.end_time = Some(now);
        if let Some(record) = self.current_attempt() {
            record.ended_at = Some(now);
        }
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, reason: FailureReason) -> Result<(), TaskError> {
        self.transition(TaskStatus::Failed)?;
        let now = self.updated_at;
        self.end_time = Some(now);
        self.failure_reason = Some(reason);
        if let Some(record) = self.current_attempt() {
            record.ended_at = Some(now);
            record.failure_reason = Some(reason);
        }
        Ok(())
    }

    /// Return a failed task to `Pending` for another attempt, keeping its id.
    pub fn retry(&mut self) -> Result<(), TaskError> {
        if self.status != TaskStatus::Failed {
            return Err(TaskError::InvalidTransition {
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        let next = self.attempt() + 1;
        self.attempts.push(AttemptRecord::new(next));
        self.status = TaskStatus::Pending;
        self.failure_reason = None;
        self.assigned_agent = None;
        self.start_time = None;
        self.end_time = None;
        self.updated_at = Utc::now();
        Ok(())
    }
}

// ── Results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    Partial,
}

/// An agent's verdict on the reviewed change. Matched exactly against
/// `approve`, `request_changes` and `comment`; anything else is absent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Approve,
    RequestChanges,
    Comment,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::RequestChanges => "request_changes",
            Self::Comment => "comment",
        }
    }

    /// Exact match only; no case folding.
    pub fn parse_exact(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "request_changes" => Some(Self::RequestChanges),
            "comment" => Some(Self::Comment),
            _ => None,
        }
    }

    /// Event name of the platform's structured review endpoint.
    pub fn review_event(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::RequestChanges => "REQUEST_CHANGES",
            Self::Comment => "COMMENT",
        }
    }
}

fn deserialize_recommendation<'de, D>(deserializer: D) -> Result<Option<Recommendation>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(Recommendation::parse_exact))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewIssue {
    pub message: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetrics {
    pub execution_time: u64,
    #[serde(default)]
    pub lines_reviewed: Option<u64>,
    #[serde(default)]
    pub issues_found: Option<u32>,
}

/// What an agent reports back for one task attempt. Field names follow
/// the agent wire contract (camelCase).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: Uuid,
    pub agent_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default, deserialize_with = "deserialize_recommendation")]
    pub recommendation: Option<Recommendation>,
    #[serde(default)]
    pub metrics: ResultMetrics,
}

impl TaskResult {
    pub fn issue_count(&self) -> u32 {
        self.metrics
            .issues_found
            .unwrap_or(self.issues.len() as u32)
    }
}

// ── Agents ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Busy => "busy",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    pub last_check: Option<DateTime<Utc>>,
    pub status: HealthStatus,
    pub response_time_ms: Option<u64>,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            last_check: None,
            status: HealthStatus::Unknown,
            response_time_ms: None,
        }
    }
}

/// A remote worker agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: TaskType,
    pub endpoint: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    pub current_tasks: usize,
    pub max_tasks: usize,
    pub health_check: HealthCheck,
}

impl Agent {
    pub fn new(id: impl Into<String>, agent_type: TaskType, endpoint: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            agent_type,
            endpoint: endpoint.into(),
            capabilities: vec![agent_type.as_str().to_string()],
            status: AgentStatus::Online,
            current_tasks: 0,
            max_tasks: 1,
            health_check: HealthCheck::default(),
        }
    }

    pub fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks.max(1);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn load(&self) -> f64 {
        self.current_tasks as f64 / self.max_tasks.max(1) as f64
    }
}

// ── Platform snapshots ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangedFile {
    pub path: String,
    pub additions: u64,
    pub deletions: u64,
    pub status: String,
}

/// Read-only snapshot of a pull request at analysis time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrContext {
    pub repository: String,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub author: String,
    pub base_branch: String,
    pub head_branch: String,
    pub head_sha: String,
    pub files: Vec<ChangedFile>,
    pub additions: u64,
    pub deletions: u64,
    pub labels: Vec<String>,
    pub draft: bool,
    pub open: bool,
    pub merged: bool,
    pub updated_at: DateTime<Utc>,
    pub snapshot_at: DateTime<Utc>,
}

impl PrContext {
    pub fn diff_size(&self) -> u64 {
        self.additions + self.deletions
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// Read-only snapshot of an issue at analysis time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IssueContext {
    pub repository: String,
    pub number: u64,
    pub title: String,
    pub body: String,
    pub author: String,
    pub labels: Vec<String>,
    pub open: bool,
    pub comments: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub snapshot_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Squash,
    Rebase,
    Merge,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Squash => "squash",
            Self::Rebase => "rebase",
            Self::Merge => "merge",
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "squash" => Ok(Self::Squash),
            "rebase" => Ok(Self::Rebase),
            "merge" => Ok(Self::Merge),
            _ => Err(format!("Invalid merge strategy: {}", s)),
        }
    }
}
