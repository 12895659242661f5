//! In-memory doubles for the platform and agent boundaries.
//!
//! Used by unit tests, the integration suite, and anyone exercising the
//! engine without network access.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::delegator::client::{AgentClient, AgentRequest};
use crate::errors::{AgentCallError, PlatformError};
use crate::models::{
    Agent, ChangedFile, IssueContext, MergeStrategy, PrContext, Recommendation, ResultMetrics,
    ResultStatus, ReviewIssue, TaskResult, WorkUnitKey,
};
use crate::platform::{PlatformClient, ReviewCommenter};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Fixtures ────────────────────────────────────────────────────────

/// An open, ready pull request touching one source file.
pub fn pr_context(repository: &str, number: u64) -> PrContext {
    let now = Utc::now();
    PrContext {
        repository: repository.to_string(),
        number,
        title: format!("Change #{}", number),
        body: String::new(),
        author: "octocat".into(),
        base_branch: "main".into(),
        head_branch: format!("feature/{}", number),
        head_sha: format!("{:040x}", number),
        files: vec![ChangedFile {
            path: "src/lib.rs".into(),
            additions: 10,
            deletions: 2,
            status: "modified".into(),
        }],
        additions: 10,
        deletions: 2,
        labels: Vec::new(),
        draft: false,
        open: true,
        merged: false,
        updated_at: now,
        snapshot_at: now,
    }
}

pub fn issue_context(repository: &str, number: u64) -> IssueContext {
    let now = Utc::now();
    IssueContext {
        repository: repository.to_string(),
        number,
        title: format!("Issue #{}", number),
        body: String::new(),
        author: "octocat".into(),
        labels: Vec::new(),
        open: true,
        comments: 0,
        created_at: now,
        updated_at: now,
        snapshot_at: now,
    }
}

// ── Platform ────────────────────────────────────────────────────────

#[derive(Default)]
struct PlatformState {
    pulls: HashMap<(String, u64), PrContext>,
    issues: HashMap<(String, u64), IssueContext>,
    label_requests: HashMap<WorkUnitKey, Vec<String>>,
    label_removals: HashMap<WorkUnitKey, Vec<String>>,
    current_labels: HashMap<WorkUnitKey, Vec<String>>,
    comments: HashMap<WorkUnitKey, Vec<String>>,
    reviews: Vec<(WorkUnitKey, Recommendation, String)>,
    merge_attempts: Vec<MergeStrategy>,
    merged: HashSet<(String, u64)>,
    close_calls: HashMap<WorkUnitKey, usize>,
    failures: HashMap<&'static str, VecDeque<PlatformError>>,
    failing_strategies: HashSet<MergeStrategy>,
    fetches: HashMap<&'static str, usize>,
}

/// Platform double recording every side effect.
pub struct FakePlatform {
    state: Mutex<PlatformState>,
    reviews_enabled: bool,
    fetch_delay: Duration,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlatformState::default()),
            reviews_enabled: true,
            fetch_delay: Duration::ZERO,
        }
    }

    /// Drop the structured review capability.
    pub fn without_reviews(mut self) -> Self {
        self.reviews_enabled = false;
        self
    }

    /// Make every fetch take `delay`.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn insert_pull_request(&self, pr: PrContext) {
        lock(&self.state)
            .pulls
            .insert((pr.repository.clone(), pr.number), pr);
    }

    pub fn insert_issue(&self, issue: IssueContext) {
        lock(&self.state)
            .issues
            .insert((issue.repository.clone(), issue.number), issue);
    }

    /// Queue errors returned by the next calls of `operation`.
    pub fn fail_next(&self, operation: &'static str, errors: Vec<PlatformError>) {
        lock(&self.state)
            .failures
            .entry(operation)
            .or_default()
            .extend(errors);
    }

    pub fn fail_merges(&self, strategies: &[MergeStrategy]) {
        lock(&self.state)
            .failing_strategies
            .extend(strategies.iter().copied());
    }

    pub fn label_requests(&self, key: &WorkUnitKey) -> Vec<String> {
        lock(&self.state)
            .label_requests
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn label_removals(&self, key: &WorkUnitKey) -> Vec<String> {
        lock(&self.state)
            .label_removals
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Labels currently on the entity.
    pub fn labels(&self, key: &WorkUnitKey) -> Vec<String> {
        lock(&self.state)
            .current_labels
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn comments(&self, key: &WorkUnitKey) -> Vec<String> {
        lock(&self.state)
            .comments
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn reviews(&self) -> Vec<(WorkUnitKey, Recommendation, String)> {
        lock(&self.state).reviews.clone()
    }

    pub fn merge_attempts(&self) -> Vec<MergeStrategy> {
        lock(&self.state).merge_attempts.clone()
    }

    pub fn is_merged(&self, repository: &str, number: u64) -> bool {
        lock(&self.state)
            .merged
            .contains(&(repository.to_string(), number))
    }

    pub fn close_calls(&self, key: &WorkUnitKey) -> usize {
        lock(&self.state).close_calls.get(key).copied().unwrap_or(0)
    }

    pub fn fetches(&self, operation: &str) -> usize {
        lock(&self.state).fetches.get(operation).copied().unwrap_or(0)
    }

    fn take_failure(&self, operation: &'static str) -> Result<(), PlatformError> {
        let mut state = lock(&self.state);
        match state.failures.get_mut(operation).and_then(|q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn count_fetch(&self, operation: &'static str) {
        *lock(&self.state).fetches.entry(operation).or_insert(0) += 1;
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn pull_request(
        &self,
        repository: &str,
        number: u64,
    ) -> Result<PrContext, PlatformError> {
        self.count_fetch("pull_request").await;
        self.take_failure("pull_request")?;
        lock(&self.state)
            .pulls
            .get(&(repository.to_string(), number))
            .cloned()
            .map(|mut pr| {
                pr.snapshot_at = Utc::now();
                pr
            })
            .ok_or_else(|| PlatformError::NotFound(format!("{}#{}", repository, number)))
    }

    async fn issue(&self, repository: &str, number: u64) -> Result<IssueContext, PlatformError> {
        self.count_fetch("issue").await;
        self.take_failure("issue")?;
        lock(&self.state)
            .issues
            .get(&(repository.to_string(), number))
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("{}#{}", repository, number)))
    }

    async fn add_labels(&self, key: &WorkUnitKey, labels: &[String]) -> Result<(), PlatformError> {
        self.take_failure("add_labels")?;
        let mut state = lock(&self.state);
        state
            .label_requests
            .entry(key.clone())
            .or_default()
            .extend(labels.iter().cloned());
        let current = state.current_labels.entry(key.clone()).or_default();
        for label in labels {
            if !current.contains(label) {
                current.push(label.clone());
            }
        }
        Ok(())
    }

    async fn remove_label(&self, key: &WorkUnitKey, label: &str) -> Result<(), PlatformError> {
        self.take_failure("remove_label")?;
        let mut state = lock(&self.state);
        state
            .label_removals
            .entry(key.clone())
            .or_default()
            .push(label.to_string());
        if let Some(current) = state.current_labels.get_mut(key) {
            current.retain(|l| l != label);
        }
        Ok(())
    }

    async fn post_comment(&self, key: &WorkUnitKey, body: &str) -> Result<(), PlatformError> {
        self.take_failure("post_comment")?;
        lock(&self.state)
            .comments
            .entry(key.clone())
            .or_default()
            .push(body.to_string());
        Ok(())
    }

    async fn merge(
        &self,
        repository: &str,
        number: u64,
        strategy: MergeStrategy,
    ) -> Result<(), PlatformError> {
        self.take_failure("merge")?;
        let mut state = lock(&self.state);
        state.merge_attempts.push(strategy);
        if state.failing_strategies.contains(&strategy) {
            return Err(PlatformError::Client {
                status: 405,
                message: format!("{} merges are not allowed", strategy.as_str()),
            });
        }
        state.merged.insert((repository.to_string(), number));
        Ok(())
    }

    async fn close(&self, key: &WorkUnitKey) -> Result<(), PlatformError> {
        self.take_failure("close")?;
        *lock(&self.state)
            .close_calls
            .entry(key.clone())
            .or_insert(0) += 1;
        Ok(())
    }

    fn review_commenter(&self) -> Option<&dyn ReviewCommenter> {
        if self.reviews_enabled { Some(self) } else { None }
    }
}

#[async_trait]
impl ReviewCommenter for FakePlatform {
    async fn post_review(
        &self,
        repository: &str,
        number: u64,
        recommendation: Recommendation,
        body: &str,
    ) -> Result<(), PlatformError> {
        self.take_failure("post_review")?;
        lock(&self.state).reviews.push((
            WorkUnitKey::pull_request(repository, number),
            recommendation,
            body.to_string(),
        ));
        Ok(())
    }
}

// ── Agents ──────────────────────────────────────────────────────────

/// What the scripted agent does with the next request.
#[derive(Debug, Clone)]
pub enum AgentReply {
    Success,
    Respond {
        status: ResultStatus,
        recommendation: Option<Recommendation>,
        issues: u32,
    },
    ServerError(u16),
    ClientError(u16),
    Malformed,
    /// Wait, then succeed.
    Delay(Duration),
    /// Wait, then answer with the inner reply.
    DelayThen(Duration, Box<AgentReply>),
}

struct AgentScriptState {
    scripts: HashMap<String, VecDeque<AgentReply>>,
    default: AgentReply,
    calls: HashMap<String, usize>,
    unhealthy: HashSet<String>,
    requests: Vec<AgentRequest>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Agent double answering from per-agent scripts.
pub struct ScriptedAgentClient {
    state: Arc<Mutex<AgentScriptState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for ScriptedAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight {
    agent: String,
    state: Arc<Mutex<AgentScriptState>>,
    total: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.total.fetch_sub(1, Ordering::SeqCst);
        if let Some(n) = lock(&self.state).in_flight.get_mut(&self.agent) {
            *n = n.saturating_sub(1);
        }
    }
}

impl ScriptedAgentClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AgentScriptState {
                scripts: HashMap::new(),
                default: AgentReply::Success,
                calls: HashMap::new(),
                unhealthy: HashSet::new(),
                requests: Vec::new(),
                in_flight: HashMap::new(),
                max_in_flight: HashMap::new(),
            })),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn script(&self, agent_id: &str, replies: Vec<AgentReply>) {
        lock(&self.state)
            .scripts
            .entry(agent_id.to_string())
            .or_default()
            .extend(replies);
    }

    /// Reply used once an agent's script runs out.
    pub fn set_default(&self, reply: AgentReply) {
        lock(&self.state).default = reply;
    }

    pub fn set_healthy(&self, agent_id: &str, healthy: bool) {
        let mut state = lock(&self.state);
        if healthy {
            state.unhealthy.remove(agent_id);
        } else {
            state.unhealthy.insert(agent_id.to_string());
        }
    }

    pub fn calls(&self, agent_id: &str) -> usize {
        lock(&self.state).calls.get(agent_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.state).calls.values().sum()
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight_for(&self, agent_id: &str) -> usize {
        lock(&self.state)
            .max_in_flight
            .get(agent_id)
            .copied()
            .unwrap_or(0)
    }

    fn begin(&self, agent: &Agent, request: &AgentRequest) -> (AgentReply, InFlight) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut state = lock(&self.state);
        *state.calls.entry(agent.id.clone()).or_insert(0) += 1;
        state.requests.push(request.clone());
        let current = {
            let n = state.in_flight.entry(agent.id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let peak = state.max_in_flight.entry(agent.id.clone()).or_insert(0);
        *peak = (*peak).max(current);

        let default = state.default.clone();
        let reply = state
            .scripts
            .get_mut(&agent.id)
            .and_then(|q| q.pop_front())
            .unwrap_or(default);
        (
            reply,
            InFlight {
                agent: agent.id.clone(),
                state: Arc::clone(&self.state),
                total: Arc::clone(&self.in_flight),
            },
        )
    }
}

fn result_for(
    agent: &Agent,
    request: &AgentRequest,
    status: ResultStatus,
    recommendation: Option<Recommendation>,
    issues: u32,
) -> TaskResult {
    TaskResult {
        task_id: request.id,
        agent_id: agent.id.clone(),
        status,
        result: serde_json::json!({ "reviewed": true }),
        feedback: Some(format!("{} review finished", request.task_type.category())),
        suggestions: Vec::new(),
        issues: (0..issues)
            .map(|i| ReviewIssue {
                message: format!("finding {}", i + 1),
                severity: Some("medium".into()),
                file: None,
                line: None,
            })
            .collect(),
        recommendation,
        metrics: ResultMetrics {
            execution_time: 25,
            lines_reviewed: Some(100),
            issues_found: Some(issues),
        },
    }
}

#[async_trait]
impl AgentClient for ScriptedAgentClient {
    async fn execute(
        &self,
        agent: &Agent,
        request: &AgentRequest,
    ) -> Result<TaskResult, AgentCallError> {
        let (mut reply, _guard) = self.begin(agent, request);
        while let AgentReply::DelayThen(delay, next) = reply {
            tokio::time::sleep(delay).await;
            reply = *next;
        }
        match reply {
            AgentReply::Success => Ok(result_for(agent, request, ResultStatus::Success, None, 0)),
            AgentReply::Respond {
                status,
                recommendation,
                issues,
            } => Ok(result_for(agent, request, status, recommendation, issues)),
            AgentReply::ServerError(status) => Err(AgentCallError::Server {
                status,
                body: "internal error".into(),
            }),
            AgentReply::ClientError(status) => Err(AgentCallError::Client {
                status,
                body: "invalid task".into(),
            }),
            AgentReply::Malformed => Err(AgentCallError::MalformedResponse(
                "expected value at line 1 column 1".into(),
            )),
            AgentReply::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(result_for(agent, request, ResultStatus::Success, None, 0))
            }
            AgentReply::DelayThen(..) => unreachable!("unwrapped above"),
        }
    }

    async fn health(&self, agent: &Agent) -> Result<(), AgentCallError> {
        if lock(&self.state).unhealthy.contains(&agent.id) {
            Err(AgentCallError::Server {
                status: 503,
                body: "unavailable".into(),
            })
        } else {
            Ok(())
        }
    }
}
