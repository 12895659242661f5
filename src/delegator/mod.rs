//! Task delegation to worker agents.
//!
//! The delegator sends one task to one agent with failure-tolerant delivery:
//! - selects the least-loaded agent for the task type from the registry
//! - fails fast while the agent's circuit is open
//! - waits for a per-agent slot and a global slot (local queueing)
//! - bounds every attempt by the task timeout
//! - retries server-class failures with capped exponential backoff
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use conductor::delegator::{Delegator, DelegatorConfig, client::HttpAgentClient};
//! use conductor::delegator::circuit_breaker::CircuitBreakerConfig;
//! use conductor::metrics::NoopMetrics;
//! use conductor::models::{AgentTask, Priority, TaskPayload, TaskType, WorkUnitKey};
//! use conductor::registry::AgentRegistry;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = Arc::new(AgentRegistry::new(CircuitBreakerConfig::default()));
//! let delegator = Delegator::new(
//!     DelegatorConfig::default(),
//!     registry,
//!     Arc::new(HttpAgentClient::new()),
//!     Arc::new(NoopMetrics),
//! );
//! let task = AgentTask::new(
//!     TaskType::Performance,
//!     Priority::Medium,
//!     WorkUnitKey::pull_request("octo/repo", 1),
//!     1,
//!     TaskPayload::Performance { paths: vec!["src/lib.rs".into()] },
//! )?;
//! let dispatched = delegator.dispatch(&task, &CancellationToken::new(), |_| {}).await?;
//! println!("{} answered {:?}", dispatched.agent_id, dispatched.result.status);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod client;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::DispatchError;
use crate::metrics::{SharedMetrics, names};
use crate::models::{AgentTask, TaskResult};
use crate::registry::AgentRegistry;

use circuit_breaker::Admission;
use client::{AgentClient, AgentRequest};

/// Default timeout for one agent call.
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 300;

/// Configuration for the delegator.
#[derive(Debug, Clone)]
pub struct DelegatorConfig {
    /// Ceiling on in-flight agent calls across all agents.
    pub max_concurrent_tasks: usize,
    /// Upper bound on a single attempt.
    pub task_timeout: Duration,
    /// Attempts per dispatch, including the first.
    pub retry_attempts: u32,
    /// Base of the exponential backoff.
    pub backoff_base: Duration,
    /// Cap on a single backoff delay.
    pub backoff_max: Duration,
}

impl Default for DelegatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            retry_attempts: 3,
            backoff_base: Duration::from_millis(1_000),
            backoff_max: Duration::from_millis(60_000),
        }
    }
}

impl DelegatorConfig {
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }
}

/// `min(base * 2^attempt, cap)`, saturating instead of overflowing.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// A task that an agent answered.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub agent_id: String,
    pub result: TaskResult,
    pub attempts: u32,
}

pub struct Delegator {
    config: DelegatorConfig,
    registry: Arc<AgentRegistry>,
    client: Arc<dyn AgentClient>,
    global: Arc<Semaphore>,
    waiting: AtomicUsize,
    metrics: SharedMetrics,
}

impl Delegator {
    pub fn new(
        config: DelegatorConfig,
        registry: Arc<AgentRegistry>,
        client: Arc<dyn AgentClient>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            global: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            config,
            registry,
            client,
            waiting: AtomicUsize::new(0),
            metrics,
        }
    }

    pub fn config(&self) -> &DelegatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Dispatches currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// Calls currently holding a global slot.
    pub fn in_flight(&self) -> usize {
        self.config
            .max_concurrent_tasks
            .saturating_sub(self.global.available_permits())
    }

    fn record(&self, status: &str) {
        self.metrics.increment(
            names::TASK_OPERATIONS,
            &[("operation", "dispatch"), ("status", status)],
        );
    }

    fn record_error(&self, kind: &str) {
        self.metrics.increment(
            names::ERRORS,
            &[("type", kind), ("component", "delegator")],
        );
    }

    async fn acquire(
        &self,
        semaphore: Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, DispatchError> {
        self.waiting.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .gauge(names::QUEUE_SIZE, &[], self.queued() as f64);
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Superseded),
            permit = semaphore.acquire_owned() => permit.map_err(|_| DispatchError::Superseded),
        };
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        self.metrics
            .gauge(names::QUEUE_SIZE, &[], self.queued() as f64);
        permit
    }

    /// Deliver `task` to an agent. `on_start` runs with the agent id once
    /// both slots are held, right before the first attempt.
    pub async fn dispatch<F>(
        &self,
        task: &AgentTask,
        cancel: &CancellationToken,
        on_start: F,
    ) -> Result<Dispatched, DispatchError>
    where
        F: FnOnce(&str) + Send,
    {
        task.payload.validate()?;

        let entry = self.registry.select(task.task_type).ok_or_else(|| {
            warn!(task_id = %task.id, task_type = %task.task_type, "no agent available");
            self.record("no_agent");
            DispatchError::NoAgent(task.task_type)
        })?;
        let agent_id = entry.id().to_string();

        if let Some(retry_in) = entry.blocked_for() {
            debug!(task_id = %task.id, agent = %agent_id, ?retry_in, "circuit open, failing fast");
            self.record("circuit_open");
            return Err(DispatchError::CircuitOpen {
                agent: agent_id,
                retry_in,
            });
        }

        let _agent_permit = self.acquire(entry.slots(), cancel).await?;
        let _global_permit = self.acquire(Arc::clone(&self.global), cancel).await?;
        let _slot = entry.begin_task();
        on_start(&agent_id);

        let agent = entry.agent();
        let request = AgentRequest::from_task(task);
        let mut last_error = String::new();

        for attempt in 0..self.config.retry_attempts {
            if attempt > 0 {
                let delay =
                    backoff_delay(self.config.backoff_base, self.config.backoff_max, attempt - 1);
                debug!(task_id = %task.id, agent = %agent_id, attempt, ?delay, "backing off");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.record("superseded");
                        return Err(DispatchError::Superseded);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let admission = entry.admit();
            if let Admission::Rejected { retry_in } = admission {
                self.record("circuit_open");
                return Err(DispatchError::CircuitOpen {
                    agent: agent_id,
                    retry_in,
                });
            }

            let call = tokio::time::timeout(
                self.config.task_timeout,
                self.client.execute(&agent, &request),
            );
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    entry.release(admission);
                    self.record("superseded");
                    return Err(DispatchError::Superseded);
                }
                outcome = call => outcome,
            };

            match outcome {
                Ok(Ok(result)) => {
                    entry.record_success(admission);
                    self.metrics.increment(
                        names::API_CALLS,
                        &[("method", "POST"), ("endpoint", agent_id.as_str()), ("status", "success")],
                    );
                    self.record("success");
                    info!(task_id = %task.id, agent = %agent_id, attempts = attempt + 1, "task delivered");
                    return Ok(Dispatched {
                        agent_id,
                        result,
                        attempts: attempt + 1,
                    });
                }
                Ok(Err(e)) if e.is_client_error() => {
                    entry.release(admission);
                    self.metrics.increment(
                        names::API_CALLS,
                        &[("method", "POST"), ("endpoint", agent_id.as_str()), ("status", "client_error")],
                    );
                    self.record("rejected");
                    self.record_error("client");
                    warn!(task_id = %task.id, agent = %agent_id, error = %e, "agent rejected task");
                    return Err(DispatchError::Rejected {
                        agent: agent_id,
                        reason: e.to_string(),
                    });
                }
                Ok(Err(e)) => {
                    entry.record_failure(admission);
                    self.metrics.increment(
                        names::API_CALLS,
                        &[("method", "POST"), ("endpoint", agent_id.as_str()), ("status", "error")],
                    );
                    self.record_error("agent");
                    warn!(task_id = %task.id, agent = %agent_id, attempt = attempt + 1, error = %e, "agent call failed");
                    last_error = e.to_string();
                }
                Err(_) => {
                    entry.record_failure(admission);
                    self.metrics.increment(
                        names::API_CALLS,
                        &[("method", "POST"), ("endpoint", agent_id.as_str()), ("status", "timeout")],
                    );
                    self.record_error("timeout");
                    warn!(task_id = %task.id, agent = %agent_id, attempt = attempt + 1, "agent call timed out");
                    last_error = format!("timed out after {:?}", self.config.task_timeout);
                }
            }
        }

        self.record("exhausted");
        Err(DispatchError::Exhausted {
            agent: agent_id,
            attempts: self.config.retry_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegator::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::metrics::InMemoryMetrics;
    use crate::models::{Agent, Priority, TaskPayload, TaskType, WorkUnitKey};
    use crate::testing::{AgentReply, ScriptedAgentClient};

    fn task(task_type: TaskType) -> AgentTask {
        let payload = match task_type {
            TaskType::Testing => TaskPayload::Testing {
                test_files: vec![],
                changed_files: vec!["src/lib.rs".into()],
            },
            _ => TaskPayload::SecurityReview {
                files: vec!["src/auth.rs".into()],
                concerns: vec![],
            },
        };
        AgentTask::new(
            task_type,
            Priority::High,
            WorkUnitKey::pull_request("octo/repo", 1),
            1,
            payload,
        )
        .unwrap()
    }

    struct Harness {
        delegator: Arc<Delegator>,
        client: Arc<ScriptedAgentClient>,
        metrics: Arc<InMemoryMetrics>,
    }

    fn harness(config: DelegatorConfig, threshold: u32, agents: Vec<Agent>) -> Harness {
        let registry = Arc::new(AgentRegistry::with_agents(
            agents,
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(60),
                window: Duration::from_secs(300),
            },
        ));
        let client = Arc::new(ScriptedAgentClient::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let delegator = Arc::new(Delegator::new(
            config,
            registry,
            client.clone(),
            metrics.clone(),
        ));
        Harness {
            delegator,
            client,
            metrics,
        }
    }

    fn fast_config() -> DelegatorConfig {
        DelegatorConfig::default()
            .with_task_timeout(Duration::from_secs(5))
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1_000))
    }

    fn security_agent() -> Agent {
        Agent::new("sec-1", TaskType::SecurityReview, "http://sec").with_max_tasks(4)
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_millis(1_000);
        let cap = Duration::from_millis(60_000);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(base, cap, 6), cap);
        assert_eq!(backoff_delay(base, cap, 40), cap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let h = harness(fast_config(), 5, vec![security_agent()]);
        let t = task(TaskType::SecurityReview);
        let mut started = None;
        let out = h
            .delegator
            .dispatch(&t, &CancellationToken::new(), |agent| {
                started = Some(agent.to_string())
            })
            .await
            .unwrap();
        assert_eq!(out.agent_id, "sec-1");
        assert_eq!(out.attempts, 1);
        assert_eq!(out.result.task_id, t.id);
        assert_eq!(started.as_deref(), Some("sec-1"));
        assert_eq!(h.client.calls("sec-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_server_errors_then_succeeds() {
        let h = harness(fast_config(), 5, vec![security_agent()]);
        h.client.script(
            "sec-1",
            vec![AgentReply::ServerError(500), AgentReply::ServerError(502)],
        );
        let started = tokio::time::Instant::now();
        let out = h
            .delegator
            .dispatch(&task(TaskType::SecurityReview), &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(out.attempts, 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
        let entry = h.delegator.registry().get("sec-1").unwrap();
        assert_eq!(entry.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_fails_without_retry_or_breaker() {
        let h = harness(fast_config(), 1, vec![security_agent()]);
        h.client.script("sec-1", vec![AgentReply::ClientError(422)]);
        let err = h
            .delegator
            .dispatch(&task(TaskType::SecurityReview), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { .. }));
        assert_eq!(h.client.calls("sec-1"), 1);
        let entry = h.delegator.registry().get("sec-1").unwrap();
        assert_eq!(entry.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_then_fails_fast() {
        let h = harness(fast_config(), 3, vec![security_agent()]);
        h.client.script(
            "sec-1",
            vec![
                AgentReply::ServerError(500),
                AgentReply::ServerError(500),
                AgentReply::ServerError(500),
            ],
        );
        let err = h
            .delegator
            .dispatch(&task(TaskType::SecurityReview), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Exhausted { attempts: 3, .. }));
        let entry = h.delegator.registry().get("sec-1").unwrap();
        assert_eq!(entry.circuit_state(), CircuitState::Open);

        let err = h
            .delegator
            .dispatch(&task(TaskType::SecurityReview), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        match err {
            DispatchError::CircuitOpen { retry_in, .. } => {
                assert_eq!(retry_in, Duration::from_secs(60))
            }
            other => panic!("expected circuit_open, got {other:?}"),
        }
        // no network call for the fast failure
        assert_eq!(h.client.calls("sec-1"), 3);
        assert_eq!(
            h.metrics.counter(
                names::TASK_OPERATIONS,
                &[("operation", "dispatch"), ("status", "circuit_open")]
            ),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let config = fast_config().with_retry_attempts(1);
        let h = harness(config, 1, vec![security_agent()]);
        h.client
            .script("sec-1", vec![AgentReply::Delay(Duration::from_secs(30))]);
        let err = h
            .delegator
            .dispatch(&task(TaskType::SecurityReview), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        match err {
            DispatchError::Exhausted { last_error, .. } => assert!(last_error.contains("timed out")),
            other => panic!("unexpected {other:?}"),
        }
        let entry = h.delegator.registry().get("sec-1").unwrap();
        assert_eq!(entry.circuit_state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let config = fast_config().with_retry_attempts(1);
        let h = harness(config, 1, vec![security_agent()]);
        h.client.script(
            "sec-1",
            vec![
                AgentReply::ServerError(500),
                AgentReply::Delay(Duration::from_secs(2)),
            ],
        );
        let _ = h
            .delegator
            .dispatch(&task(TaskType::SecurityReview), &CancellationToken::new(), |_| {})
            .await;
        tokio::time::advance(Duration::from_secs(61)).await;

        let d1 = h.delegator.clone();
        let t1 = task(TaskType::SecurityReview);
        let probe = tokio::spawn(async move {
            d1.dispatch(&t1, &CancellationToken::new(), |_| {}).await
        });
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(10)).await;

        let second = h
            .delegator
            .dispatch(&task(TaskType::SecurityReview), &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(second, Err(DispatchError::CircuitOpen { .. })));

        let probe = probe.await.unwrap();
        assert!(probe.is_ok());
        let entry = h.delegator.registry().get("sec-1").unwrap();
        assert_eq!(entry.circuit_state(), CircuitState::Closed);
        assert_eq!(h.client.calls("sec-1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_from_before_opening_cannot_free_half_open_slot() {
        let config = fast_config()
            .with_retry_attempts(1)
            .with_task_timeout(Duration::from_secs(600));
        let h = harness(config, 1, vec![security_agent()]);
        h.client.script(
            "sec-1",
            vec![
                AgentReply::DelayThen(Duration::from_secs(120), Box::new(AgentReply::ClientError(422))),
                AgentReply::ServerError(500),
                AgentReply::Delay(Duration::from_secs(100)),
            ],
        );

        // admitted while closed, answers late
        let d = h.delegator.clone();
        let t = task(TaskType::SecurityReview);
        let slow = tokio::spawn(async move { d.dispatch(&t, &CancellationToken::new(), |_| {}).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let opened = h
            .delegator
            .dispatch(&task(TaskType::SecurityReview), &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(opened, Err(DispatchError::Exhausted { .. })));
        tokio::time::sleep(Duration::from_secs(61)).await;

        let d = h.delegator.clone();
        let t = task(TaskType::SecurityReview);
        let trial = tokio::spawn(async move { d.dispatch(&t, &CancellationToken::new(), |_| {}).await });
        tokio::time::sleep(Duration::from_millis(1)).await;
        let entry = h.delegator.registry().get("sec-1").unwrap();
        assert_eq!(entry.circuit_state(), CircuitState::HalfOpen);

        let late = slow.await.unwrap();
        assert!(matches!(late, Err(DispatchError::Rejected { .. })));

        let second = h
            .delegator
            .dispatch(&task(TaskType::SecurityReview), &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(second, Err(DispatchError::CircuitOpen { .. })));
        assert_eq!(h.client.calls("sec-1"), 3);

        assert!(trial.await.unwrap().is_ok());
        assert_eq!(entry.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_ceiling_queues_dispatches() {
        let config = fast_config().with_max_concurrent_tasks(2);
        let h = harness(
            config,
            5,
            vec![
                Agent::new("sec-1", TaskType::SecurityReview, "http://a").with_max_tasks(10),
                Agent::new("test-1", TaskType::Testing, "http://b").with_max_tasks(10),
            ],
        );
        h.client.set_default(AgentReply::Delay(Duration::from_millis(500)));

        let mut handles = Vec::new();
        for i in 0..6 {
            let d = h.delegator.clone();
            let t = if i % 2 == 0 {
                task(TaskType::SecurityReview)
            } else {
                task(TaskType::Testing)
            };
            handles.push(tokio::spawn(async move {
                d.dispatch(&t, &CancellationToken::new(), |_| {}).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(h.client.max_in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_agent_ceiling() {
        let h = harness(
            fast_config(),
            5,
            vec![Agent::new("sec-1", TaskType::SecurityReview, "http://a").with_max_tasks(1)],
        );
        h.client.set_default(AgentReply::Delay(Duration::from_millis(200)));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let d = h.delegator.clone();
            let t = task(TaskType::SecurityReview);
            handles.push(tokio::spawn(async move {
                d.dispatch(&t, &CancellationToken::new(), |_| {}).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(h.client.max_in_flight_for("sec-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_supersedes_in_flight_call() {
        let h = harness(fast_config(), 1, vec![security_agent()]);
        h.client
            .script("sec-1", vec![AgentReply::Delay(Duration::from_secs(3))]);
        let cancel = CancellationToken::new();
        let d = h.delegator.clone();
        let t = task(TaskType::SecurityReview);
        let c = cancel.clone();
        let handle = tokio::spawn(async move { d.dispatch(&t, &c, |_| {}).await });
        tokio::task::yield_now().await;
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, DispatchError::Superseded));
        let entry = h.delegator.registry().get("sec-1").unwrap();
        assert_eq!(entry.circuit_state(), CircuitState::Closed);
        assert_eq!(entry.agent().current_tasks, 0);
    }

    #[tokio::test]
    async fn test_no_agent_for_type() {
        let h = harness(fast_config(), 5, vec![security_agent()]);
        let err = h
            .delegator
            .dispatch(&task(TaskType::Testing), &CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoAgent(TaskType::Testing)));
        assert!(err.is_dead_letter());
    }
}
