//! Agent registry: known agents, their concurrency slots, health and
//! circuit state.
//!
//! Agents are stored by id. Each entry owns a semaphore sized to the agent's
//! `max_tasks` and a lock over the mutable agent record plus its circuit
//! breaker. Only the delegator and the health prober mutate entries.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::delegator::circuit_breaker::{
    Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
use crate::delegator::client::AgentClient;
use crate::metrics::{SharedMetrics, names};
use crate::models::{Agent, AgentStatus, HealthStatus, TaskType};

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct AgentState {
    pub agent: Agent,
    pub breaker: CircuitBreaker,
}

pub struct AgentEntry {
    id: String,
    agent_type: TaskType,
    slots: Arc<Semaphore>,
    state: Mutex<AgentState>,
}

impl AgentEntry {
    fn new(agent: Agent, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            id: agent.id.clone(),
            agent_type: agent.agent_type,
            slots: Arc::new(Semaphore::new(agent.max_tasks.max(1))),
            state: Mutex::new(AgentState {
                breaker: CircuitBreaker::new(agent.id.clone(), breaker_config),
                agent,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_type(&self) -> TaskType {
        self.agent_type
    }

    pub fn slots(&self) -> Arc<Semaphore> {
        Arc::clone(&self.slots)
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn agent(&self) -> Agent {
        self.lock().agent.clone()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.lock().breaker.state()
    }

    /// How long until the breaker would admit a call, if it is blocking.
    pub fn blocked_for(&self) -> Option<Duration> {
        self.lock().breaker.blocked_for()
    }

    pub fn admit(&self) -> Admission {
        self.lock().breaker.admit()
    }

    pub fn record_success(&self, admission: Admission) {
        self.lock().breaker.record_success(admission);
    }

    pub fn record_failure(&self, admission: Admission) {
        self.lock().breaker.record_failure(admission);
    }

    pub fn release(&self, admission: Admission) {
        self.lock().breaker.release(admission);
    }

    /// Count a dispatch against this agent until the guard drops.
    pub fn begin_task(self: &Arc<Self>) -> TaskSlot {
        {
            let mut state = self.lock();
            state.agent.current_tasks += 1;
            if state.agent.current_tasks >= state.agent.max_tasks
                && state.agent.status == AgentStatus::Online
            {
                state.agent.status = AgentStatus::Busy;
            }
        }
        TaskSlot {
            entry: Arc::clone(self),
        }
    }

    fn end_task(&self) {
        let mut state = self.lock();
        state.agent.current_tasks = state.agent.current_tasks.saturating_sub(1);
        if state.agent.current_tasks < state.agent.max_tasks
            && state.agent.status == AgentStatus::Busy
        {
            state.agent.status = AgentStatus::Online;
        }
    }

    fn record_health(&self, healthy: bool, response_time: Duration) {
        let mut state = self.lock();
        let agent = &mut state.agent;
        agent.health_check.last_check = Some(Utc::now());
        agent.health_check.response_time_ms = Some(response_time.as_millis() as u64);
        if healthy {
            agent.health_check.status = HealthStatus::Healthy;
            if agent.status == AgentStatus::Offline {
                info!(agent = %agent.id, "agent back online");
                agent.status = if agent.current_tasks >= agent.max_tasks {
                    AgentStatus::Busy
                } else {
                    AgentStatus::Online
                };
            }
        } else {
            agent.health_check.status = HealthStatus::Unhealthy;
            if agent.status != AgentStatus::Offline {
                warn!(agent = %agent.id, "agent failed health check, marking offline");
            }
            agent.status = AgentStatus::Offline;
        }
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        let state = self.lock();
        AgentSnapshot {
            agent: state.agent.clone(),
            circuit: state.breaker.snapshot(),
        }
    }
}

/// Releases the agent's task counter on drop.
pub struct TaskSlot {
    entry: Arc<AgentEntry>,
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.entry.end_task();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    #[serde(flatten)]
    pub agent: Agent,
    pub circuit: BreakerSnapshot,
}

pub struct AgentRegistry {
    agents: DashMap<String, Arc<AgentEntry>>,
    breaker_config: CircuitBreakerConfig,
}

impl AgentRegistry {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            agents: DashMap::new(),
            breaker_config,
        }
    }

    pub fn with_agents(agents: Vec<Agent>, breaker_config: CircuitBreakerConfig) -> Self {
        let registry = Self::new(breaker_config);
        for agent in agents {
            registry.register(agent);
        }
        registry
    }

    /// Add or replace an agent. Replacing resets its breaker and slots.
    pub fn register(&self, agent: Agent) {
        debug!(agent = %agent.id, agent_type = %agent.agent_type, "registering agent");
        let entry = Arc::new(AgentEntry::new(agent, self.breaker_config.clone()));
        self.agents.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<Arc<AgentEntry>> {
        self.agents.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Pick the agent for a task type: not offline, admitting calls, least
    /// loaded. When every candidate's circuit is blocking, the one that
    /// reopens soonest is returned so the caller can fail fast.
    pub fn select(&self, task_type: TaskType) -> Option<Arc<AgentEntry>> {
        let mut open: Vec<(Duration, Arc<AgentEntry>)> = Vec::new();
        let mut ready: Vec<(f64, String, Arc<AgentEntry>)> = Vec::new();

        for item in self.agents.iter() {
            let entry = item.value();
            if entry.agent_type != task_type {
                continue;
            }
            let state = entry.lock();
            if state.agent.status == AgentStatus::Offline {
                continue;
            }
            match state.breaker.blocked_for() {
                Some(wait) => open.push((wait, Arc::clone(entry))),
                None => ready.push((state.agent.load(), entry.id.clone(), Arc::clone(entry))),
            }
        }

        if !ready.is_empty() {
            ready.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            return ready.into_iter().next().map(|(_, _, e)| e);
        }
        open.sort_by_key(|(wait, _)| *wait);
        open.into_iter().next().map(|(_, e)| e)
    }

    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        let mut agents: Vec<AgentSnapshot> = self.agents.iter().map(|e| e.snapshot()).collect();
        agents.sort_by(|a, b| a.agent.id.cmp(&b.agent.id));
        agents
    }

    pub fn count_by_status(&self, status: AgentStatus) -> usize {
        self.agents
            .iter()
            .filter(|e| e.lock().agent.status == status)
            .count()
    }

    /// Publish per-type availability and circuit gauges.
    pub fn publish_gauges(&self, metrics: &SharedMetrics) {
        for task_type in TaskType::ALL {
            let enabled = self
                .agents
                .iter()
                .filter(|e| e.agent_type == task_type)
                .filter(|e| e.lock().agent.status != AgentStatus::Offline)
                .count();
            metrics.gauge(
                names::AGENTS_ENABLED,
                &[("type", task_type.as_str())],
                enabled as f64,
            );
        }
        for item in self.agents.iter() {
            let open = item.circuit_state() != CircuitState::Closed;
            metrics.gauge(
                names::CIRCUIT_OPEN,
                &[("agent", item.id())],
                if open { 1.0 } else { 0.0 },
            );
        }
    }

    /// Probe every agent once and record the outcome.
    pub async fn probe_all(&self, client: &dyn AgentClient, metrics: &SharedMetrics) {
        let entries: Vec<Arc<AgentEntry>> =
            self.agents.iter().map(|e| Arc::clone(e.value())).collect();
        if entries.is_empty() {
            return;
        }

        let mut healthy = 0usize;
        for entry in &entries {
            let agent = entry.agent();
            let started = tokio::time::Instant::now();
            let outcome = tokio::time::timeout(HEALTH_PROBE_TIMEOUT, client.health(&agent)).await;
            let ok = matches!(outcome, Ok(Ok(())));
            if let Ok(Err(e)) = &outcome {
                debug!(agent = %agent.id, error = %e, "health check failed");
            }
            entry.record_health(ok, started.elapsed());
            if ok {
                healthy += 1;
            }
        }

        metrics.gauge(
            names::HEALTH_SCORE,
            &[("component", "agents")],
            healthy as f64 / entries.len() as f64,
        );
        self.publish_gauges(metrics);
    }
}

/// Run [`AgentRegistry::probe_all`] every `interval` until cancelled.
pub fn spawn_health_prober(
    registry: Arc<AgentRegistry>,
    client: Arc<dyn AgentClient>,
    metrics: SharedMetrics,
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
                    registry.probe_all(client.as_ref(), &metrics).await;
                }
            }
        }
        debug!("health prober stopped");
    })
}
