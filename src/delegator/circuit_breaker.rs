//! Per-endpoint circuit breaker.
//!
//! The breaker is a plain state machine; the registry keeps one per agent
//! behind that agent's lock, so every method takes `&mut self` and never
//! awaits. Time is read from `tokio::time::Instant` so paused-clock tests
//! drive cooldowns deterministically.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation – all calls pass through.
    Closed,
    /// Too many consecutive failures – calls are rejected without a network call.
    Open,
    /// Cooldown elapsed – exactly one probe call is allowed through.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub cooldown: Duration,
    /// Span of the rolling success/failure window.
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            window: Duration::from_secs(300),
        }
    }
}

/// Decision for one call attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open probe. Its outcome decides the next state.
    Probe,
    Rejected { retry_in: Duration },
}

/// Read-only view for the introspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub window_calls: usize,
    pub window_success_rate: Option<f64>,
    pub retry_in_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    window: VecDeque<(Instant, bool)>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            probe_in_flight: false,
            window: VecDeque::new(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn remaining_cooldown(&self, now: Instant) -> Duration {
        match self.opened_at {
            Some(opened) => self
                .config
                .cooldown
                .saturating_sub(now.saturating_duration_since(opened)),
            None => Duration::ZERO,
        }
    }

    /// Without changing state, report how long until a call could pass.
    /// `None` means a call would be admitted now.
    pub fn blocked_for(&self) -> Option<Duration> {
        let now = Instant::now();
        match self.state {
            CircuitState::Closed => None,
            CircuitState::Open => {
                let remaining = self.remaining_cooldown(now);
                (!remaining.is_zero()).then_some(remaining)
            }
            CircuitState::HalfOpen if self.probe_in_flight => Some(self.config.cooldown),
            CircuitState::HalfOpen => None,
        }
    }

    /// Ask to place a call. In half-open only one caller receives `Probe`
    /// until that probe reports back or is released.
    pub fn admit(&mut self) -> Admission {
        let now = Instant::now();
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let remaining = self.remaining_cooldown(now);
                if !remaining.is_zero() {
                    return Admission::Rejected {
                        retry_in: remaining,
                    };
                }
                info!(agent = %self.name, "circuit breaker transitioning open -> half_open");
                self.state = CircuitState::HalfOpen;
                self.probe_in_flight = true;
                Admission::Probe
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Rejected {
                        retry_in: self.config.cooldown,
                    }
                } else {
                    self.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Record a successful call admitted as `admission`. Only the probe can
    /// close a circuit that is not closed; a call admitted before the
    /// circuit opened only feeds the window.
    pub fn record_success(&mut self, admission: Admission) {
        let now = Instant::now();
        self.push_window(now, true);
        match (self.state, admission) {
            (CircuitState::Closed, _) => self.consecutive_failures = 0,
            (CircuitState::HalfOpen, Admission::Probe) => {
                info!(agent = %self.name, "circuit breaker closed after successful probe");
                self.consecutive_failures = 0;
                self.probe_in_flight = false;
                self.state = CircuitState::Closed;
                self.opened_at = None;
            }
            _ => {
                debug!(agent = %self.name, state = self.state.as_str(), "stale success ignored");
            }
        }
    }

    /// Record a failed call admitted as `admission`. Like
    /// [`record_success`](Self::record_success), a stale call cannot reopen
    /// or extend an open circuit.
    pub fn record_failure(&mut self, admission: Admission) {
        let now = Instant::now();
        self.push_window(now, false);
        self.last_failure_at = Some(Utc::now());
        match (self.state, admission) {
            (CircuitState::HalfOpen, Admission::Probe) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                warn!(agent = %self.name, "half-open probe failed, reopening circuit");
                self.open(now);
            }
            (CircuitState::Closed, _) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        agent = %self.name,
                        failures = self.consecutive_failures,
                        "failure threshold reached, opening circuit"
                    );
                    self.open(now);
                }
            }
            _ => {
                debug!(agent = %self.name, state = self.state.as_str(), "stale failure ignored");
            }
        }
    }

    /// End a call that gave no verdict on endpoint health (client-class
    /// error or cancellation). Only a probe gives its slot back.
    pub fn release(&mut self, admission: Admission) {
        if admission == Admission::Probe && self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn push_window(&mut self, now: Instant, success: bool) {
        self.window.push_back((now, success));
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > self.config.window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let calls = self.window.len();
        let successes = self.window.iter().filter(|(_, ok)| *ok).count();
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            window_calls: calls,
            window_success_rate: (calls > 0).then(|| successes as f64 / calls as f64),
            retry_in_ms: self.blocked_for().map(|d| d.as_millis() as u64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "sec-1",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: Duration::from_secs(60),
                window: Duration::from_secs(300),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let mut cb = breaker(3);
        for _ in 0..2 {
            assert_eq!(cb.admit(), Admission::Allowed);
            cb.record_failure(Admission::Allowed);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure(Admission::Allowed);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.admit(), Admission::Rejected { .. }));
        assert_eq!(cb.blocked_for(), Some(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let mut cb = breaker(3);
        cb.record_failure(Admission::Allowed);
        cb.record_failure(Admission::Allowed);
        cb.record_success(Admission::Allowed);
        cb.record_failure(Admission::Allowed);
        cb.record_failure(Admission::Allowed);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_probe_in_half_open() {
        let mut cb = breaker(1);
        cb.record_failure(Admission::Allowed);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cb.blocked_for(), None);
        assert_eq!(cb.admit(), Admission::Probe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(cb.admit(), Admission::Rejected { .. }));
        assert!(matches!(cb.admit(), Admission::Rejected { .. }));

        cb.record_success(Admission::Probe);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.admit(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens_and_restarts_cooldown() {
        let mut cb = breaker(1);
        cb.record_failure(Admission::Allowed);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cb.admit(), Admission::Probe);
        cb.record_failure(Admission::Probe);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        match cb.admit() {
            Admission::Rejected { retry_in } => assert_eq!(retry_in, Duration::from_secs(30)),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_probe_can_be_reissued() {
        let mut cb = breaker(1);
        cb.record_failure(Admission::Allowed);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cb.admit(), Admission::Probe);
        cb.release(Admission::Probe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.admit(), Admission::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_admitted_before_opening_cannot_decide_half_open() {
        let mut cb = breaker(1);
        let slow = cb.admit();
        assert_eq!(slow, Admission::Allowed);
        cb.record_failure(Admission::Allowed);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cb.admit(), Admission::Probe);

        // the slow call ends while the probe is out
        cb.release(slow);
        assert!(matches!(cb.admit(), Admission::Rejected { .. }));
        cb.record_success(slow);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure(slow);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(matches!(cb.admit(), Admission::Rejected { .. }));

        cb.record_success(Admission::Probe);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_does_not_extend_cooldown() {
        let mut cb = breaker(1);
        cb.record_failure(Admission::Allowed);
        tokio::time::advance(Duration::from_secs(30)).await;
        cb.record_failure(Admission::Allowed);
        assert_eq!(cb.blocked_for(), Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_window_rate() {
        let mut cb = breaker(5);
        cb.record_success(Admission::Allowed);
        cb.record_success(Admission::Allowed);
        cb.record_failure(Admission::Allowed);
        cb.record_success(Admission::Allowed);
        let snap = cb.snapshot();
        assert_eq!(snap.window_calls, 4);
        assert_eq!(snap.window_success_rate, Some(0.75));
        assert!(snap.last_failure_at.is_some());

        tokio::time::advance(Duration::from_secs(301)).await;
        cb.record_success(Admission::Allowed);
        assert_eq!(cb.snapshot().window_calls, 1);
    }
}
