//! Platform retry policy with a shared rate-limit pause.
//!
//! Transient failures are retried with capped exponential backoff. A
//! rate-limit response pauses *every* call through the same gate until the
//! platform's reported reset time.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{PlatformClient, ReviewCommenter};
use crate::delegator::backoff_delay;
use crate::errors::PlatformError;
use crate::metrics::{SharedMetrics, names};
use crate::models::{IssueContext, MergeStrategy, PrContext, Recommendation, WorkUnitKey};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(1_000),
            cap: Duration::from_millis(60_000),
        }
    }
}

/// Holds platform calls until a rate-limit window resets.
#[derive(Debug, Default)]
pub struct RateLimitGate {
    until: Mutex<Option<Instant>>,
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause_until(&self, reset_at: DateTime<Utc>) {
        let wait = (reset_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let candidate = Instant::now() + wait;
        let mut until = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        if until.is_none_or(|current| candidate > current) {
            *until = Some(candidate);
        }
    }

    /// Remaining pause, if any.
    pub fn paused_for(&self) -> Option<Duration> {
        let until = *self.until.lock().unwrap_or_else(PoisonError::into_inner);
        until
            .map(|u| u.saturating_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    pub async fn wait(&self) {
        if let Some(wait) = self.paused_for() {
            debug!(?wait, "platform calls paused for rate limit");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Wraps a [`PlatformClient`] with retries and the rate-limit gate.
pub struct RetryingPlatform<P> {
    inner: P,
    policy: RetryPolicy,
    gate: Arc<RateLimitGate>,
    metrics: SharedMetrics,
}

impl<P: PlatformClient> RetryingPlatform<P> {
    pub fn new(inner: P, policy: RetryPolicy, metrics: SharedMetrics) -> Self {
        Self {
            inner,
            policy,
            gate: Arc::new(RateLimitGate::new()),
            metrics,
        }
    }

    pub fn gate(&self) -> &Arc<RateLimitGate> {
        &self.gate
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    async fn run<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T, PlatformError>
    where
        F: Fn() -> Fut + Send,
        Fut: Future<Output = Result<T, PlatformError>> + Send,
        T: Send,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0;
        loop {
            self.gate.wait().await;
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    if let PlatformError::RateLimited { reset_at } = &err {
                        warn!(operation, %reset_at, "rate limited, pausing platform calls");
                        self.metrics.gauge(names::RATE_LIMIT_REMAINING, &[], 0.0);
                        self.gate.pause_until(*reset_at);
                    } else {
                        let delay = backoff_delay(self.policy.base, self.policy.cap, attempt);
                        warn!(operation, attempt = attempt + 1, error = %err, ?delay, "platform call failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(err) => {
                    self.metrics.increment(
                        names::ERRORS,
                        &[("type", operation), ("component", "platform")],
                    );
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl<P: PlatformClient> PlatformClient for RetryingPlatform<P> {
    async fn pull_request(
        &self,
        repository: &str,
        number: u64,
    ) -> Result<PrContext, PlatformError> {
        self.run("pull_request", || self.inner.pull_request(repository, number))
            .await
    }

    async fn issue(&self, repository: &str, number: u64) -> Result<IssueContext, PlatformError> {
        self.run("issue", || self.inner.issue(repository, number)).await
    }

    async fn add_labels(&self, key: &WorkUnitKey, labels: &[String]) -> Result<(), PlatformError> {
        self.run("add_labels", || self.inner.add_labels(key, labels))
            .await
    }

    async fn remove_label(&self, key: &WorkUnitKey, label: &str) -> Result<(), PlatformError> {
        self.run("remove_label", || self.inner.remove_label(key, label))
            .await
    }

    async fn post_comment(&self, key: &WorkUnitKey, body: &str) -> Result<(), PlatformError> {
        self.run("post_comment", || self.inner.post_comment(key, body))
            .await
    }

    async fn merge(
        &self,
        repository: &str,
        number: u64,
        strategy: MergeStrategy,
    ) -> Result<(), PlatformError> {
        self.run("merge", || self.inner.merge(repository, number, strategy))
            .await
    }

    async fn close(&self, key: &WorkUnitKey) -> Result<(), PlatformError> {
        self.run("close", || self.inner.close(key)).await
    }

    fn review_commenter(&self) -> Option<&dyn ReviewCommenter> {
        self.inner
            .review_commenter()
            .map(|_| self as &dyn ReviewCommenter)
    }
}

#[async_trait]
impl<P: PlatformClient> ReviewCommenter for RetryingPlatform<P> {
    async fn post_review(
        &self,
        repository: &str,
        number: u64,
        recommendation: Recommendation,
        body: &str,
    ) -> Result<(), PlatformError> {
        let reviewer = self
            .inner
            .review_commenter()
            .ok_or(PlatformError::Unsupported("post_review"))?;
        self.run("post_review", || {
            reviewer.post_review(repository, number, recommendation, body)
        })
        .await
    }
}
