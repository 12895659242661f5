//! Typed error hierarchy for the Conductor review orchestrator.
//!
//! One enum per subsystem:
//! - `ConfigError`: startup configuration problems (always fatal)
//! - `WebhookError`: inbound delivery rejected at the boundary
//! - `PlatformError`: calls against the hosting platform API
//! - `AgentCallError`: a single HTTP exchange with a worker agent
//! - `DispatchError`: the outcome of delegating one task
//! - `TaskError`: task construction and lifecycle violations
//! - `EngineError`: pipeline failures surfaced by the engine

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{FailureReason, TaskStatus, TaskType, WorkUnitKey};

/// Errors raised while assembling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Reasons an inbound webhook delivery is rejected before entering the pipeline.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing required header {0}")]
    MissingHeader(&'static str),

    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),
}

/// Errors from the hosting platform API.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Rate limited until {reset_at}")]
    RateLimited { reset_at: DateTime<Utc> },

    #[error("Transient platform failure: {0}")]
    Transient(String),

    #[error("Platform rejected request with status {status}: {message}")]
    Client { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation not supported by this platform client: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PlatformError {
    /// Whether the platform retry policy should attempt the call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

/// Failure of one request/response exchange with a worker agent.
#[derive(Debug, Error)]
pub enum AgentCallError {
    #[error("Agent rejected task with status {status}: {body}")]
    Client { status: u16, body: String },

    #[error("Agent failed with status {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed agent response: {0}")]
    MalformedResponse(String),
}

impl AgentCallError {
    /// Client-class failures fail fast: no retry budget, no breaker feedback.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Client { .. })
    }
}

/// Outcome of delegating a task that did not produce a result.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No agent registered for task type {0}")]
    NoAgent(TaskType),

    #[error("Circuit open for agent {agent}, retry in {retry_in:?}")]
    CircuitOpen { agent: String, retry_in: Duration },

    #[error("Agent {agent} rejected task: {reason}")]
    Rejected { agent: String, reason: String },

    #[error("Agent {agent} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        agent: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Task superseded before completion")]
    Superseded,

    #[error(transparent)]
    InvalidTask(#[from] TaskError),
}

impl DispatchError {
    /// The failure reason recorded on the task when dispatch ends this way.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::NoAgent(_) | Self::Exhausted { .. } => FailureReason::Exhausted,
            Self::CircuitOpen { .. } => FailureReason::CircuitOpen,
            Self::Rejected { .. } | Self::InvalidTask(_) => FailureReason::Rejected,
            Self::Superseded => FailureReason::Superseded,
        }
    }

    /// Whether the task belongs in the dead-letter queue for a later replay.
    pub fn is_dead_letter(&self) -> bool {
        matches!(
            self,
            Self::NoAgent(_) | Self::CircuitOpen { .. } | Self::Exhausted { .. }
        )
    }
}

/// Task construction and lifecycle violations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Payload for {found} does not match task type {expected}")]
    PayloadMismatch { expected: TaskType, found: TaskType },

    #[error("Invalid task payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task {0} not found")]
    NotFound(Uuid),

    #[error("Work unit {0} is closed")]
    UnitClosed(WorkUnitKey),
}

/// Errors surfaced by the orchestration pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// A platform failure shared by every caller of one analysis.
    #[error(transparent)]
    Analysis(#[from] Arc<PlatformError>),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether handing the work to the dead-letter queue can help.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Platform(e) => e.is_retryable(),
            Self::Analysis(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Missing {
            key: "GITHUB_WEBHOOK_SECRET".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing required configuration: GITHUB_WEBHOOK_SECRET"
        );

        let err = ConfigError::Invalid {
            key: "PORT".into(),
            value: "abc".into(),
            reason: "expected an integer".into(),
        };
        assert!(err.to_string().contains("\"abc\""));
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_platform_error_retryable() {
        assert!(PlatformError::Transient("502".into()).is_retryable());
        assert!(
            PlatformError::RateLimited {
                reset_at: Utc::now()
            }
            .is_retryable()
        );
        assert!(
            !PlatformError::Client {
                status: 422,
                message: "bad".into()
            }
            .is_retryable()
        );
        assert!(!PlatformError::NotFound("repo".into()).is_retryable());
    }

    #[test]
    fn test_agent_call_error_classification() {
        assert!(
            AgentCallError::Client {
                status: 400,
                body: String::new()
            }
            .is_client_error()
        );
        assert!(
            !AgentCallError::Server {
                status: 500,
                body: String::new()
            }
            .is_client_error()
        );
        assert!(!AgentCallError::Transport("reset".into()).is_client_error());
    }

    #[test]
    fn test_dispatch_error_routing() {
        let open = DispatchError::CircuitOpen {
            agent: "sec-1".into(),
            retry_in: Duration::from_secs(60),
        };
        assert_eq!(open.failure_reason(), FailureReason::CircuitOpen);
        assert!(open.is_dead_letter());

        let rejected = DispatchError::Rejected {
            agent: "sec-1".into(),
            reason: "400".into(),
        };
        assert_eq!(rejected.failure_reason(), FailureReason::Rejected);
        assert!(!rejected.is_dead_letter());

        assert_eq!(
            DispatchError::Superseded.failure_reason(),
            FailureReason::Superseded
        );
        assert!(!DispatchError::Superseded.is_dead_letter());
    }

    #[test]
    fn test_engine_error_from_platform() {
        let err: EngineError = PlatformError::NotFound("octo/repo#1".into()).into();
        assert!(matches!(err, EngineError::Platform(_)));
        assert_eq!(err.to_string(), "Not found: octo/repo#1");
    }
}
