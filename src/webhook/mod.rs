//! Webhook event router.
//!
//! Validates inbound deliveries (signature, headers, JSON), deduplicates them
//! by delivery id and classifies them into [`RoutedEvent`]s for the engine.

pub mod command;
pub mod payload;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tracing::debug;

use crate::errors::WebhookError;
use crate::metrics::{SharedMetrics, names};
use crate::models::{EntityKind, WorkUnitKey};

use command::Command;
use payload::{IssueCommentEvent, IssuesEvent, PullRequestEvent, ReviewCommentEvent};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

/// Deliveries remembered for deduplication.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

fn keyed(secret: &str) -> Result<HmacSha256, WebhookError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSignature)
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = keyed(secret)?;
    mac.update(body);
    Ok(format!(
        "{}{}",
        SIGNATURE_PREFIX,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Constant-time check of a `sha256=` signature header.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), WebhookError> {
    let hex_sig = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(WebhookError::InvalidSignature)?;
    let expected = hex::decode(hex_sig).map_err(|_| WebhookError::InvalidSignature)?;
    let mut mac = keyed(secret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrAction {
    Analyze,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueAction {
    Analyze,
    Closed,
}

/// A delivery the engine has work for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutedEvent {
    PullRequest {
        key: WorkUnitKey,
        action: PrAction,
    },
    Issue {
        key: WorkUnitKey,
        action: IssueAction,
    },
    Command {
        key: WorkUnitKey,
        command: Command,
        author: String,
    },
}

impl RoutedEvent {
    pub fn key(&self) -> &WorkUnitKey {
        match self {
            Self::PullRequest { key, .. } | Self::Issue { key, .. } | Self::Command { key, .. } => {
                key
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub event_type: String,
    pub event: RoutedEvent,
}

#[derive(Debug)]
pub enum RouteOutcome {
    Accepted(Delivery),
    /// Already seen; acknowledged without processing.
    Duplicate,
    Ignored(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    InFlight,
    Processed,
    Failed,
    DeadLettered,
}

#[derive(Default)]
struct LogInner {
    states: HashMap<String, DeliveryState>,
    order: VecDeque<String>,
}

/// Bounded record of delivery ids; the oldest entries are evicted first.
pub struct DeliveryLog {
    capacity: usize,
    inner: Mutex<LogInner>,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LogInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `id` as in flight. False if it was already known.
    pub fn claim(&self, id: &str) -> bool {
        let mut inner = self.lock();
        if inner.states.contains_key(id) {
            return false;
        }
        inner.states.insert(id.to_string(), DeliveryState::InFlight);
        inner.order.push_back(id.to_string());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.states.remove(&oldest);
            }
        }
        true
    }

    pub fn finish(&self, id: &str, state: DeliveryState) {
        if let Some(current) = self.lock().states.get_mut(id) {
            *current = state;
        }
    }

    pub fn state(&self, id: &str) -> Option<DeliveryState> {
        self.lock().states.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raw delivery as read off the HTTP request.
#[derive(Debug, Clone, Copy)]
pub struct InboundDelivery<'a> {
    pub event: Option<&'a str>,
    pub delivery_id: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

pub struct WebhookRouter {
    secret: String,
    log: DeliveryLog,
    metrics: SharedMetrics,
}

impl WebhookRouter {
    pub fn new(secret: impl Into<String>, capacity: usize, metrics: SharedMetrics) -> Self {
        Self {
            secret: secret.into(),
            log: DeliveryLog::new(capacity),
            metrics,
        }
    }

    pub fn log(&self) -> &DeliveryLog {
        &self.log
    }

    pub fn route(&self, inbound: InboundDelivery<'_>) -> Result<RouteOutcome, WebhookError> {
        let event_type = inbound
            .event
            .ok_or(WebhookError::MissingHeader("X-GitHub-Event"))?;
        let delivery_id = inbound
            .delivery_id
            .ok_or(WebhookError::MissingHeader("X-GitHub-Delivery"))?;
        let signature = inbound.signature.ok_or(WebhookError::InvalidSignature)?;
        verify_signature(&self.secret, inbound.body, signature)?;

        let body: serde_json::Value =
            serde_json::from_slice(inbound.body).map_err(WebhookError::MalformedPayload)?;
        self.metrics
            .increment(names::WEBHOOKS_RECEIVED, &[("event", event_type)]);

        let event = match classify(event_type, body)? {
            Ok(event) => event,
            Err(reason) => {
                debug!(delivery_id, event = event_type, reason, "delivery ignored");
                return Ok(RouteOutcome::Ignored(reason));
            }
        };

        if !self.log.claim(delivery_id) {
            debug!(delivery_id, event = event_type, "duplicate delivery");
            return Ok(RouteOutcome::Duplicate);
        }
        Ok(RouteOutcome::Accepted(Delivery {
            id: delivery_id.to_string(),
            event_type: event_type.to_string(),
            event,
        }))
    }
}

fn parse<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, WebhookError> {
    serde_json::from_value(body).map_err(WebhookError::MalformedPayload)
}

/// Map an event to its pipeline, or say why it is dropped.
pub fn classify(
    event_type: &str,
    body: serde_json::Value,
) -> Result<Result<RoutedEvent, &'static str>, WebhookError> {
    let routed = match event_type {
        "pull_request" => {
            let event: PullRequestEvent = parse(body)?;
            let key = WorkUnitKey::pull_request(
                event.repository.full_name,
                event.pull_request.number,
            );
            let action = match event.action.as_str() {
                "opened" | "synchronize" | "reopened" if event.pull_request.draft => {
                    return Ok(Err("draft pull request"));
                }
                "opened" | "synchronize" | "reopened" | "ready_for_review" => PrAction::Analyze,
                "closed" => PrAction::Closed,
                _ => return Ok(Err("pull request action not handled")),
            };
            RoutedEvent::PullRequest { key, action }
        }
        "issues" => {
            let event: IssuesEvent = parse(body)?;
            if event.issue.pull_request.is_some() {
                return Ok(Err("issue event for a pull request"));
            }
            let key = WorkUnitKey::issue(event.repository.full_name, event.issue.number);
            let action = match event.action.as_str() {
                "opened" | "reopened" | "edited" => IssueAction::Analyze,
                "closed" => IssueAction::Closed,
                _ => return Ok(Err("issue action not handled")),
            };
            RoutedEvent::Issue { key, action }
        }
        "issue_comment" => {
            let event: IssueCommentEvent = parse(body)?;
            let kind = if event.issue.pull_request.is_some() {
                EntityKind::PullRequest
            } else {
                EntityKind::Issue
            };
            let key = WorkUnitKey {
                repository: event.repository.full_name,
                kind,
                number: event.issue.number,
            };
            match command_event(key, &event.action, &event.comment) {
                Ok(routed) => routed,
                Err(reason) => return Ok(Err(reason)),
            }
        }
        "pull_request_review_comment" => {
            let event: ReviewCommentEvent = parse(body)?;
            let key = WorkUnitKey::pull_request(
                event.repository.full_name,
                event.pull_request.number,
            );
            match command_event(key, &event.action, &event.comment) {
                Ok(routed) => routed,
                Err(reason) => return Ok(Err(reason)),
            }
        }
        "ping" => return Ok(Err("ping")),
        _ => return Ok(Err("event type not handled")),
    };
    Ok(Ok(routed))
}

fn command_event(
    key: WorkUnitKey,
    action: &str,
    comment: &payload::Comment,
) -> Result<RoutedEvent, &'static str> {
    if action != "created" {
        return Err("comment action not handled");
    }
    if comment.user.is_bot() {
        return Err("comment authored by a bot");
    }
    let command = command::parse(&comment.body, key.kind).ok_or("no command in comment")?;
    Ok(RoutedEvent::Command {
        key,
        command,
        author: comment.user.login.clone(),
    })
}
