use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::errors::WebhookError;
use crate::metrics::InMemoryMetrics;
use crate::webhook::{InboundDelivery, RouteOutcome};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: Arc<Engine>,
    pub metrics: Arc<InMemoryMetrics>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::InvalidSignature => ApiError::Unauthorized(err.to_string()),
            WebhookError::MissingHeader(_) | WebhookError::MalformedPayload(_) => {
                ApiError::BadRequest(err.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/webhook", post(receive_webhook))
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/agents", get(list_agents))
        .route("/tasks", get(list_tasks))
        .route("/metrics", get(metrics_snapshot))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn receive_webhook(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let inbound = InboundDelivery {
        event: header(&headers, "x-github-event"),
        delivery_id: header(&headers, "x-github-delivery"),
        signature: header(&headers, "x-hub-signature-256"),
        body: &body,
    };
    let outcome = state.engine.accept(inbound).map_err(|e| {
        warn!(
            delivery_id = inbound.delivery_id.unwrap_or("-"),
            error = %e,
            "webhook rejected"
        );
        ApiError::from(e)
    })?;

    let response = match outcome {
        RouteOutcome::Accepted(delivery) => {
            let id = delivery.id.clone();
            let engine = Arc::clone(&state.engine);
            tokio::spawn(async move { engine.process(delivery).await });
            (
                StatusCode::ACCEPTED,
                Json(json!({"status": "accepted", "delivery": id})),
            )
                .into_response()
        }
        RouteOutcome::Duplicate => {
            (StatusCode::OK, Json(json!({"status": "duplicate"}))).into_response()
        }
        RouteOutcome::Ignored(reason) => {
            debug!(reason, "webhook ignored");
            (
                StatusCode::OK,
                Json(json!({"status": "ignored", "reason": reason})),
            )
                .into_response()
        }
    };
    Ok(response)
}

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let registry = state.engine.registry();
    Json(json!({
        "status": "ok",
        "agents": registry.len(),
        "dead_letter": state.engine.dead_letter().len(),
    }))
}

async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.engine.status())
}

async fn list_agents(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.engine.registry().snapshot())
}

async fn list_tasks(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.engine.active_tasks())
}

async fn metrics_snapshot(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::dead_letter::{DeadLetterConfig, DeadLetterQueue};
    use crate::delegator::circuit_breaker::CircuitBreakerConfig;
    use crate::engine::EngineSettings;
    use crate::models::{Agent, TaskType, WorkUnitKey};
    use crate::registry::AgentRegistry;
    use crate::testing::{FakePlatform, ScriptedAgentClient, pr_context};
    use crate::webhook::sign;

    const SECRET: &str = "api-secret";

    struct TestApp {
        router: Router,
        platform: Arc<FakePlatform>,
        engine: Arc<Engine>,
    }

    fn test_app() -> TestApp {
        let platform = Arc::new(FakePlatform::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let registry = Arc::new(AgentRegistry::with_agents(
            vec![
                Agent::new("code-1", TaskType::CodeReview, "http://code"),
                Agent::new("test-1", TaskType::Testing, "http://test"),
            ],
            CircuitBreakerConfig::default(),
        ));
        let engine = Arc::new(Engine::new(
            EngineSettings {
                webhook_secret: SECRET.into(),
                ..EngineSettings::default()
            },
            platform.clone(),
            registry,
            Arc::new(ScriptedAgentClient::new()),
            Arc::new(DeadLetterQueue::new(DeadLetterConfig::default(), metrics.clone())),
            metrics.clone(),
        ));
        let state = Arc::new(AppState {
            engine: engine.clone(),
            metrics,
        });
        TestApp {
            router: api_router().with_state(state),
            platform,
            engine,
        }
    }

    fn pr_opened(number: u64) -> String {
        json!({
            "action": "opened",
            "pull_request": {"number": number, "draft": false},
            "repository": {"full_name": "octo/repo"},
        })
        .to_string()
    }

    fn webhook(event: &str, delivery: &str, body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header("x-github-event", event)
            .header("x-github-delivery", delivery);
        if let Some(sig) = signature {
            builder = builder.header("x-hub-signature-256", sig);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["agents"], 2);
    }

    #[tokio::test]
    async fn test_webhook_rejects_missing_signature() {
        let app = test_app();
        let resp = app
            .router
            .oneshot(webhook("pull_request", "d-1", &pr_opened(1), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_signature() {
        let app = test_app();
        let body = pr_opened(1);
        let resp = app
            .router
            .oneshot(webhook(
                "pull_request",
                "d-1",
                &body,
                Some(sign("wrong-secret", body.as_bytes()).unwrap()),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_webhook_rejects_malformed_json() {
        let app = test_app();
        let body = "{not json";
        let resp = app
            .router
            .oneshot(webhook(
                "pull_request",
                "d-1",
                body,
                Some(sign(SECRET, body.as_bytes()).unwrap()),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_missing_event_header() {
        let app = test_app();
        let body = pr_opened(1);
        let req = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("x-github-delivery", "d-1")
            .header("x-hub-signature-256", sign(SECRET, body.as_bytes()).unwrap())
            .body(Body::from(body))
            .unwrap();
        let resp = app.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_webhook_accepts_then_acknowledges_duplicate() {
        let app = test_app();
        app.platform.insert_pull_request(pr_context("octo/repo", 1));
        let body = pr_opened(1);

        let resp = app
            .router
            .clone()
            .oneshot(webhook(
                "pull_request",
                "d-1",
                &body,
                Some(sign(SECRET, body.as_bytes()).unwrap()),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(resp).await["delivery"], "d-1");

        let resp = app
            .router
            .oneshot(webhook(
                "pull_request",
                "d-1",
                &body,
                Some(sign(SECRET, body.as_bytes()).unwrap()),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "duplicate");

        // the spawned pipeline eventually reports
        let key = WorkUnitKey::pull_request("octo/repo", 1);
        for _ in 0..100 {
            if !app.platform.comments(&key).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(app.platform.comments(&key).len(), 1);
    }

    #[tokio::test]
    async fn test_ping_is_ignored() {
        let app = test_app();
        let body = json!({"zen": "Keep it logically awesome."}).to_string();
        let resp = app
            .router
            .oneshot(webhook("ping", "d-ping", &body, Some(sign(SECRET, body.as_bytes()).unwrap())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ignored");
    }

    #[tokio::test]
    async fn test_status_agents_and_tasks() {
        let app = test_app();

        let req = Request::builder().uri("/status").body(Body::empty()).unwrap();
        let resp = app.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["agents"]["online"], 2);
        assert_eq!(json["dead_letter"], 0);
        assert_eq!(json["tasks"]["pending"], 0);

        let req = Request::builder().uri("/agents").body(Body::empty()).unwrap();
        let resp = app.router.clone().oneshot(req).await.unwrap();
        let json = body_json(resp).await;
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[0]["circuit"]["state"], "closed");

        let req = Request::builder().uri("/tasks").body(Body::empty()).unwrap();
        let resp = app.router.oneshot(req).await.unwrap();
        let json = body_json(resp).await;
        assert!(json.as_array().unwrap().is_empty());
        assert!(app.engine.active_tasks().is_empty());
    }
}
