use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::errors::AgentCallError;
use crate::models::{Agent, AgentTask, Priority, TaskPayload, TaskResult, TaskType, WorkUnitKey};

/// Body POSTed to an agent endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRequest {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: Priority,
    pub work_unit: WorkUnitKey,
    pub attempt: u32,
    pub context: TaskPayload,
}

impl AgentRequest {
    pub fn from_task(task: &AgentTask) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type,
            priority: task.priority,
            work_unit: task.work_unit.clone(),
            attempt: task.attempt(),
            context: task.payload.clone(),
        }
    }
}

/// Abstraction over the agent wire protocol for testability.
/// Real implementation: `HttpAgentClient`. Test double: `testing::ScriptedAgentClient`.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// One request/response exchange. Timeouts are imposed by the caller.
    async fn execute(&self, agent: &Agent, request: &AgentRequest)
    -> Result<TaskResult, AgentCallError>;

    async fn health(&self, agent: &Agent) -> Result<(), AgentCallError>;
}

/// Agent client speaking JSON over HTTP.
#[derive(Clone, Default)]
pub struct HttpAgentClient {
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

/// Map a non-success status onto the client/server split.
pub fn classify_status(status: u16, body: String) -> AgentCallError {
    if (400..500).contains(&status) {
        AgentCallError::Client { status, body }
    } else {
        AgentCallError::Server { status, body }
    }
}

/// Decode an agent response body and check it belongs to `task_id`.
pub fn decode_result(task_id: Uuid, body: &str) -> Result<TaskResult, AgentCallError> {
    let result: TaskResult = serde_json::from_str(body)
        .map_err(|e| AgentCallError::MalformedResponse(e.to_string()))?;
    if result.task_id != task_id {
        return Err(AgentCallError::MalformedResponse(format!(
            "response for task {} while waiting on {}",
            result.task_id, task_id
        )));
    }
    Ok(result)
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn execute(
        &self,
        agent: &Agent,
        request: &AgentRequest,
    ) -> Result<TaskResult, AgentCallError> {
        debug!(agent = %agent.id, task_id = %request.id, "posting task to agent");
        let response = self
            .client
            .post(&agent.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| AgentCallError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AgentCallError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), body));
        }
        decode_result(request.id, &body)
    }

    async fn health(&self, agent: &Agent) -> Result<(), AgentCallError> {
        let url = format!("{}/health", agent.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentCallError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_status(status.as_u16(), body))
        }
    }
}
