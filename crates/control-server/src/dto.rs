//! Request/response bodies for the `/v1` HTTP API. Field names and
//! defaults mirror the service's wire contract one-for-one.

use control_db::queries::tasks::EnqueueInput;
use control_db::{clamp_priority, ActiveAssignment, FileOwnership, Task, TaskEvent};
use serde::{Deserialize, Deserializer, Serialize};

fn default_true() -> bool {
    true
}

/// Deserialize `priority` through [`clamp_priority`] rather than relying
/// on `i32`'s own range to reject out-of-range input, per the "priority
/// is clamped, not rejected" resolution.
fn deserialize_clamped_priority<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Ok(clamp_priority(value))
}

#[derive(Debug, Deserialize)]
pub struct RegisterGatewayRequest {
    pub gateway_id: String,
    pub host: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: String,
    pub gateway_id: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub status: Option<String>,
    pub capacity: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct RouteTaskRequest {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub gateway_id: Option<String>,
    pub task_id: Option<String>,
    #[serde(default = "default_true")]
    pub confirmed: bool,
}

#[derive(Debug, Serialize)]
pub struct RouteTaskResponse {
    pub task_id: String,
    pub gateway_id: String,
    pub gateway_host: String,
    pub status: String,
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct QueueTaskRequest {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub task_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_clamped_priority")]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub required_files: Vec<String>,
    pub gateway_id: Option<String>,
}

impl From<QueueTaskRequest> for EnqueueInput {
    fn from(req: QueueTaskRequest) -> Self {
        EnqueueInput {
            action: req.action,
            params: req.params,
            task_id: req.task_id,
            priority: req.priority,
            dependencies: req.dependencies,
            required_files: req.required_files,
            gateway_id: req.gateway_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QueueTaskResponse {
    pub task: Task,
}

#[derive(Debug, Deserialize)]
pub struct ClaimTaskRequest {
    pub worker_id: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimTaskResponse {
    pub claimed: bool,
    pub task: Option<Task>,
}

#[derive(Debug, Deserialize)]
pub struct NextTaskQuery {
    pub agent_id: String,
}

#[derive(Debug, Serialize)]
pub struct NextTaskResponse {
    pub eligible: bool,
    pub agent_id: String,
    pub task: Option<Task>,
}

#[derive(Debug, Deserialize)]
pub struct StartTaskRequest {
    pub worker_id: String,
    pub claim_token: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteTaskRequest {
    pub worker_id: String,
    pub claim_token: String,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct TaskMutationResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseTaskRequest {
    pub worker_id: String,
    pub claim_token: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "default_true")]
    pub back_to_pending: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<Task>,
}

#[derive(Debug, Serialize)]
pub struct FileOwnershipResponse {
    pub ownership: Vec<FileOwnership>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimFileRequest {
    pub task_id: String,
    pub claim_token: String,
    pub file_path: String,
}

#[derive(Debug, Serialize)]
pub struct ClaimFileResponse {
    pub ok: bool,
    pub owner_task_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AgentListResponse {
    pub agents: Vec<ActiveAssignment>,
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub task_id: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<TaskEvent>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub components: std::collections::BTreeMap<String, String>,
}
