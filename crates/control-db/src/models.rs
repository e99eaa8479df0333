use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Task status
// ---------------------------------------------------------------------------

/// Canonical status of a task.
///
/// `FromStr` also accepts the legacy aliases `pending` (-> `Queued`) and
/// `completed` (-> `Succeeded`) seen in older callers, but `Display` and
/// `sqlx::Type` encoding only ever produce the canonical spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Released,
    FailedTimeout,
}

impl TaskStatus {
    /// Ready to be claimed.
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Queued | Self::Released)
    }

    /// Currently owned by a worker (locked).
    pub fn is_active(self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }

    /// No further transition is legal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::FailedTimeout)
    }

    /// Whether `self -> to` is a legal state-machine edge.
    pub fn can_transition_to(self, to: Self) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Queued | Released, Claimed)
                | (Claimed, Running | Released | Failed | FailedTimeout)
                | (Running, Succeeded | Failed | Released | FailedTimeout)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Released => "released",
            Self::FailedTimeout => "failed_timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "queued" | "pending" => Ok(Self::Queued),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "succeeded" | "completed" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "released" => Ok(Self::Released),
            "failed_timeout" => Ok(Self::FailedTimeout),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

/// Parse a status string, applying the `pending`/`completed` aliases.
/// Unknown strings normalize to an arbitrary lowercase string rather than
/// erroring, matching the source's permissive `_normalize_status`; callers
/// that need strict validation should use [`TaskStatus::from_str`] directly.
pub fn normalize_status(status: &str) -> String {
    match TaskStatus::from_str(status) {
        Ok(canonical) => canonical.to_string(),
        Err(_) => status.trim().to_ascii_lowercase(),
    }
}

/// Clamp a priority value to the `i32` range rather than rejecting it.
/// `priority` has no explicit bound in the source; out-of-range input is
/// clamped on ingest instead of failing the request.
pub fn clamp_priority(value: f64) -> i32 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

// ---------------------------------------------------------------------------
// Row structs (raw DB shape) and domain structs (JSON columns decoded)
// ---------------------------------------------------------------------------

/// Raw row as stored in `control_tasks`. JSON-bearing columns are TEXT.
#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub action: String,
    pub params: String,
    pub status: String,
    pub priority: i32,
    pub dependencies: String,
    pub dependents: String,
    pub required_files: String,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub claim_token: Option<String>,
    pub gateway_id: Option<String>,
    pub result: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A task as exposed to the rest of the system and over HTTP: JSON columns
/// decoded, status canonicalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub action: String,
    pub params: serde_json::Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub required_files: Vec<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub claim_token: Option<String>,
    pub gateway_id: Option<String>,
    pub result: serde_json::Value,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

fn parse_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn parse_json_object(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({}))
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        let status = TaskStatus::from_str(&row.status).unwrap_or(TaskStatus::Queued);
        Task {
            id: row.id,
            action: row.action,
            params: parse_json_object(&row.params),
            status,
            priority: row.priority,
            dependencies: parse_json_list(&row.dependencies),
            dependents: parse_json_list(&row.dependents),
            required_files: parse_json_list(&row.required_files),
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            claim_token: row.claim_token,
            gateway_id: row.gateway_id,
            result: parse_json_object(&row.result),
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

/// Append-only row in `control_task_events`.
#[derive(Debug, Clone, FromRow)]
pub struct TaskEventRow {
    pub id: i64,
    pub task_id: String,
    pub event_type: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub worker_id: Option<String>,
    pub claim_token: Option<String>,
    pub message: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// A task event as exposed to callers, with `payload` decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: String,
    pub event_type: String,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub worker_id: Option<String>,
    pub claim_token: Option<String>,
    pub message: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<TaskEventRow> for TaskEvent {
    fn from(row: TaskEventRow) -> Self {
        TaskEvent {
            id: row.id,
            task_id: row.task_id,
            event_type: row.event_type,
            from_status: row.from_status,
            to_status: row.to_status,
            worker_id: row.worker_id,
            claim_token: row.claim_token,
            message: row.message,
            payload: parse_json_object(&row.payload),
            created_at: row.created_at,
        }
    }
}

/// A row in `control_task_file_ownership`: `file_path` is the primary key
/// and the exclusivity primitive.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileOwnership {
    pub file_path: String,
    pub owning_task: String,
    pub claim_token: Option<String>,
    pub claimed_at: DateTime<Utc>,
}

/// One row of the active-assignments read model: an active task joined
/// against its claiming worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActiveAssignment {
    pub task_id: String,
    pub action: String,
    pub status: String,
    pub agent_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub gateway_id: Option<String>,
    pub claim_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Best-effort mirror of a worker's last-known state in `workers`.
/// Authoritative locking always lives on the task row; this table exists
/// purely for the optional read-model mirror described in the registry
/// design.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerRow {
    pub id: String,
    pub provider_name: String,
    pub status: String,
    pub capabilities: String,
    pub metadata: String,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMirror {
    pub id: String,
    pub provider_name: String,
    pub status: String,
    pub capabilities: Vec<String>,
    pub metadata: serde_json::Value,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WorkerRow> for WorkerMirror {
    fn from(row: WorkerRow) -> Self {
        WorkerMirror {
            id: row.id,
            provider_name: row.provider_name,
            status: row.status,
            capabilities: parse_json_list(&row.capabilities),
            metadata: parse_json_object(&row.metadata),
            last_heartbeat: row.last_heartbeat,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
