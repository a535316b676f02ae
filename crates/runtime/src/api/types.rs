//! Request and response shapes for the HTTP control plane.

use serde::{Deserialize, Serialize};

use crate::scheduler::types::{Task, TaskResult};

/// Error body returned on every failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Offending template keys on import validation failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_keys: Option<Vec<String>>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            invalid_keys: None,
        }
    }
}

/// `GET /api/health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub time: String,
    pub task_count: i64,
}

/// `GET /api/accounts`
#[derive(Debug, Clone, Serialize)]
pub struct AccountsResponse {
    pub data: Vec<String>,
    pub meta: AccountsMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountsMeta {
    pub posix_supported: bool,
    pub default_account: String,
}

/// Generic list wrapper: `{"data": [...]}`.
#[derive(Debug, Clone, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

/// Task annotated with its most recent result.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub latest_result: Option<TaskResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueuedResponse {
    pub queued: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletedResponse {
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgedResponse {
    pub deleted: usize,
}

/// `POST /api/tasks/{id}/toggle` body; omitted body flips the current state.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TogglePayload {
    pub is_active: Option<bool>,
}

/// Paging for result listings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResultsQuery {
    pub limit: i64,
    pub offset: i64,
}

impl Default for ResultsQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// `POST /api/tasks/batch` body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BatchRequest {
    pub action: Option<String>,
    pub task_ids: Option<Vec<serde_json::Value>>,
}

/// `POST /api/tasks/batch` response: ids bucketed by outcome.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub action: String,
    pub result: std::collections::BTreeMap<&'static str, Vec<i64>>,
}

/// `POST /api/templates/import` response.
#[derive(Debug, Clone, Serialize)]
pub struct ImportResponse {
    pub imported: crate::scheduler::task_store::ImportSummary,
}

/// Path selector for the fs endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FsQuery {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsEntry {
    pub name: String,
    pub path: String,
    pub isdir: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsListResponse {
    pub files: Vec<FsEntry>,
}

/// `POST /api/fs/write` body.
#[derive(Debug, Clone, Deserialize)]
pub struct FsWriteBody {
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FsWriteResponse {
    pub written: bool,
    pub path: String,
}
