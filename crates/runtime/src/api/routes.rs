//! HTTP route handlers for the control plane.
//!
//! Authentication and TLS are an upstream proxy's concern; handlers accept
//! every request. Store and validation failures map to 400, missing records
//! to 404, run conflicts to 409, everything else to a logged 500.

use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;

use crate::scheduler::payload::TaskPayload;
use crate::scheduler::runner::TaskRunner;
use crate::scheduler::task_store::{StoreError, TemplateEntry, TemplatePayload};
use crate::scheduler::types::{format_stamp, local_now, Task, TriggerReason};

use super::types::{
    AccountsMeta, AccountsResponse, BatchRequest, BatchResponse, DeletedResponse, ErrorResponse,
    FsEntry, FsListResponse, FsQuery, FsWriteBody, FsWriteResponse, HealthResponse, ImportResponse,
    ListResponse, PurgedResponse, QueuedResponse, ResultsQuery, TaskDetail, TogglePayload,
};
use super::AppState;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message)))
}

fn not_found(message: impl Into<String>) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new(message)))
}

fn conflict(message: impl Into<String>) -> ApiError {
    (StatusCode::CONFLICT, Json(ErrorResponse::new(message)))
}

fn internal() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("internal server error")),
    )
}

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::Sqlite(_) | StoreError::Decode(_) => {
            tracing::error!("store error: {err}");
            internal()
        }
        other => bad_request(other.to_string()),
    }
}

// ── System ────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let task_count = state.store.count_tasks().await.map_err(store_error)?;
    Ok(Json(HealthResponse {
        time: format_stamp(&local_now()),
        task_count,
    }))
}

pub async fn list_accounts(State(state): State<AppState>) -> Json<AccountsResponse> {
    Json(AccountsResponse {
        data: state.accounts.list_allowed(),
        meta: AccountsMeta {
            posix_supported: state.accounts.posix_supported(),
            default_account: state.accounts.default_account().to_string(),
        },
    })
}

// ── Tasks ─────────────────────────────────────────────────────────────

async fn with_latest_result(state: &AppState, task: Task) -> Result<TaskDetail, ApiError> {
    let latest_result = state
        .store
        .get_latest_result(task.id)
        .await
        .map_err(store_error)?;
    Ok(TaskDetail {
        task,
        latest_result,
    })
}

pub async fn list_tasks(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<TaskDetail>>, ApiError> {
    let tasks = state.store.list_tasks().await.map_err(store_error)?;
    let mut data = Vec::with_capacity(tasks.len());
    for task in tasks {
        data.push(with_latest_result(&state, task).await?);
    }
    Ok(Json(ListResponse { data }))
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(payload): Json<TaskPayload>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state
        .store
        .create_task(&payload)
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskDetail>, ApiError> {
    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("task not found"))?;
    Ok(Json(with_latest_result(&state, task).await?))
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Json(payload): Json<TaskPayload>,
) -> Result<Json<Task>, ApiError> {
    let task = state
        .store
        .update_task(task_id, &payload)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("task not found"))?;
    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<DeletedResponse>, ApiError> {
    if !state.store.delete_task(task_id).await.map_err(store_error)? {
        return Err(not_found("task not found"));
    }
    Ok(Json(DeletedResponse { deleted: true }))
}

/// Manual dispatch; the same gates the engine applies at tick time.
pub async fn run_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<QueuedResponse>, ApiError> {
    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("task not found"))?;
    if state
        .store
        .has_running_instance(task_id)
        .await
        .map_err(store_error)?
    {
        return Err(conflict("task is running"));
    }
    if !state
        .store
        .dependencies_met(&task)
        .await
        .map_err(store_error)?
    {
        return Err(bad_request("dependencies are not met"));
    }
    TaskRunner::spawn(
        state.store.clone(),
        task,
        TriggerReason::Manual,
        state.engine.config().task_timeout,
    );
    Ok(Json(QueuedResponse { queued: true }))
}

pub async fn toggle_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    body: String,
) -> Result<Json<Task>, ApiError> {
    // An empty body means "flip the current state".
    let payload: TogglePayload = if body.trim().is_empty() {
        TogglePayload::default()
    } else {
        serde_json::from_str(&body).map_err(|_| bad_request("Invalid JSON"))?
    };
    let task = state
        .store
        .get_task(task_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("task not found"))?;
    let target = payload.is_active.unwrap_or(!task.is_active);
    let updated = state
        .store
        .update_task(task_id, &TaskPayload::set_active(target))
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("task not found"))?;
    Ok(Json(updated))
}

pub async fn batch_tasks(
    State(state): State<AppState>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    let action = request
        .action
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    if !matches!(action.as_str(), "delete" | "enable" | "disable" | "run") {
        return Err(bad_request("action is not supported"));
    }

    let raw_ids = request
        .task_ids
        .filter(|ids| !ids.is_empty())
        .ok_or_else(|| bad_request("task_ids cannot be empty"))?;
    let mut task_ids: Vec<i64> = Vec::new();
    for raw in raw_ids {
        let id = match raw {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| bad_request("task_ids must contain valid task ids"))?;
        if id > 0 && !task_ids.contains(&id) {
            task_ids.push(id);
        }
    }
    if task_ids.is_empty() {
        return Err(bad_request("task_ids must contain valid task ids"));
    }

    let mut result: BTreeMap<&'static str, Vec<i64>> = BTreeMap::new();
    result.insert("missing", Vec::new());

    for task_id in task_ids {
        let Some(task) = state.store.get_task(task_id).await.map_err(store_error)? else {
            result.entry("missing").or_default().push(task_id);
            continue;
        };

        match action.as_str() {
            "delete" => {
                if state.store.delete_task(task_id).await.map_err(store_error)? {
                    result.entry("deleted").or_default().push(task_id);
                } else {
                    result.entry("missing").or_default().push(task_id);
                }
            }
            "enable" | "disable" => {
                let target = action == "enable";
                if task.is_active == target {
                    result.entry("unchanged").or_default().push(task_id);
                    continue;
                }
                state
                    .store
                    .update_task(task_id, &TaskPayload::set_active(target))
                    .await
                    .map_err(store_error)?;
                result.entry("updated").or_default().push(task_id);
            }
            "run" => {
                if state
                    .store
                    .has_running_instance(task_id)
                    .await
                    .map_err(store_error)?
                {
                    result.entry("running").or_default().push(task_id);
                    continue;
                }
                if !state
                    .store
                    .dependencies_met(&task)
                    .await
                    .map_err(store_error)?
                {
                    result.entry("blocked").or_default().push(task_id);
                    continue;
                }
                TaskRunner::spawn(
                    state.store.clone(),
                    task,
                    TriggerReason::Manual,
                    state.engine.config().task_timeout,
                );
                result.entry("queued").or_default().push(task_id);
            }
            _ => unreachable!("action validated above"),
        }
    }

    Ok(Json(BatchResponse { action, result }))
}

// ── Results ───────────────────────────────────────────────────────────

pub async fn list_results(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<ListResponse<crate::scheduler::types::TaskResult>>, ApiError> {
    let data = state
        .store
        .fetch_results(task_id, query.limit, query.offset)
        .await
        .map_err(store_error)?;
    Ok(Json(ListResponse { data }))
}

pub async fn purge_results(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> Result<Json<PurgedResponse>, ApiError> {
    let deleted = state
        .store
        .delete_results(task_id, None)
        .await
        .map_err(store_error)?;
    Ok(Json(PurgedResponse { deleted }))
}

pub async fn purge_result(
    State(state): State<AppState>,
    Path((task_id, result_id)): Path<(i64, i64)>,
) -> Result<Json<PurgedResponse>, ApiError> {
    let deleted = state
        .store
        .delete_results(task_id, Some(result_id))
        .await
        .map_err(store_error)?;
    Ok(Json(PurgedResponse { deleted }))
}

// ── Templates ─────────────────────────────────────────────────────────

pub async fn list_templates(
    State(state): State<AppState>,
) -> Result<Json<ListResponse<crate::scheduler::types::Template>>, ApiError> {
    let data = state.store.list_templates().await.map_err(store_error)?;
    Ok(Json(ListResponse { data }))
}

pub async fn create_template(
    State(state): State<AppState>,
    Json(payload): Json<TemplatePayload>,
) -> Result<(StatusCode, Json<crate::scheduler::types::Template>), ApiError> {
    let template = state
        .store
        .create_template(&payload)
        .await
        .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn get_template(
    State(state): State<AppState>,
    Path(template_id): Path<i64>,
) -> Result<Json<crate::scheduler::types::Template>, ApiError> {
    let template = state
        .store
        .get_template(template_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("template not found"))?;
    Ok(Json(template))
}

pub async fn update_template(
    State(state): State<AppState>,
    Path(template_id): Path<i64>,
    Json(payload): Json<TemplatePayload>,
) -> Result<Json<crate::scheduler::types::Template>, ApiError> {
    let template = state
        .store
        .update_template(template_id, &payload)
        .await
        .map_err(store_error)?
        .ok_or_else(|| not_found("template not found"))?;
    Ok(Json(template))
}

pub async fn delete_template(
    State(state): State<AppState>,
    Path(template_id): Path<i64>,
) -> Result<Json<DeletedResponse>, ApiError> {
    if !state
        .store
        .delete_template(template_id)
        .await
        .map_err(store_error)?
    {
        return Err(not_found("template not found"));
    }
    Ok(Json(DeletedResponse { deleted: true }))
}

pub async fn export_templates(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, TemplateEntry>>, ApiError> {
    let mapping = state.store.export_templates().await.map_err(store_error)?;
    Ok(Json(mapping))
}

pub async fn import_templates(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<ImportResponse>, ApiError> {
    let serde_json::Value::Object(entries) = payload else {
        return Err(bad_request("import data should be an object mapping"));
    };
    let mut invalid_keys = Vec::new();
    let mut mapping = BTreeMap::new();
    for (key, value) in entries {
        let script_body = value
            .get("script_body")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if script_body.is_empty() {
            invalid_keys.push(key);
            continue;
        }
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or(&key)
            .to_string();
        mapping.insert(
            key,
            TemplateEntry {
                name,
                script_body: script_body.to_string(),
            },
        );
    }
    if !invalid_keys.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "invalid template entries".to_string(),
                invalid_keys: Some(invalid_keys),
            }),
        ));
    }
    let imported = state
        .store
        .import_templates(&mapping)
        .await
        .map_err(store_error)?;
    Ok(Json(ImportResponse { imported }))
}

// ── Server-local filesystem ───────────────────────────────────────────

/// Resolve the requested path: `X-FS-Path` header wins over the query
/// parameter; relative paths are anchored at the working directory.
fn resolve_fs_path(headers: &HeaderMap, query: &FsQuery) -> PathBuf {
    let raw = headers
        .get("x-fs-path")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.path.clone())
        .unwrap_or_else(|| "/".to_string());
    let raw = if raw.is_empty() { "/".to_string() } else { raw };
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    }
}

pub async fn fs_list(
    State(_state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FsQuery>,
) -> Result<Json<FsListResponse>, ApiError> {
    let target = resolve_fs_path(&headers, &query);
    let metadata = tokio::fs::metadata(&target)
        .await
        .map_err(|_| not_found("path not found"))?;
    if !metadata.is_dir() {
        return Err(bad_request("not a directory"));
    }
    let mut reader = tokio::fs::read_dir(&target)
        .await
        .map_err(fs_error)?;
    let mut files = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(fs_error)? {
        let isdir = entry
            .file_type()
            .await
            .map(|file_type| file_type.is_dir())
            .unwrap_or(false);
        files.push(FsEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path().to_string_lossy().into_owned(),
            isdir,
        });
    }
    files.sort_by(|a, b| {
        (!a.isdir, a.name.to_lowercase()).cmp(&(!b.isdir, b.name.to_lowercase()))
    });
    Ok(Json(FsListResponse { files }))
}

pub async fn fs_read(
    State(_state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let target = resolve_fs_path(&headers, &query);
    let metadata = tokio::fs::metadata(&target)
        .await
        .map_err(|_| not_found("file not found"))?;
    if !metadata.is_file() {
        return Err(bad_request("not a file"));
    }
    let bytes = tokio::fs::read(&target).await.map_err(fs_error)?;
    // Non-UTF-8 content falls back to latin-1, which maps every byte to a
    // codepoint and round-trips exactly.
    let text = String::from_utf8(bytes)
        .unwrap_or_else(|err| err.into_bytes().iter().map(|&b| b as char).collect());
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    ))
}

pub async fn fs_write(
    State(_state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FsQuery>,
    Json(body): Json<FsWriteBody>,
) -> Result<Json<FsWriteResponse>, ApiError> {
    let target = resolve_fs_path(&headers, &query);
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() && tokio::fs::metadata(parent).await.is_err() {
            tokio::fs::create_dir_all(parent).await.map_err(|_| {
                bad_request("parent directory missing and cannot be created")
            })?;
        }
    }
    tokio::fs::write(&target, body.content.as_bytes())
        .await
        .map_err(fs_error)?;
    Ok(Json(FsWriteResponse {
        written: true,
        path: target.to_string_lossy().into_owned(),
    }))
}

fn fs_error(err: std::io::Error) -> ApiError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("permission denied")),
        );
    }
    tracing::error!("filesystem error: {err}");
    internal()
}
