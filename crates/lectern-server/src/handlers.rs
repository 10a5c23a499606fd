use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use lectern_assistant::{CloseTaskPayload, QueryTaskPayload, CLOSE_TASK, QUERY_TASK};
use lectern_core::ids::{SessionId, TaskId};
use lectern_core::webhook::WebhookConfig;
use lectern_queue::{TaskExecutor, TaskStatusReport};
use lectern_store::sessions::{SessionRecord, SessionRepo, SessionStatus};
use lectern_store::StoreError;

use crate::error::ApiError;

const SESSION_NOT_FOUND: &str = "Session not found";
const SESSION_LOCKED: &str = "Session is locked, no more files can be uploaded";

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRepo>,
    pub executor: Arc<TaskExecutor>,
    pub upload_dir: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_path: String,
    pub session_id: SessionId,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub session_id: String,
    pub prompts: Vec<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

#[derive(Debug, Serialize)]
pub struct TaskAccepted {
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Accept a multipart document upload, store it under
/// `{upload_dir}/{session_id}/{filename}`, and record the path on the
/// session. Creates the session when no id is supplied.
#[instrument(skip(state, multipart))]
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file: Option<(String, axum::body::Bytes)> = None;
    let mut session_id: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        match field.name() {
            Some("file") => {
                let name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::Validation("file part requires a filename".into()))?;
                let data = field.bytes().await?;
                file = Some((name, data));
            }
            Some("session_id") => session_id = Some(field.text().await?),
            _ => {}
        }
    }

    let (filename, data) =
        file.ok_or_else(|| ApiError::Validation("file part is required".into()))?;
    // Strip any directory components a client might smuggle in
    let filename = Path::new(&filename)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ApiError::Validation("invalid filename".into()))?
        .to_string();

    let session = resolve_session(&state.sessions, session_id)?;
    if session.status == SessionStatus::Locked {
        return Err(ApiError::Validation(SESSION_LOCKED.into()));
    }

    let dir = state.upload_dir.join(session.id.as_str());
    tokio::fs::create_dir_all(&dir).await?;
    let dest = dir.join(&filename);
    tokio::fs::write(&dest, &data).await?;
    let file_path = dest.to_string_lossy().into_owned();

    match state.sessions.append_local_path(&session.id, &file_path) {
        Ok(()) => {}
        // The session can lock between the status check and the append
        Err(StoreError::Conflict(_)) => return Err(ApiError::Validation(SESSION_LOCKED.into())),
        Err(StoreError::NotFound(_)) => return Err(ApiError::NotFound(SESSION_NOT_FOUND.into())),
        Err(e) => return Err(e.into()),
    }

    info!(session_id = %session.id, file_path, "file uploaded");
    Ok(Json(UploadResponse {
        file_path,
        session_id: session.id,
    }))
}

/// Enqueue a query task against a session. Returns 202 with the task id;
/// the answer is retrieved through `get_task`.
#[instrument(skip(state, req), fields(session_id = %req.session_id))]
pub async fn query_files(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    if req.prompts.is_empty() || req.prompts.iter().all(|p| p.trim().is_empty()) {
        return Err(ApiError::Validation("Input query is required".into()));
    }

    let session_id = SessionId::from_raw(req.session_id);
    match state.sessions.get(&session_id) {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => {
            return Err(ApiError::Validation("Invalid session".into()));
        }
        Err(e) => return Err(e.into()),
    }

    let payload = QueryTaskPayload {
        session_id: session_id.clone(),
        prompts: req.prompts,
        instructions: req.instructions,
        webhook: req.webhook,
    };
    let payload = serde_json::to_value(&payload)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let task_id = state.executor.submit(QUERY_TASK, &payload)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id,
            session_id: Some(session_id),
        }),
    ))
}

/// Enqueue a close task unconditionally; a missing session fails inside the
/// task, not here.
#[instrument(skip(state))]
pub async fn close_session(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let payload = CloseTaskPayload {
        session_id: SessionId::from_raw(id),
    };
    let payload = serde_json::to_value(&payload)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let task_id = state.executor.submit(CLOSE_TASK, &payload)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_id,
            session_id: None,
        }),
    ))
}

pub async fn get_task(
    State(state): State<AppState>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<TaskStatusReport>, ApiError> {
    match state.executor.status(&TaskId::from_raw(id)) {
        Ok(report) => Ok(Json(report)),
        Err(StoreError::NotFound(_)) => Err(ApiError::NotFound("Task not found".into())),
        Err(e) => Err(e.into()),
    }
}

fn resolve_session(
    sessions: &SessionRepo,
    session_id: Option<String>,
) -> Result<SessionRecord, ApiError> {
    match session_id {
        Some(raw) => match sessions.get(&SessionId::from_raw(raw)) {
            Ok(session) => Ok(session),
            Err(StoreError::NotFound(_)) => Err(ApiError::NotFound(SESSION_NOT_FOUND.into())),
            Err(e) => Err(e.into()),
        },
        None => Ok(sessions.create()?),
    }
}
