//! Single-image task endpoints.
//!
//! Upload stores the image, `process` starts the tool, and clients poll
//! `status` until the task is `completed` or `failed`.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::info;

use super::{TaskResponse, parse_id};
use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/upload", post(upload))
        .route("/process/{id}", post(process))
        .route("/status/{id}", get(status))
        .route("/result/{id}", get(result))
        .route("/tasks/{id}/cancel", post(cancel))
}

/// Multipart upload with a single `file` field.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ServerError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_owned)
            .ok_or_else(|| ServerError::BadRequest("`file` field has no filename".into()))?;
        let bytes = field.bytes().await?;
        let task_id = state.jobs.submit(&filename, &bytes).await?;
        return Ok(Json(json!({ "task_id": task_id, "filename": filename })));
    }
    Err(ServerError::BadRequest("multipart field `file` is required".into()))
}

pub async fn process(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    let id = parse_id(&id, "task")?;
    state.jobs.start(id).await?;
    Ok(Json(json!({ "status": "processing", "task_id": id })))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ServerError> {
    let id = parse_id(&id, "task")?;
    let task = state.jobs.status(id).await?;
    Ok(Json(TaskResponse::from(&task)))
}

/// Converted artifact; a `.ply` or `.splat` suffix on the id is ignored.
pub async fn result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ServerError> {
    let raw = id
        .strip_suffix(".ply")
        .or_else(|| id.strip_suffix(".splat"))
        .unwrap_or(&id);
    let id = parse_id(raw, "task")?;
    let artifact = state.jobs.fetch_result(id).await?;
    info!(task_id = %id, size = artifact.bytes.len(), "serving result");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", artifact.file_name),
            ),
        ],
        artifact.bytes,
    )
        .into_response())
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    let id = parse_id(&id, "task")?;
    state.jobs.cancel(id).await?;
    Ok(Json(json!({ "status": "cancelling", "task_id": id })))
}
