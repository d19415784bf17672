//! Batch endpoints: many images, one start, one zip.

use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use splat_core::{BatchImage, BatchStatus, BatchView};
use uuid::Uuid;

use super::{TaskResponse, parse_id};
use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/batch/upload", post(upload))
        .route("/batch/{id}/start", post(start))
        .route("/batch/{id}/status", get(status))
        .route("/batch/{id}/archive", get(archive))
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub started: bool,
    pub total: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub pending_count: usize,
    pub created_at: DateTime<Utc>,
    pub tasks: Vec<TaskResponse>,
}

impl From<BatchView> for BatchResponse {
    fn from(view: BatchView) -> Self {
        Self {
            batch_id: view.id,
            status: view.status,
            started: view.started,
            total: view.total,
            completed_count: view.completed_count,
            failed_count: view.failed_count,
            pending_count: view.pending_count,
            created_at: view.created_at,
            tasks: view.tasks.iter().map(TaskResponse::from).collect(),
        }
    }
}

/// Multipart upload with one or more `files` fields.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ServerError> {
    let mut images = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("files") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_owned)
            .ok_or_else(|| ServerError::BadRequest("`files` field has no filename".into()))?;
        let bytes = field.bytes().await?;
        images.push(BatchImage::new(filename, bytes.to_vec()));
    }

    let batch_id = state.batches.submit(images).await?;
    let view = state.batches.status(batch_id).await?;
    let task_ids: Vec<Uuid> = view.tasks.iter().map(|t| t.id).collect();
    Ok(Json(json!({ "batch_id": batch_id, "task_ids": task_ids })))
}

pub async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    let id = parse_id(&id, "batch")?;
    let task_ids = state.batches.start(id).await?;
    Ok(Json(json!({ "status": "processing", "batch_id": id, "total": task_ids.len() })))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BatchResponse>, ServerError> {
    let id = parse_id(&id, "batch")?;
    Ok(Json(state.batches.status(id).await?.into()))
}

pub async fn archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ServerError> {
    let id = parse_id(&id, "batch")?;
    let bytes = state.batches.package(id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_owned()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"batch-{id}.zip\""),
            ),
        ],
        bytes,
    )
        .into_response())
}
