pub mod batches;
pub mod tasks;

use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use splat_core::{ErrorKind, Task, TaskId, TaskStatus};
use uuid::Uuid;

use crate::error::ServerError;
use crate::state::AppState;

/// Routes nested under `/api`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(tasks::router())
        .merge(batches::router())
}

/// Client-facing view of a task; server paths are never exposed.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: TaskId,
    pub filename: String,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub has_output: bool,
}

impl From<&Task> for TaskResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            filename: task.original_filename.clone(),
            status: task.status,
            error: task.error.as_ref().map(|e| e.message.clone()),
            error_kind: task.error.as_ref().map(|e| e.kind),
            has_output: task.output_path.is_some(),
        }
    }
}

/// Ids that do not parse cannot exist, so they are reported as 404.
pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid, ServerError> {
    Uuid::parse_str(raw).map_err(|_| ServerError::NotFound(format!("{what} {raw} not found")))
}
