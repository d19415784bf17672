use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::{AsRefStr, Display};
use thiserror::Error;
use uuid::Uuid;

use crate::codec::CodecError;

/// Unique identifier for a submitted conversion task.
pub type TaskId = Uuid;

/// Unique identifier for a group of tasks submitted together.
pub type BatchId = Uuid;

/// Failure messages stored on a task are cut to this many bytes.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 1024;

/// Lifecycle state of a single task.
///
/// Variants are declared in lifecycle order; a task only ever moves to a
/// state of higher [`rank`](TaskStatus::rank).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
    /// Input stored, waiting for an explicit start.
    Uploaded,
    /// The external tool or the conversion step is running.
    Processing,
    /// Converted artifact is available at `output_path`.
    Completed,
    /// Terminal failure; see `error`.
    Failed,
}

impl TaskStatus {
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Uploaded => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal single step.
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Uploaded, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
        )
    }
}

/// Classification of a stored task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Conflict,
    NotFound,
    TimedOut,
    ToolExitedNonZero,
    /// The tool reported success but left no point-cloud file behind.
    MissingOutputArtifact,
    SchemaMismatch,
    /// Too many points were discarded while cleaning.
    CorruptData,
    Cancelled,
    Internal,
}

/// Kind plus a bounded human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_MESSAGE_BYTES {
            let mut cut = MAX_ERROR_MESSAGE_BYTES;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        Self { kind, message }
    }
}

impl From<CodecError> for TaskFailure {
    fn from(err: CodecError) -> Self {
        TaskFailure::new(ErrorKind::SchemaMismatch, err.to_string())
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The complete in-memory record for one conversion task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Stored copy of the uploaded image.
    pub input_path: PathBuf,
    /// File name as supplied by the client.
    pub original_filename: String,
    /// Set iff `status == Completed`.
    pub output_path: Option<PathBuf>,
    /// Set iff `status == Failed`.
    pub error: Option<TaskFailure>,
    pub batch_id: Option<BatchId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: TaskId,
        input_path: PathBuf,
        original_filename: impl Into<String>,
        batch_id: Option<BatchId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: TaskStatus::Uploaded,
            input_path,
            original_filename: original_filename.into(),
            output_path: None,
            error: None,
            batch_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// `uploaded -> processing`; anything else is a [`RuntimeError::Conflict`].
    pub fn begin_processing(&mut self) -> Result<(), RuntimeError> {
        self.advance(TaskStatus::Processing)
    }

    /// `processing -> completed` with the durable artifact path.
    pub fn complete(&mut self, output_path: PathBuf) -> Result<(), RuntimeError> {
        self.advance(TaskStatus::Completed)?;
        self.output_path = Some(output_path);
        Ok(())
    }

    /// `processing -> failed` with the failure recorded verbatim.
    pub fn fail(&mut self, failure: TaskFailure) -> Result<(), RuntimeError> {
        self.advance(TaskStatus::Failed)?;
        self.error = Some(failure);
        Ok(())
    }

    fn advance(&mut self, next: TaskStatus) -> Result<(), RuntimeError> {
        if !self.status.can_advance_to(next) {
            return Err(RuntimeError::Conflict {
                id: self.id,
                status: self.status,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// The output/error fields agree with the status.
    pub fn is_consistent(&self) -> bool {
        self.output_path.is_some() == (self.status == TaskStatus::Completed)
            && self.error.is_some() == (self.status == TaskStatus::Failed)
    }
}

/// Aggregate state of a batch, derived from its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatchStatus {
    Processing,
    Completed,
    Partial,
    Failed,
}

impl BatchStatus {
    /// Pure function of the child counters.
    pub fn from_counts(total: usize, completed: usize, failed: usize) -> Self {
        if total == 0 || completed + failed < total {
            BatchStatus::Processing
        } else if failed == 0 {
            BatchStatus::Completed
        } else if completed == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Partial
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Processing)
    }
}

/// Stored batch record. Counters are only touched by the store, in the same
/// critical section as the child task's terminal transition.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    /// Submission order.
    pub task_ids: Vec<TaskId>,
    pub completed_count: usize,
    pub failed_count: usize,
    pub started: bool,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(id: BatchId, task_ids: Vec<TaskId>) -> Self {
        Self {
            id,
            task_ids,
            completed_count: 0,
            failed_count: 0,
            started: false,
            created_at: Utc::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.task_ids.len()
    }

    pub fn status(&self) -> BatchStatus {
        BatchStatus::from_counts(self.total(), self.completed_count, self.failed_count)
    }
}

/// A read-only snapshot of a batch and its tasks returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct BatchView {
    pub id: BatchId,
    pub status: BatchStatus,
    pub started: bool,
    pub total: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub pending_count: usize,
    pub created_at: DateTime<Utc>,
    /// Submission order.
    pub tasks: Vec<Task>,
}

/// Errors returned to callers of the runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Rejected before any task was created.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The operation does not apply to the current state.
    #[error("conflict: {id} is {status}")]
    Conflict { id: Uuid, status: TaskStatus },

    #[error("batch {id} already started")]
    BatchAlreadyStarted { id: BatchId },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// The result or archive is not available yet.
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// A blocking worker panicked or was cancelled.
    #[error("worker join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RuntimeError {
    /// Classification shared with stored task failures.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::InvalidInput(_) => ErrorKind::InvalidInput,
            RuntimeError::Conflict { .. }
            | RuntimeError::BatchAlreadyStarted { .. }
            | RuntimeError::NotReady(_) => ErrorKind::Conflict,
            RuntimeError::TaskNotFound(_) | RuntimeError::BatchNotFound(_) => ErrorKind::NotFound,
            RuntimeError::Io(_) | RuntimeError::Archive(_) | RuntimeError::Join(_) => {
                ErrorKind::Internal
            }
        }
    }
}
