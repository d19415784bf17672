//! Image to gaussian-splat job runtime.
//!
//! [`JobOrchestrator`] turns one uploaded image into a point-cloud artifact by
//! running the external generation tool and passing its PLY through the
//! [`codec`]. [`BatchCoordinator`] does the same for many images under a
//! bounded worker pool and zips the results. All state lives in a
//! [`TaskStore`] owned by the caller.

pub mod codec;
mod runtime;

pub use codec::{CodecError, OpacityEncoding, PointCloud, PointRecord, TargetFormat};
pub use runtime::admission::{Permit, WorkerPool};
pub use runtime::batch::{BatchCoordinator, BatchImage, archive_entry_name};
pub use runtime::orchestrator::{
    ALLOWED_EXTENSIONS, Artifact, JobOrchestrator, JobSettings, sanitize_filename, validate_image,
};
pub use runtime::runner::{RunnerError, Termination, ToolCommand, ToolRun, ToolRunner};
pub use runtime::storage::TaskStore;
pub use runtime::types::{
    Batch, BatchId, BatchStatus, BatchView, ErrorKind, MAX_ERROR_MESSAGE_BYTES, RuntimeError, Task,
    TaskFailure, TaskId, TaskStatus,
};
