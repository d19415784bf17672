use std::io::{Cursor, Write};
use std::path::Path;

use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::runtime::orchestrator::{JobOrchestrator, sanitize_filename, validate_image};
use crate::runtime::types::{Batch, BatchId, BatchView, RuntimeError, TaskId, TaskStatus};

/// One image of a batch submission.
#[derive(Debug, Clone)]
pub struct BatchImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl BatchImage {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

/// Fans a batch out over [`JobOrchestrator`] and packages the finished
/// artifacts. Parallelism is bounded by the orchestrator's worker pool.
#[derive(Clone, Debug)]
pub struct BatchCoordinator {
    jobs: JobOrchestrator,
}

impl BatchCoordinator {
    pub fn new(jobs: JobOrchestrator) -> Self {
        Self { jobs }
    }

    /// Register one `uploaded` task per image under a new batch.
    ///
    /// Every image is validated before anything is written; one bad image
    /// rejects the whole submission.
    pub async fn submit(&self, images: Vec<BatchImage>) -> Result<BatchId, RuntimeError> {
        if images.is_empty() {
            return Err(RuntimeError::InvalidInput("batch contains no images".into()));
        }
        let max_bytes = self.jobs.settings().max_upload_bytes;
        for image in &images {
            validate_image(&image.filename, &image.bytes, max_bytes)?;
        }

        let batch_id = Uuid::new_v4();
        let mut tasks = Vec::with_capacity(images.len());
        for image in &images {
            match self.jobs.stage(&image.filename, &image.bytes, Some(batch_id)).await {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    self.discard_staged(tasks.iter().map(|t| t.input_path.as_path())).await;
                    return Err(e);
                }
            }
        }

        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        let total = task_ids.len();
        self.jobs
            .store()
            .put_batch(Batch::new(batch_id, task_ids), tasks)
            .await?;
        info!(batch_id = %batch_id, total, "batch uploaded");
        Ok(batch_id)
    }

    /// Schedule every task of the batch not already started on its own.
    /// Returns the scheduled ids once scheduled.
    ///
    /// At most `workers` tools run at once; the rest stay `uploaded` until a
    /// slot frees.
    pub async fn start(&self, batch_id: BatchId) -> Result<Vec<TaskId>, RuntimeError> {
        let task_ids = self.jobs.store().mark_batch_started(batch_id).await?;
        info!(
            batch_id = %batch_id,
            scheduled = task_ids.len(),
            workers = self.jobs.pool().capacity(),
            "batch started"
        );

        let jobs = self.jobs.clone();
        let ids = task_ids.clone();
        tokio::spawn(async move {
            let mut set = JoinSet::new();
            for id in ids {
                let jobs = jobs.clone();
                set.spawn(async move { jobs.run_claimed(id).await });
            }
            while let Some(joined) = set.join_next().await {
                if let Err(e) = joined {
                    error!(batch_id = %batch_id, error = %e, "batch job panicked");
                }
            }
            match jobs.store().batch_view(batch_id).await {
                Ok(view) => info!(
                    batch_id = %batch_id,
                    status = %view.status,
                    completed = view.completed_count,
                    failed = view.failed_count,
                    "batch finished"
                ),
                Err(e) => warn!(batch_id = %batch_id, error = %e, "batch vanished"),
            }
        });
        Ok(task_ids)
    }

    pub async fn status(&self, batch_id: BatchId) -> Result<BatchView, RuntimeError> {
        self.jobs.store().batch_view(batch_id).await
    }

    /// Zip every completed artifact of a terminal batch, in submission order.
    pub async fn package(&self, batch_id: BatchId) -> Result<Vec<u8>, RuntimeError> {
        let view = self.jobs.store().batch_view(batch_id).await?;
        if !view.status.is_terminal() {
            return Err(RuntimeError::NotReady(format!(
                "batch {batch_id} is {} ({} of {} done)",
                view.status,
                view.completed_count + view.failed_count,
                view.total
            )));
        }

        let mut entries = Vec::with_capacity(view.completed_count);
        for (i, task) in view.tasks.iter().enumerate() {
            let (TaskStatus::Completed, Some(path)) = (task.status, &task.output_path) else {
                continue;
            };
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("ply");
            let name = archive_entry_name(i + 1, &task.original_filename, ext);
            entries.push((name, tokio::fs::read(path).await?));
        }

        let count = entries.len();
        let bytes = tokio::task::spawn_blocking(move || write_archive(entries)).await??;
        info!(batch_id = %batch_id, entries = count, size = bytes.len(), "batch archive built");
        Ok(bytes)
    }

    async fn discard_staged<'a>(&self, inputs: impl Iterator<Item = &'a Path>) {
        for input in inputs {
            // <work>/<task_id>/input/<name>
            if let Some(task_dir) = input.parent().and_then(Path::parent) {
                if let Err(e) = tokio::fs::remove_dir_all(task_dir).await {
                    warn!(dir = %task_dir.display(), error = %e, "could not remove staged input");
                }
            }
        }
    }
}

/// `{index:03}-{stem}.{ext}` with `index` the 1-based submission position.
pub fn archive_entry_name(index: usize, original_filename: &str, ext: &str) -> String {
    let sanitized = sanitize_filename(original_filename);
    let stem = Path::new(&sanitized)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("image");
    format!("{index:03}-{stem}.{ext}")
}

/// Deflated zip with fixed timestamps, so equal inputs give equal bytes.
fn write_archive(entries: Vec<(String, Vec<u8>)>) -> Result<Vec<u8>, RuntimeError> {
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes) in entries {
        writer.start_file(name, options)?;
        writer.write_all(&bytes)?;
    }
    Ok(writer.finish()?.into_inner())
}
