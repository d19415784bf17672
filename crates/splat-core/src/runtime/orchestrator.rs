use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::ImageFormat;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::codec::{self, CleanReport, OpacityEncoding, TargetFormat};
use crate::runtime::admission::WorkerPool;
use crate::runtime::runner::{Termination, ToolRunner};
use crate::runtime::storage::TaskStore;
use crate::runtime::types::{
    BatchId, ErrorKind, RuntimeError, Task, TaskFailure, TaskId, TaskStatus,
};

/// Lower-cased extensions accepted for uploads.
pub const ALLOWED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Name of the per-task directory handed to the tool as its output dir.
const TOOL_OUTPUT_DIR: &str = "tool-output";

/// Most of the stderr tail that goes into a stored failure message.
const STDERR_IN_MESSAGE: usize = 768;

/// Per-job knobs shared by single and batch submissions.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Root under which every task gets `<task_id>/`.
    pub work_dir: PathBuf,
    pub timeout: Duration,
    pub output_format: TargetFormat,
    /// How the tool's PLY stores opacity.
    pub opacity_encoding: OpacityEncoding,
    /// Fail with `CorruptData` above this fraction of dropped points.
    pub max_dropped_ratio: f64,
    pub max_upload_bytes: usize,
    /// Tool processes allowed to run at once, single and batch tasks alike.
    pub workers: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./uploads"),
            timeout: Duration::from_secs(300),
            output_format: TargetFormat::Ply,
            opacity_encoding: OpacityEncoding::Logit,
            max_dropped_ratio: 0.25,
            max_upload_bytes: 100 * 1024 * 1024,
            workers: 2,
        }
    }
}

/// Converted artifact ready to hand to a client.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub task_id: TaskId,
    /// `<task_id>.<ext>`
    pub file_name: String,
    pub format: TargetFormat,
    pub bytes: Vec<u8>,
}

/// Drives single tasks from `uploaded` to a terminal state.
///
/// Each started task runs on its own tokio task: the external tool, then the
/// decode/clean/encode step on the blocking pool, then the final transition.
/// A task enters `processing` only while it holds a [`WorkerPool`] slot, so
/// at most `workers` tools run at once whichever way tasks were started.
/// Status queries only take a read snapshot of the [`TaskStore`] and never
/// wait on a running job.
#[derive(Clone, Debug)]
pub struct JobOrchestrator {
    settings: Arc<JobSettings>,
    store: TaskStore,
    runner: Arc<ToolRunner>,
    pool: WorkerPool,
}

impl JobOrchestrator {
    pub fn new(settings: JobSettings, runner: ToolRunner, store: TaskStore) -> Self {
        Self {
            pool: WorkerPool::new(settings.workers),
            settings: Arc::new(settings),
            store,
            runner: Arc::new(runner),
        }
    }

    pub fn settings(&self) -> &JobSettings {
        &self.settings
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Validate and store an uploaded image as a new `uploaded` task.
    pub async fn submit(&self, filename: &str, bytes: &[u8]) -> Result<TaskId, RuntimeError> {
        validate_image(filename, bytes, self.settings.max_upload_bytes)?;
        let task = self.stage(filename, bytes, None).await?;
        let id = task.id;
        self.store.put(task).await?;
        info!(task_id = %id, filename, size = bytes.len(), "task uploaded");
        Ok(id)
    }

    /// Write the input under a fresh task directory and build its record.
    ///
    /// The caller validates `bytes` first and registers the returned task.
    pub(crate) async fn stage(
        &self,
        filename: &str,
        bytes: &[u8],
        batch_id: Option<BatchId>,
    ) -> Result<Task, RuntimeError> {
        let id = Uuid::new_v4();
        let input_dir = self.task_dir(id).join("input");
        tokio::fs::create_dir_all(&input_dir).await?;
        let input_path = input_dir.join(sanitize_filename(filename));
        tokio::fs::write(&input_path, bytes).await?;
        Ok(Task::new(id, input_path, filename, batch_id))
    }

    /// Schedule an `uploaded` task. Returns immediately.
    ///
    /// With a free slot the task is `processing` on return; otherwise it stays
    /// `uploaded` until a slot frees. A second start is a `Conflict`.
    pub async fn start(&self, id: TaskId) -> Result<(), RuntimeError> {
        self.store.claim(id).await?;
        let this = self.clone();
        match self.pool.try_acquire() {
            Some(permit) => {
                let cancel = self.begin(id).await?;
                tokio::spawn(async move {
                    this.drive(id, cancel).await;
                    drop(permit);
                });
            }
            None => {
                debug!(
                    task_id = %id,
                    capacity = self.pool.capacity(),
                    available = self.pool.available(),
                    "task queued for a worker slot"
                );
                tokio::spawn(async move { this.run_claimed(id).await });
            }
        }
        Ok(())
    }

    /// Wait for a pool slot, then run a claimed task on this future.
    pub(crate) async fn run_claimed(&self, id: TaskId) {
        let permit = self.pool.acquire().await;
        let cancel = match self.begin(id).await {
            Ok(cancel) => cancel,
            Err(e) => {
                error!(task_id = %id, error = %e, "claimed task could not begin");
                return;
            }
        };
        if permit.is_none() {
            self.finish(
                id,
                Err(TaskFailure::new(ErrorKind::Internal, "worker pool closed")),
            )
            .await;
            return;
        }
        self.drive(id, cancel).await;
        drop(permit);
    }

    pub async fn status(&self, id: TaskId) -> Result<Task, RuntimeError> {
        self.store.get(id).await
    }

    /// Converted artifact of a completed task.
    pub async fn fetch_result(&self, id: TaskId) -> Result<Artifact, RuntimeError> {
        let task = self.store.get(id).await?;
        let path = match (task.status, task.output_path) {
            (TaskStatus::Completed, Some(path)) => path,
            (TaskStatus::Failed, _) => {
                let reason = task.error.map(|e| e.to_string()).unwrap_or_default();
                return Err(RuntimeError::NotReady(format!("task {id} failed: {reason}")));
            }
            (status, _) => {
                return Err(RuntimeError::NotReady(format!("task {id} is {status}")));
            }
        };
        let format = format_of(&path).unwrap_or(self.settings.output_format);
        let bytes = tokio::fs::read(&path).await?;
        Ok(Artifact {
            task_id: id,
            file_name: format!("{id}.{}", format.extension()),
            format,
            bytes,
        })
    }

    /// Kill the tool of a `processing` task; the task ends `failed/Cancelled`.
    ///
    /// Accepted under the store lock, so an accepted cancel always wins over
    /// a conversion that finishes at the same moment.
    pub async fn cancel(&self, id: TaskId) -> Result<(), RuntimeError> {
        self.store
            .update_with_control(id, |task, control| {
                let conflict = RuntimeError::Conflict {
                    id,
                    status: task.status,
                };
                if task.status != TaskStatus::Processing {
                    return Err(conflict);
                }
                let tx = control.cancel_tx.as_ref().ok_or(conflict)?;
                tx.send_replace(true);
                Ok(())
            })
            .await?;
        info!(task_id = %id, "cancellation requested");
        Ok(())
    }

    fn task_dir(&self, id: TaskId) -> PathBuf {
        self.settings.work_dir.join(id.to_string())
    }

    async fn begin(&self, id: TaskId) -> Result<watch::Receiver<bool>, RuntimeError> {
        let (tx, rx) = watch::channel(false);
        self.store
            .update_with_control(id, move |task, control| {
                task.begin_processing()?;
                control.cancel_tx = Some(Arc::new(tx));
                Ok(())
            })
            .await?;
        info!(task_id = %id, "task processing");
        Ok(rx)
    }

    async fn drive(&self, id: TaskId, cancel: watch::Receiver<bool>) {
        let outcome = self.execute(id, cancel).await;
        self.finish(id, outcome).await;
    }

    /// Record the terminal state. A cancel accepted before this point turns a
    /// finished conversion into `failed/Cancelled`.
    async fn finish(&self, id: TaskId, outcome: Result<PathBuf, TaskFailure>) {
        let recorded = self
            .store
            .update_with_control(id, move |task, control| {
                let cancelled = control.cancel_requested();
                control.cancel_tx = None;
                match outcome {
                    Ok(_) if cancelled => {
                        let failure = cancelled_failure();
                        task.fail(failure.clone())?;
                        Ok(Err(failure))
                    }
                    Ok(path) => {
                        task.complete(path.clone())?;
                        Ok(Ok(path))
                    }
                    Err(failure) => {
                        task.fail(failure.clone())?;
                        Ok(Err(failure))
                    }
                }
            })
            .await;
        match recorded {
            Ok(Ok(path)) => info!(task_id = %id, output = %path.display(), "task completed"),
            Ok(Err(failure)) => warn!(
                task_id = %id,
                kind = %failure.kind,
                message = %failure.message,
                "task failed"
            ),
            Err(e) => error!(task_id = %id, error = %e, "could not record task outcome"),
        }
    }

    async fn execute(
        &self,
        id: TaskId,
        cancel: watch::Receiver<bool>,
    ) -> Result<PathBuf, TaskFailure> {
        let task = self.store.get(id).await.map_err(internal)?;
        let task_dir = self.task_dir(id);
        let tool_output = task_dir.join(TOOL_OUTPUT_DIR);

        let run = self
            .runner
            .run(&task.input_path, &tool_output, self.settings.timeout, cancel.clone())
            .await
            .map_err(internal)?;
        match run.termination {
            Termination::Exited(0) => {}
            Termination::Exited(code) => {
                return Err(TaskFailure::new(
                    ErrorKind::ToolExitedNonZero,
                    format!("tool exited with code {code}: {}", stderr_excerpt(&run.stderr_tail)),
                ));
            }
            Termination::Signalled => {
                return Err(TaskFailure::new(
                    ErrorKind::ToolExitedNonZero,
                    format!("tool killed by signal: {}", stderr_excerpt(&run.stderr_tail)),
                ));
            }
            Termination::TimedOut => {
                return Err(TaskFailure::new(
                    ErrorKind::TimedOut,
                    format!("tool exceeded {}s timeout", self.settings.timeout.as_secs_f64()),
                ));
            }
            Termination::Cancelled => return Err(cancelled_failure()),
        }

        let artifact = find_ply(&tool_output).await.map_err(internal)?.ok_or_else(|| {
            TaskFailure::new(
                ErrorKind::MissingOutputArtifact,
                format!("tool exited 0 but left no .ply in {}", tool_output.display()),
            )
        })?;
        let raw = tokio::fs::read(&artifact).await.map_err(internal)?;
        debug!(
            task_id = %id,
            artifact = %artifact.display(),
            size = raw.len(),
            "decoding tool output"
        );

        let settings = Arc::clone(&self.settings);
        let (encoded, report) = tokio::task::spawn_blocking(move || convert(&raw, &settings))
            .await
            .map_err(internal)??;

        if *cancel.borrow() {
            return Err(cancelled_failure());
        }

        let output_path =
            task_dir.join(format!("result.{}", self.settings.output_format.extension()));
        tokio::fs::write(&output_path, encoded).await.map_err(internal)?;
        info!(
            task_id = %id,
            points = report.kept(),
            dropped = report.dropped,
            exit_code = ?run.exit_code(),
            elapsed_ms = run.elapsed.as_millis(),
            "point cloud converted"
        );
        Ok(output_path)
    }
}

/// Parse, clean and re-encode one tool artifact.
fn convert(raw: &[u8], settings: &JobSettings) -> Result<(Vec<u8>, CleanReport), TaskFailure> {
    let cloud = codec::parse(raw, settings.opacity_encoding)?;
    let (cleaned, report) = codec::clean(cloud);
    if report.kept() == 0 {
        return Err(TaskFailure::new(
            ErrorKind::CorruptData,
            format!("no valid points ({} of {} dropped)", report.dropped, report.total),
        ));
    }
    if report.dropped_ratio() > settings.max_dropped_ratio {
        return Err(TaskFailure::new(
            ErrorKind::CorruptData,
            format!(
                "{} of {} points dropped, above the {:.2} limit",
                report.dropped, report.total, settings.max_dropped_ratio
            ),
        ));
    }
    if report.dropped > 0 {
        warn!(dropped = report.dropped, total = report.total, "dropped non-finite points");
    }
    Ok((codec::serialize(&cleaned, settings.output_format), report))
}

/// First `*.ply` (by name) directly under `dir`.
async fn find_ply(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_ply = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("ply"));
        if is_ply && entry.file_type().await?.is_file() {
            found.push(path);
        }
    }
    found.sort();
    Ok(found.into_iter().next())
}

fn format_of(path: &Path) -> Option<TargetFormat> {
    match path.extension()?.to_str()? {
        "ply" => Some(TargetFormat::Ply),
        "splat" => Some(TargetFormat::Compact),
        _ => None,
    }
}

fn cancelled_failure() -> TaskFailure {
    TaskFailure::new(ErrorKind::Cancelled, "cancelled by request")
}

fn internal(e: impl Display) -> TaskFailure {
    TaskFailure::new(ErrorKind::Internal, e.to_string())
}

fn stderr_excerpt(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    let mut start = trimmed.len().saturating_sub(STDERR_IN_MESSAGE);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}

/// Reject anything that is not a non-empty JPEG/PNG within the size limit.
pub fn validate_image(filename: &str, bytes: &[u8], max_bytes: usize) -> Result<(), RuntimeError> {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(RuntimeError::InvalidInput(format!(
            "{filename:?}: unsupported file type, expected one of {ALLOWED_EXTENSIONS:?}"
        )));
    }
    if bytes.is_empty() {
        return Err(RuntimeError::InvalidInput(format!("{filename:?}: empty upload")));
    }
    if bytes.len() > max_bytes {
        return Err(RuntimeError::InvalidInput(format!(
            "{filename:?}: {} bytes exceeds the {max_bytes} byte limit",
            bytes.len()
        )));
    }
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg | ImageFormat::Png) => Ok(()),
        _ => Err(RuntimeError::InvalidInput(format!(
            "{filename:?}: content is not a JPEG or PNG image"
        ))),
    }
}

/// Reduce a client-supplied name to a safe single path component.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "image".to_owned()
    } else {
        cleaned.to_owned()
    }
}
