use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};

use crate::runtime::types::{Batch, BatchId, BatchView, RuntimeError, Task, TaskId, TaskStatus};

/// Job-side bookkeeping kept next to a task, never shown to clients.
#[derive(Debug, Clone, Default)]
pub(crate) struct JobControl {
    /// Set once a start path owns the task; later starts are refused.
    pub claimed: bool,
    /// Cancel switch of the running job. Present only while `processing`.
    pub cancel_tx: Option<Arc<watch::Sender<bool>>>,
}

impl JobControl {
    pub fn cancel_requested(&self) -> bool {
        self.cancel_tx.as_ref().is_some_and(|tx| *tx.borrow())
    }
}

#[derive(Debug)]
struct TaskRecord {
    task: Task,
    control: JobControl,
}

impl TaskRecord {
    fn new(task: Task) -> Self {
        Self {
            task,
            control: JobControl::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    tasks: HashMap<TaskId, TaskRecord>,
    batches: HashMap<BatchId, Batch>,
}

/// Centralized, thread-safe state for all tasks and batches.
///
/// Uses a `tokio::sync::RwLock` so status queries can read concurrently while
/// the job that owns a task writes its transitions. Every mutation goes
/// through [`TaskStore::update`], which validates the transition and bumps the
/// owning batch's counters inside the same write lock. Cancel switches live in
/// the same records, so a cancel and the terminal transition never interleave.
///
/// Nothing is persisted; the registry lives as long as the process.
#[derive(Debug, Clone)]
pub struct TaskStore {
    inner: Arc<RwLock<Registry>>,
    /// Bumped after every committed task mutation.
    changes: Arc<watch::Sender<u64>>,
}

impl TaskStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(Registry::default())),
            changes: Arc::new(changes),
        }
    }

    /// Register a freshly created task. Ids are never reused.
    pub async fn put(&self, task: Task) -> Result<(), RuntimeError> {
        let mut guard = self.inner.write().await;
        if let Some(existing) = guard.tasks.get(&task.id) {
            return Err(RuntimeError::Conflict {
                id: existing.task.id,
                status: existing.task.status,
            });
        }
        guard.tasks.insert(task.id, TaskRecord::new(task));
        Ok(())
    }

    /// Return a snapshot of the task.
    pub async fn get(&self, id: TaskId) -> Result<Task, RuntimeError> {
        self.inner
            .read()
            .await
            .tasks
            .get(&id)
            .map(|record| record.task.clone())
            .ok_or(RuntimeError::TaskNotFound(id))
    }

    /// Apply `mutator` to the task atomically.
    ///
    /// The mutator works on a copy; the copy is committed only if the mutator
    /// succeeds and the result is a legal forward transition with consistent
    /// output/error fields. A task entering a terminal state is counted on its
    /// batch before the lock is released.
    pub async fn update<T>(
        &self,
        id: TaskId,
        mutator: impl FnOnce(&mut Task) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        self.update_with_control(id, |task, _| mutator(task)).await
    }

    /// [`TaskStore::update`] that also sees the task's [`JobControl`].
    ///
    /// Control changes are committed together with the task or not at all.
    pub(crate) async fn update_with_control<T>(
        &self,
        id: TaskId,
        mutator: impl FnOnce(&mut Task, &mut JobControl) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let mut guard = self.inner.write().await;
        let Registry { tasks, batches } = &mut *guard;
        let record = tasks.get_mut(&id).ok_or(RuntimeError::TaskNotFound(id))?;
        let current = &record.task;

        let mut next = current.clone();
        let mut control = record.control.clone();
        let out = mutator(&mut next, &mut control)?;

        let legal = next.status == current.status || current.status.can_advance_to(next.status);
        let same_identity = next.id == current.id && next.batch_id == current.batch_id;
        if !legal || !next.is_consistent() || !same_identity {
            return Err(RuntimeError::Conflict {
                id,
                status: current.status,
            });
        }

        if !current.status.is_terminal() && next.status.is_terminal() {
            if let Some(batch) = next.batch_id.and_then(|b| batches.get_mut(&b)) {
                match next.status {
                    TaskStatus::Completed => batch.completed_count += 1,
                    TaskStatus::Failed => batch.failed_count += 1,
                    _ => {}
                }
            }
        }
        record.task = next;
        record.control = control;
        drop(guard);

        self.changes.send_modify(|version| *version += 1);
        Ok(out)
    }

    /// Reserve an `uploaded` task for one start path.
    pub(crate) async fn claim(&self, id: TaskId) -> Result<(), RuntimeError> {
        self.update_with_control(id, |task, control| {
            if task.status != TaskStatus::Uploaded || control.claimed {
                return Err(RuntimeError::Conflict {
                    id,
                    status: task.status,
                });
            }
            control.claimed = true;
            Ok(())
        })
        .await
    }

    /// Register a batch together with its tasks in one critical section.
    pub async fn put_batch(&self, batch: Batch, tasks: Vec<Task>) -> Result<(), RuntimeError> {
        let mut guard = self.inner.write().await;
        if let Some(dup) = tasks.iter().find(|t| guard.tasks.contains_key(&t.id)) {
            return Err(RuntimeError::Conflict {
                id: dup.id,
                status: dup.status,
            });
        }
        for task in tasks {
            guard.tasks.insert(task.id, TaskRecord::new(task));
        }
        guard.batches.insert(batch.id, batch);
        Ok(())
    }

    /// Flip the batch to started and claim its unclaimed tasks.
    ///
    /// Returns the claimed ids in submission order. Tasks already started on
    /// their own are left to that start.
    pub async fn mark_batch_started(&self, id: BatchId) -> Result<Vec<TaskId>, RuntimeError> {
        let mut guard = self.inner.write().await;
        let Registry { tasks, batches } = &mut *guard;
        let batch = batches.get_mut(&id).ok_or(RuntimeError::BatchNotFound(id))?;
        if batch.started {
            return Err(RuntimeError::BatchAlreadyStarted { id });
        }
        batch.started = true;

        let mut claimed = Vec::with_capacity(batch.task_ids.len());
        for task_id in &batch.task_ids {
            let Some(record) = tasks.get_mut(task_id) else {
                continue;
            };
            if record.task.status == TaskStatus::Uploaded && !record.control.claimed {
                record.control.claimed = true;
                claimed.push(*task_id);
            }
        }
        Ok(claimed)
    }

    /// Tasks of a batch in submission order.
    pub async fn list_by_batch(&self, batch_id: BatchId) -> Result<Vec<Task>, RuntimeError> {
        Ok(self.batch_view(batch_id).await?.tasks)
    }

    /// Consistent snapshot of a batch and all of its tasks.
    pub async fn batch_view(&self, id: BatchId) -> Result<BatchView, RuntimeError> {
        let guard = self.inner.read().await;
        let batch = guard.batches.get(&id).ok_or(RuntimeError::BatchNotFound(id))?;
        let tasks: Vec<Task> = batch
            .task_ids
            .iter()
            .filter_map(|tid| guard.tasks.get(tid).map(|record| record.task.clone()))
            .collect();
        let total = batch.total();
        Ok(BatchView {
            id,
            status: batch.status(),
            started: batch.started,
            total,
            completed_count: batch.completed_count,
            failed_count: batch.failed_count,
            pending_count: total - batch.completed_count - batch.failed_count,
            created_at: batch.created_at,
            tasks,
        })
    }

    pub async fn task_count(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    /// Receiver that changes after every committed task mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Resolve once the task is terminal. Never used on request paths.
    pub async fn wait_terminal(&self, id: TaskId) -> Result<Task, RuntimeError> {
        let mut rx = self.subscribe();
        loop {
            let task = self.get(id).await?;
            if task.status.is_terminal() || rx.changed().await.is_err() {
                return Ok(task);
            }
        }
    }

    /// Resolve once every task of the batch is terminal.
    pub async fn wait_batch_terminal(&self, id: BatchId) -> Result<BatchView, RuntimeError> {
        let mut rx = self.subscribe();
        loop {
            let view = self.batch_view(id).await?;
            if view.status.is_terminal() || rx.changed().await.is_err() {
                return Ok(view);
            }
        }
    }
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new()
    }
}
