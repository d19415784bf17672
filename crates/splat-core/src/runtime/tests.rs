#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use tokio::task::JoinSet;
    use tracing_test::traced_test;
    use uuid::Uuid;

    use crate::codec::fixtures::{ply_bytes, records};
    use crate::codec::{self, OpacityEncoding};
    use crate::runtime::admission::WorkerPool;
    use crate::runtime::batch::{BatchCoordinator, BatchImage};
    use crate::runtime::orchestrator::{JobOrchestrator, JobSettings};
    use crate::runtime::runner::{ToolCommand, ToolRunner};
    use crate::runtime::storage::TaskStore;
    use crate::runtime::types::{
        Batch, BatchStatus, ErrorKind, MAX_ERROR_MESSAGE_BYTES, RuntimeError, Task, TaskFailure,
        TaskStatus,
    };

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR fake image body";
    const FIXTURE_POINTS: usize = 32;
    const WAIT: Duration = Duration::from_secs(20);

    fn scratch() -> PathBuf {
        std::env::temp_dir().join(format!("splat_runtime_test_{}", Uuid::new_v4()))
    }

    /// Orchestrator and coordinator wired to a fake `sh -c` tool.
    ///
    /// Inside `script`, `$1` is the input image, `$2` the output dir and
    /// `FIXTURE` expands to a well-formed PLY of [`FIXTURE_POINTS`] points.
    struct Harness {
        work: PathBuf,
        jobs: JobOrchestrator,
        batches: BatchCoordinator,
    }

    impl Harness {
        fn new(script: &str, timeout: Duration, workers: usize) -> Self {
            Self::with_settings(script, workers, |s| s.timeout = timeout)
        }

        fn with_settings(
            script: &str,
            workers: usize,
            tweak: impl FnOnce(&mut JobSettings),
        ) -> Self {
            let work = scratch();
            std::fs::create_dir_all(&work).unwrap();
            let fixture = work.join("fixture.ply");
            std::fs::write(&fixture, ply_bytes(&records(FIXTURE_POINTS))).unwrap();

            let script = script.replace("FIXTURE", &format!("'{}'", fixture.display()));
            let runner = ToolRunner::new(
                ToolCommand::new(
                    "sh",
                    vec!["-c", script.as_str(), "fake-tool", "{input}", "{output_dir}"],
                ),
                4096,
            );
            let mut settings = JobSettings {
                work_dir: work.clone(),
                workers,
                ..JobSettings::default()
            };
            tweak(&mut settings);
            let jobs = JobOrchestrator::new(settings, runner, TaskStore::new());
            let batches = BatchCoordinator::new(jobs.clone());
            Self {
                work,
                jobs,
                batches,
            }
        }

        fn store(&self) -> &TaskStore {
            self.jobs.store()
        }

        async fn run_single(&self, name: &str) -> Task {
            let id = self.jobs.submit(name, PNG).await.unwrap();
            self.jobs.start(id).await.unwrap();
            tokio::time::timeout(WAIT, self.store().wait_terminal(id))
                .await
                .expect("task should finish")
                .unwrap()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.work).ok();
        }
    }

    const COPY_FIXTURE: &str = "cp FIXTURE \"$2/out.ply\"";
    const OK_BY_NAME: &str =
        "case \"${1##*/}\" in *ok*) cp FIXTURE \"$2/out.ply\" ;; *) echo boom >&2; exit 2 ;; esac";

    // ── Store ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn store_rejects_illegal_transitions() {
        let store = TaskStore::new();
        let id = Uuid::new_v4();
        store.put(Task::new(id, "in.png".into(), "in.png", None)).await.unwrap();

        let err = store
            .update(id, |t| t.complete("out.ply".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Conflict { status: TaskStatus::Uploaded, .. }));

        store.update(id, |t| t.begin_processing()).await.unwrap();
        assert!(store.update(id, |t| t.begin_processing()).await.is_err());

        // Backward moves and inconsistent fields are refused even if forced.
        let err = store
            .update(id, |t| {
                t.status = TaskStatus::Uploaded;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = store
            .update(id, |t| {
                t.status = TaskStatus::Completed;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        store
            .update(id, |t| t.fail(TaskFailure::new(ErrorKind::Internal, "x")))
            .await
            .unwrap();
        let task = store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.is_consistent());
        assert!(store.update(id, |t| t.complete("late.ply".into())).await.is_err());

        let unknown = Uuid::new_v4();
        assert!(matches!(store.get(unknown).await, Err(RuntimeError::TaskNotFound(_))));
        assert_eq!(store.task_count().await, 1, "reads never create entries");
    }

    #[tokio::test]
    async fn batch_counters_follow_terminal_transitions() {
        let store = TaskStore::new();
        let batch_id = Uuid::new_v4();
        let tasks: Vec<Task> = (0..3)
            .map(|i| {
                let name = format!("{i}.png");
                Task::new(Uuid::new_v4(), name.clone().into(), name, Some(batch_id))
            })
            .collect();
        let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
        store.put_batch(Batch::new(batch_id, ids.clone()), tasks).await.unwrap();

        let listed: Vec<_> = store.list_by_batch(batch_id).await.unwrap();
        assert_eq!(listed.iter().map(|t| t.id).collect::<Vec<_>>(), ids);
        assert_eq!(listed[2].original_filename, "2.png");
        assert!(matches!(
            store.list_by_batch(Uuid::new_v4()).await,
            Err(RuntimeError::BatchNotFound(_))
        ));

        let view = store.batch_view(batch_id).await.unwrap();
        assert_eq!((view.status, view.pending_count), (BatchStatus::Processing, 3));

        assert!(matches!(
            store.mark_batch_started(batch_id).await,
            Ok(ref started) if *started == ids
        ));
        assert!(matches!(
            store.mark_batch_started(batch_id).await,
            Err(RuntimeError::BatchAlreadyStarted { .. })
        ));

        for (i, id) in ids.iter().enumerate() {
            store.update(*id, |t| t.begin_processing()).await.unwrap();
            if i < 2 {
                let failure = TaskFailure::new(ErrorKind::ToolExitedNonZero, "exit 1");
                store.update(*id, |t| t.fail(failure)).await.unwrap();
            } else {
                store.update(*id, |t| t.complete("r.ply".into())).await.unwrap();
            }
            let view = store.batch_view(batch_id).await.unwrap();
            assert!(view.completed_count + view.failed_count <= view.total);
            assert_eq!(view.completed_count + view.failed_count, i + 1);
        }

        let view = store.batch_view(batch_id).await.unwrap();
        assert_eq!(view.status, BatchStatus::Partial);
        assert_eq!((view.completed_count, view.failed_count, view.pending_count), (1, 2, 0));
        let order: Vec<_> = view.tasks.iter().map(|t| t.id).collect();
        assert_eq!(order, ids);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_are_not_lost() {
        const N: usize = 64;
        let store = TaskStore::new();
        let batch_id = Uuid::new_v4();
        let tasks: Vec<Task> = (0..N)
            .map(|i| Task::new(Uuid::new_v4(), "in.png".into(), format!("{i}.png"), Some(batch_id)))
            .collect();
        let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
        store.put_batch(Batch::new(batch_id, ids.clone()), tasks).await.unwrap();

        let mut set = JoinSet::new();
        for (i, id) in ids.iter().copied().enumerate() {
            let store = store.clone();
            set.spawn(async move {
                store.update(id, |t| t.begin_processing()).await.unwrap();
                tokio::task::yield_now().await;
                if i % 3 == 0 {
                    let failure = TaskFailure::new(ErrorKind::TimedOut, "slow");
                    store.update(id, |t| t.fail(failure)).await.unwrap();
                } else {
                    store.update(id, |t| t.complete("r.ply".into())).await.unwrap();
                }
                // A late second outcome is refused and not counted.
                assert!(store.update(id, |t| t.complete("late.ply".into())).await.is_err());
            });
        }
        while let Some(joined) = set.join_next().await {
            joined.unwrap();
        }

        let failed = (0..N).filter(|i| i % 3 == 0).count();
        let view = store.batch_view(batch_id).await.unwrap();
        assert_eq!(view.failed_count, failed);
        assert_eq!(view.completed_count, N - failed);
        assert_eq!(view.pending_count, 0);
        let listed = store.list_by_batch(batch_id).await.unwrap();
        let completed = listed.iter().filter(|t| t.status == TaskStatus::Completed).count();
        assert_eq!(completed, view.completed_count);
        assert!(listed.iter().all(Task::is_consistent));
    }

    #[test]
    fn batch_status_is_a_function_of_counts() {
        assert_eq!(BatchStatus::from_counts(3, 1, 1), BatchStatus::Processing);
        assert_eq!(BatchStatus::from_counts(3, 1, 2), BatchStatus::Partial);
        assert_eq!(BatchStatus::from_counts(3, 0, 3), BatchStatus::Failed);
        assert_eq!(BatchStatus::from_counts(3, 3, 0), BatchStatus::Completed);
    }

    #[test]
    fn views_serialize_with_snake_case_states() {
        let mut task = Task::new(Uuid::new_v4(), "in.png".into(), "in.png", None);
        task.begin_processing().unwrap();
        task.fail(TaskFailure::new(ErrorKind::ToolExitedNonZero, "exit 2")).unwrap();
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "tool_exited_non_zero");
        assert_eq!(json["output_path"], serde_json::Value::Null);
        assert_eq!(serde_json::to_value(BatchStatus::Partial).unwrap(), "partial");
    }

    #[test]
    fn failure_messages_are_cut_on_char_boundaries() {
        let failure = TaskFailure::new(ErrorKind::Internal, "é".repeat(MAX_ERROR_MESSAGE_BYTES));
        assert!(failure.message.len() <= MAX_ERROR_MESSAGE_BYTES);
        assert!(failure.message.chars().all(|c| c == 'é'));
    }

    // ── Worker pool ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let p1 = pool.try_acquire().expect("first slot");
        let _p2 = pool.acquire().await.expect("second slot");
        assert!(pool.try_acquire().is_none(), "third slot must wait");
        assert_eq!(pool.available(), 0);
        drop(p1);
        assert!(pool.try_acquire().is_some(), "slot after release");
        assert_eq!(WorkerPool::new(0).capacity(), 1);
    }

    // ── Single tasks ──────────────────────────────────────────────────────────

    #[cfg(unix)]
    #[tokio::test]
    #[traced_test]
    async fn task_completes_and_result_is_fetchable() {
        let h = Harness::new(&format!("sleep 0.2; {COPY_FIXTURE}"), Duration::from_secs(10), 2);
        let id = h.jobs.submit("photo.png", PNG).await.unwrap();

        let task = h.jobs.status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Uploaded);
        assert!(task.input_path.starts_with(&h.work));
        assert!(matches!(h.jobs.fetch_result(id).await, Err(RuntimeError::NotReady(_))));

        h.jobs.start(id).await.unwrap();
        assert_eq!(h.jobs.status(id).await.unwrap().status, TaskStatus::Processing);
        let err = h.jobs.start(id).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Conflict { .. }), "no double spawn");

        let task = tokio::time::timeout(WAIT, h.store().wait_terminal(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        let output = task.output_path.clone().unwrap();
        assert_eq!(output, h.work.join(id.to_string()).join("result.ply"));

        let artifact = h.jobs.fetch_result(id).await.unwrap();
        assert_eq!(artifact.file_name, format!("{id}.ply"));
        let cloud = codec::parse(&artifact.bytes, OpacityEncoding::Logit).unwrap();
        assert_eq!(cloud.len(), FIXTURE_POINTS);

        assert!(matches!(h.jobs.start(id).await, Err(RuntimeError::Conflict { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn compact_output_is_written_when_configured() {
        let h = Harness::with_settings(COPY_FIXTURE, 1, |s| {
            s.output_format = codec::TargetFormat::Compact;
        });
        let task = h.run_single("photo.jpg.png").await;
        assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        let artifact = h.jobs.fetch_result(task.id).await.unwrap();
        assert!(artifact.file_name.ends_with(".splat"));
        assert_eq!(&artifact.bytes[..4], codec::COMPACT_MAGIC);
        assert_eq!(
            artifact.bytes.len(),
            codec::COMPACT_HEADER_LEN + FIXTURE_POINTS * codec::COMPACT_STRIDE
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    #[traced_test]
    async fn tool_failures_are_classified() {
        let cases = [
            ("echo 'model missing' >&2; exit 3", ErrorKind::ToolExitedNonZero),
            ("kill -9 $$", ErrorKind::ToolExitedNonZero),
            ("true", ErrorKind::MissingOutputArtifact),
            ("printf 'garbage' > \"$2/out.ply\"", ErrorKind::SchemaMismatch),
        ];
        for (script, kind) in cases {
            let h = Harness::new(script, Duration::from_secs(10), 1);
            let task = h.run_single("in.png").await;
            assert_eq!(task.status, TaskStatus::Failed, "{script}");
            let failure = task.error.clone().unwrap();
            assert_eq!(failure.kind, kind, "{script}: {}", failure.message);
            assert!(task.output_path.is_none());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_reaches_the_failure_message() {
        let h = Harness::new("echo 'CUDA not available' >&2; exit 1", Duration::from_secs(10), 1);
        let task = h.run_single("in.png").await;
        let failure = task.error.unwrap();
        assert!(failure.message.contains("code 1"), "{}", failure.message);
        assert!(failure.message.contains("CUDA not available"), "{}", failure.message);
    }

    #[cfg(unix)]
    #[tokio::test]
    #[traced_test]
    async fn slow_tool_times_out() {
        let h = Harness::new("sleep 10", Duration::from_secs(1), 1);
        let started = Instant::now();
        let task = h.run_single("in.png").await;
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap().kind, ErrorKind::TimedOut);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn running_task_can_be_cancelled() {
        let h = Harness::new("sleep 10", Duration::from_secs(30), 1);
        let id = h.jobs.submit("in.png", PNG).await.unwrap();
        assert!(matches!(h.jobs.cancel(id).await, Err(RuntimeError::Conflict { .. })));

        h.jobs.start(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.jobs.cancel(id).await.unwrap();

        let task = tokio::time::timeout(Duration::from_secs(5), h.store().wait_terminal(id))
            .await
            .expect("cancel should end the task promptly")
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap().kind, ErrorKind::Cancelled);
        assert!(matches!(h.jobs.cancel(id).await, Err(RuntimeError::Conflict { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn observed_statuses_never_go_backwards() {
        let h = Harness::new(&format!("sleep 0.5; {COPY_FIXTURE}"), Duration::from_secs(10), 1);
        let id = h.jobs.submit("in.png", PNG).await.unwrap();
        let mut seen = vec![h.jobs.status(id).await.unwrap().status];
        h.jobs.start(id).await.unwrap();

        let deadline = Instant::now() + WAIT;
        loop {
            let status = h.jobs.status(id).await.unwrap().status;
            seen.push(status);
            if status.is_terminal() || Instant::now() > deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen.windows(2).all(|w| w[0].rank() <= w[1].rank()), "{seen:?}");
        assert!(seen.contains(&TaskStatus::Processing), "{seen:?}");
        assert_eq!(seen.last(), Some(&TaskStatus::Completed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn single_starts_share_the_worker_pool() {
        let h = Harness::new(&format!("sleep 0.6; {COPY_FIXTURE}"), Duration::from_secs(10), 1);
        let first = h.jobs.submit("first.png", PNG).await.unwrap();
        let second = h.jobs.submit("second.png", PNG).await.unwrap();

        h.jobs.start(first).await.unwrap();
        h.jobs.start(second).await.unwrap();
        assert_eq!(h.jobs.status(first).await.unwrap().status, TaskStatus::Processing);
        assert_eq!(h.jobs.status(second).await.unwrap().status, TaskStatus::Uploaded);
        assert_eq!(h.jobs.pool().available(), 0);
        assert!(matches!(
            h.jobs.start(second).await,
            Err(RuntimeError::Conflict { status: TaskStatus::Uploaded, .. })
        ));
        assert!(matches!(h.jobs.cancel(second).await, Err(RuntimeError::Conflict { .. })));

        for id in [first, second] {
            let task = tokio::time::timeout(WAIT, h.store().wait_terminal(id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
        }
        assert_eq!(h.jobs.pool().available(), 1);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let h = Harness::new("true", Duration::from_secs(1), 1);
        let id = Uuid::new_v4();
        assert_eq!(h.jobs.status(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(h.jobs.start(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(h.jobs.fetch_result(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(h.jobs.cancel(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(h.batches.status(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(h.batches.package(id).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn invalid_upload_creates_nothing() {
        let h = Harness::new("true", Duration::from_secs(1), 1);
        let err = h.jobs.submit("notes.txt", b"hello").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(h.store().task_count().await, 0);
    }

    // ── Batches ───────────────────────────────────────────────────────────────

    fn images(names: &[&str]) -> Vec<BatchImage> {
        names.iter().map(|n| BatchImage::new(*n, PNG)).collect()
    }

    #[cfg(unix)]
    #[tokio::test]
    #[traced_test]
    async fn batch_with_two_failures_is_partial() {
        let h = Harness::new(OK_BY_NAME, Duration::from_secs(10), 2);
        let batch_id = h
            .batches
            .submit(images(&["a_bad.png", "b_bad.png", "c_ok.png"]))
            .await
            .unwrap();
        let view = h.batches.status(batch_id).await.unwrap();
        assert!(!view.started);
        assert!(view.tasks.iter().all(|t| t.status == TaskStatus::Uploaded));

        h.batches.start(batch_id).await.unwrap();
        assert!(matches!(
            h.batches.start(batch_id).await,
            Err(RuntimeError::BatchAlreadyStarted { .. })
        ));

        let view = tokio::time::timeout(WAIT, h.store().wait_batch_terminal(batch_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.status, BatchStatus::Partial);
        assert_eq!((view.completed_count, view.failed_count), (1, 2));
        let statuses: Vec<_> = view.tasks.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            [TaskStatus::Failed, TaskStatus::Failed, TaskStatus::Completed]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn uniform_batches_are_completed_or_failed() {
        for (names, expected) in [
            (["a_ok.png", "b_ok.png"], BatchStatus::Completed),
            (["a_bad.png", "b_bad.png"], BatchStatus::Failed),
        ] {
            let h = Harness::new(OK_BY_NAME, Duration::from_secs(10), 2);
            let batch_id = h.batches.submit(images(&names)).await.unwrap();
            h.batches.start(batch_id).await.unwrap();
            let view = tokio::time::timeout(WAIT, h.store().wait_batch_terminal(batch_id))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(view.status, expected);
            assert_eq!(view.completed_count + view.failed_count, view.total);
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn archive_holds_completed_artifacts_in_submission_order() {
        // The first image finishes last.
        let script = "case \"${1##*/}\" in *first*) sleep 0.5 ;; esac; \
                      case \"${1##*/}\" in *ok*) cp FIXTURE \"$2/out.ply\" ;; *) exit 1 ;; esac";
        let h = Harness::new(script, Duration::from_secs(10), 3);
        let batch_id = h
            .batches
            .submit(images(&["first_ok.png", "second_bad.jpg", "third ok.png"]))
            .await
            .unwrap();
        h.batches.start(batch_id).await.unwrap();
        tokio::time::timeout(WAIT, h.store().wait_batch_terminal(batch_id))
            .await
            .unwrap()
            .unwrap();

        let bytes = h.batches.package(batch_id).await.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_owned())
            .collect();
        assert_eq!(names, ["001-first_ok.ply", "003-third_ok.ply"]);

        let mut entry = archive.by_index(0).unwrap();
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut content).unwrap();
        assert_eq!(
            codec::parse(&content, OpacityEncoding::Logit).unwrap().len(),
            FIXTURE_POINTS
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pool_limits_running_tools() {
        let h = Harness::new(&format!("sleep 0.6; {COPY_FIXTURE}"), Duration::from_secs(10), 1);
        let batch_id = h
            .batches
            .submit(images(&["a.png", "b.png", "c.png"]))
            .await
            .unwrap();
        h.batches.start(batch_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let view = h.batches.status(batch_id).await.unwrap();
        let count = |s: TaskStatus| view.tasks.iter().filter(|t| t.status == s).count();
        assert_eq!(count(TaskStatus::Processing), 1);
        assert_eq!(count(TaskStatus::Uploaded), 2);
        assert!(matches!(
            h.batches.package(batch_id).await,
            Err(RuntimeError::NotReady(_))
        ));

        let view = tokio::time::timeout(WAIT, h.store().wait_batch_terminal(batch_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.status, BatchStatus::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn started_batch_tasks_cannot_be_started_again() {
        let h = Harness::new(&format!("sleep 1; {COPY_FIXTURE}"), Duration::from_secs(10), 1);
        let batch_id = h.batches.submit(images(&["a.png", "b.png"])).await.unwrap();
        let ids: Vec<_> = h
            .store()
            .list_by_batch(batch_id)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        h.batches.start(batch_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The queued task belongs to the batch; starting it again must not
        // run a second tool next to the first.
        assert!(matches!(
            h.jobs.start(ids[1]).await,
            Err(RuntimeError::Conflict { status: TaskStatus::Uploaded, .. })
        ));
        let view = h.batches.status(batch_id).await.unwrap();
        let processing = view
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Processing)
            .count();
        assert_eq!(processing, 1);
        assert_eq!(h.jobs.pool().available(), 0);

        let view = tokio::time::timeout(WAIT, h.store().wait_batch_terminal(batch_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.status, BatchStatus::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn batch_start_skips_tasks_started_on_their_own() {
        let h = Harness::new(COPY_FIXTURE, Duration::from_secs(10), 2);
        let batch_id = h.batches.submit(images(&["a.png", "b.png"])).await.unwrap();
        let ids: Vec<_> = h
            .store()
            .list_by_batch(batch_id)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();

        h.jobs.start(ids[0]).await.unwrap();
        let scheduled = h.batches.start(batch_id).await.unwrap();
        assert_eq!(scheduled, [ids[1]]);

        let view = tokio::time::timeout(WAIT, h.store().wait_batch_terminal(batch_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.status, BatchStatus::Completed);
        assert_eq!(view.completed_count, 2);
    }

    #[tokio::test]
    async fn one_invalid_image_rejects_the_whole_batch() {
        let h = Harness::new("true", Duration::from_secs(1), 1);
        let mut batch = images(&["a.png", "b.png"]);
        batch.push(BatchImage::new("c.gif", b"GIF89a".to_vec()));
        let err = h.batches.submit(batch).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(h.store().task_count().await, 0);

        let err = h.batches.submit(Vec::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
