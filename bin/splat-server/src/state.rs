//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use splat_core::{BatchCoordinator, JobOrchestrator, TaskStore, ToolRunner};

use crate::config::Config;

/// State shared across all HTTP handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Single-task job control.
    pub jobs: JobOrchestrator,
    /// Batch fan-out and packaging over the same store.
    pub batches: BatchCoordinator,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let runner = config.tool_runner();
        Self::with_runner(config, runner)
    }

    /// Same as [`AppState::new`] with an explicit tool runner.
    pub fn with_runner(config: Config, runner: ToolRunner) -> Self {
        let store = TaskStore::new();
        let jobs = JobOrchestrator::new(config.job_settings(), runner, store);
        let batches = BatchCoordinator::new(jobs.clone());
        Self {
            config: Arc::new(config),
            jobs,
            batches,
        }
    }
}
