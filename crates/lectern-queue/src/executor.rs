use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{error, info, instrument, warn};

use lectern_core::ids::TaskId;
use lectern_store::tasks::{TaskRepo, TaskStatus};
use lectern_store::{Database, StoreError};

use crate::router::TaskRouter;

/// Worker-pool and retry parameters.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub backoff_base: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(600),
            backoff_base: Duration::from_secs(5),
        }
    }
}

/// Task state as exposed to callers polling for an outcome.
#[derive(Clone, Debug, Serialize)]
pub struct TaskStatusReport {
    pub id: TaskId,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub err_trace: Option<String>,
}

/// Durable task executor: submission inserts a row and returns immediately;
/// a pool of workers claims due rows and runs them through the router.
///
/// Delivery is at-least-once — a worker that dies mid-task leaves a running
/// row whose lease expires, after which another worker may claim it. Task
/// bodies must tolerate re-entry.
pub struct TaskExecutor {
    tasks: TaskRepo,
    router: Arc<dyn TaskRouter>,
    config: ExecutorConfig,
    notify: Notify,
}

impl TaskExecutor {
    pub fn new(db: Database, router: Arc<dyn TaskRouter>, config: ExecutorConfig) -> Arc<Self> {
        Arc::new(Self {
            tasks: TaskRepo::new(db),
            router,
            config,
            notify: Notify::new(),
        })
    }

    /// Enqueue a task and return its id without waiting for execution.
    #[instrument(skip(self, payload))]
    pub fn submit(&self, kind: &str, payload: &serde_json::Value) -> Result<TaskId, StoreError> {
        let id = self.tasks.insert(kind, payload)?;
        info!(task_id = %id, kind, "task submitted");
        self.notify.notify_one();
        Ok(id)
    }

    /// Current state plus result (on success) or error and trace (on failure).
    pub fn status(&self, id: &TaskId) -> Result<TaskStatusReport, StoreError> {
        let task = self.tasks.get(id)?;
        Ok(TaskStatusReport {
            id: task.id,
            status: task.status,
            result: task.result,
            error: task.error,
            err_trace: task.err_trace,
        })
    }

    /// Spawn the worker pool. Handles live until aborted or the runtime drops.
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.workers)
            .map(|n| {
                let executor = Arc::clone(self);
                tokio::spawn(async move { executor.worker_loop(n).await })
            })
            .collect()
    }

    async fn worker_loop(self: Arc<Self>, worker: usize) {
        info!(worker, "task worker started");
        loop {
            match self.tasks.claim_next(self.config.lease) {
                Ok(Some(task)) => {
                    let task_id = task.id.clone();
                    let kind = task.kind.clone();
                    let attempt = task.attempts;
                    info!(worker, task_id = %task_id, kind, attempt, "task claimed");
                    self.run_one(task).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker, error = %e, "claim failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn run_one(&self, task: lectern_store::tasks::TaskRow) {
        let outcome = self.router.run(&task.kind, &task.payload).await;

        match outcome {
            Ok(result) => {
                if let Err(e) = self.tasks.mark_success(&task.id, &result) {
                    error!(task_id = %task.id, error = %e, "failed to record success");
                }
            }
            Err(err) => {
                let budget = self.router.max_attempts(&task.kind);
                if err.retryable && task.attempts < budget {
                    // Linear backoff: base × attempt (5s, 10s, 15s, …)
                    let delay = self.config.backoff_base * task.attempts;
                    warn!(
                        task_id = %task.id,
                        kind = task.kind,
                        attempt = task.attempts,
                        budget,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "task failed, retrying"
                    );
                    if let Err(e) =
                        self.tasks.mark_retrying(&task.id, delay, &err.message, &err.trace)
                    {
                        error!(task_id = %task.id, error = %e, "failed to record retry");
                    }
                } else {
                    error!(
                        task_id = %task.id,
                        kind = task.kind,
                        attempt = task.attempts,
                        retryable = err.retryable,
                        error = %err,
                        trace = %err.trace,
                        "task failed permanently"
                    );
                    if let Err(e) = self.tasks.mark_failed(&task.id, &err.message, &err.trace) {
                        error!(task_id = %task.id, error = %e, "failed to record failure");
                    }
                }
            }
        }
    }
}
