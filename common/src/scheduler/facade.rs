// Scheduler facade
// Registers schedules in the job store and owns the queue workers of one process

use crate::errors::SchedulerError;
use crate::expression::{IntoExpression, ScheduleExpression};
use crate::models::NewJob;
use crate::store::JobStore;
use crate::worker::{ErrorHandler, JobHandler, QueueWorker, SharedErrorHandler, WorkerOptions};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Entry point for scheduling jobs and consuming queues
///
/// Each instance has its own worker id and its own queue → worker map, so
/// several schedulers can share a store (and a queue) inside one process.
/// Workers keep running until [`Scheduler::stop`] or
/// [`Scheduler::stop_all`] is called.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    worker_id: String,
    workers: Mutex<HashMap<String, Arc<QueueWorker>>>,
    global_error_handler: SharedErrorHandler,
    initialized: OnceCell<()>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            worker_id: Uuid::new_v4().to_string(),
            workers: Mutex::new(HashMap::new()),
            global_error_handler: Arc::new(RwLock::new(None)),
            initialized: OnceCell::new(),
        }
    }

    /// Use a fixed worker id instead of a random one
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Id written to `locked_by` for jobs claimed by this scheduler
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    // The store is initialized once, on first use
    async fn ensure_initialized(&self) -> Result<(), SchedulerError> {
        self.initialized
            .get_or_try_init(|| async { self.store.init().await })
            .await?;
        Ok(())
    }

    /// Schedule one job.
    ///
    /// The expression is resolved before anything is written; a cancel
    /// expression, or one with no upcoming occurrence, inserts nothing. An
    /// existing job with the same id gets the new data and expression, and
    /// unless `preserve_run_at` is set its run time, lock and attempts are
    /// reset.
    #[instrument(skip(self, expression, data), fields(worker_id = %self.worker_id))]
    pub async fn schedule(
        &self,
        queue: &str,
        id: &str,
        expression: impl IntoExpression,
        data: Value,
        preserve_run_at: bool,
    ) -> Result<(), SchedulerError> {
        self.schedule_many(queue, [(id, expression, data)], preserve_run_at)
            .await
    }

    /// Schedule several jobs of one queue in a single batched insert.
    ///
    /// Every expression is resolved first; if any of them is invalid nothing
    /// is written.
    #[instrument(skip(self, jobs), fields(worker_id = %self.worker_id))]
    pub async fn schedule_many<I, K, E>(
        &self,
        queue: &str,
        jobs: I,
        preserve_run_at: bool,
    ) -> Result<(), SchedulerError>
    where
        I: IntoIterator<Item = (K, E, Value)>,
        K: Into<String>,
        E: IntoExpression,
    {
        let mut pending = Vec::new();
        for (id, expression, data) in jobs {
            let id = id.into();
            if let Some(job) = new_job(&id, expression.into_expression()?, data)? {
                pending.push(job);
            } else {
                debug!(queue, job_id = %id, "Expression has no upcoming run, not scheduling");
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        self.ensure_initialized().await?;
        self.store.insert(queue, &pending, !preserve_run_at).await?;

        info!(queue, jobs = pending.len(), "Jobs scheduled");
        Ok(())
    }

    /// Remove one job, or every job of `queue` when `id` is `None`
    #[instrument(skip(self))]
    pub async fn remove(&self, queue: &str, id: Option<&str>) -> Result<(), SchedulerError> {
        self.ensure_initialized().await?;
        self.store.delete(queue, id).await?;
        info!("Jobs removed");
        Ok(())
    }

    /// Start consuming `queue`, replacing any worker this scheduler already
    /// runs for it
    #[instrument(skip(self, handler, options), fields(worker_id = %self.worker_id))]
    pub async fn on(
        &self,
        queue: &str,
        handler: JobHandler,
        options: WorkerOptions,
    ) -> Result<QueueSubscription, SchedulerError> {
        options.validate()?;
        self.ensure_initialized().await?;

        if let Err(e) = self.stop(queue).await {
            error!(error = %e, "Failed to stop previous worker cleanly");
        }

        let worker = QueueWorker::start(
            queue,
            self.worker_id.clone(),
            Arc::clone(&self.store),
            handler,
            options,
            Arc::clone(&self.global_error_handler),
        )?;
        self.workers
            .lock()
            .await
            .insert(queue.to_string(), Arc::clone(&worker));

        Ok(QueueSubscription { worker })
    }

    /// Set the error handler used for every queue of this scheduler.
    ///
    /// It runs before a queue's own handler, which has the last word.
    pub async fn on_error(&self, handler: ErrorHandler) {
        *self.global_error_handler.write().await = Some(handler);
    }

    /// Stop the worker of `queue` and flush its completions
    #[instrument(skip(self))]
    pub async fn stop(&self, queue: &str) -> Result<(), SchedulerError> {
        let worker = self.workers.lock().await.remove(queue);
        match worker {
            Some(worker) => worker.stop().await,
            None => Ok(()),
        }
    }

    /// Stop every worker. All workers are stopped even if some fail; the
    /// first failure is returned.
    #[instrument(skip(self))]
    pub async fn stop_all(&self) -> Result<(), SchedulerError> {
        let workers: Vec<_> = self.workers.lock().await.drain().collect();

        let mut first_error = None;
        for (queue, worker) in workers {
            if let Err(e) = worker.stop().await {
                error!(queue = %queue, error = %e, "Failed to stop queue worker");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Queues with a running worker
    pub async fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        queues.sort();
        queues
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

fn new_job(
    id: &str,
    expression: ScheduleExpression,
    data: Value,
) -> Result<Option<NewJob>, SchedulerError> {
    let expression = expression.lower()?;
    if expression.is_cancel() {
        return Ok(None);
    }

    let Some(run_at) = expression.resolve(None, None)? else {
        return Ok(None);
    };

    Ok(Some(
        NewJob::new(id, run_at)
            .with_data(data)
            .with_expression(expression.to_string()),
    ))
}

/// Handle to a running queue worker
#[derive(Debug, Clone)]
pub struct QueueSubscription {
    worker: Arc<QueueWorker>,
}

impl QueueSubscription {
    pub fn queue(&self) -> &str {
        self.worker.queue()
    }

    /// Set the error handler for this queue only
    pub async fn on_error(&self, handler: ErrorHandler) -> &Self {
        self.worker.set_error_handler(handler).await;
        self
    }

    pub fn worker(&self) -> &Arc<QueueWorker> {
        &self.worker
    }
}
