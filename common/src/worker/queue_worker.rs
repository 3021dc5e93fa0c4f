// Queue worker
// Poll loop, batch claim, concurrent dispatch, heartbeats and completion flushing for one queue

use super::completion::{CompletionBuffer, CompletionRecord};
use super::error_policy::ErrorPolicy;
use super::options::WorkerOptions;
use super::outcome::{ErrorHandler, JobHandler, JobOutcome};
use crate::errors::{SchedulerError, StoreError};
use crate::models::Job;
use crate::store::JobStore;
use crate::telemetry;
use chrono::Utc;
use futures::{FutureExt, StreamExt};
use rand::Rng;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Error handler shared by every worker of one scheduler
pub type SharedErrorHandler = Arc<RwLock<Option<ErrorHandler>>>;

type IdSet = Arc<Mutex<HashSet<String>>>;

/// Worker for a single queue
///
/// Starting a worker spawns a poll loop and a flush loop on the current tokio
/// runtime. Call [`QueueWorker::stop`] to finish the active cycle and flush
/// every pending completion.
pub struct QueueWorker {
    inner: Arc<WorkerInner>,
    tasks: Mutex<Option<WorkerTasks>>,
}

struct WorkerTasks {
    poll: JoinHandle<()>,
    flush: JoinHandle<()>,
}

struct WorkerInner {
    queue: String,
    worker_id: String,
    store: Arc<dyn JobStore>,
    handler: JobHandler,
    options: WorkerOptions,
    local_error_handler: RwLock<Option<ErrorHandler>>,
    global_error_handler: SharedErrorHandler,
    buffer: CompletionBuffer,
    flush_lock: Mutex<()>,
    cycle_active: AtomicBool,
    cycle: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl QueueWorker {
    /// Validate `options` and start polling `queue`
    pub fn start(
        queue: impl Into<String>,
        worker_id: impl Into<String>,
        store: Arc<dyn JobStore>,
        handler: JobHandler,
        options: WorkerOptions,
        global_error_handler: SharedErrorHandler,
    ) -> Result<Arc<Self>, SchedulerError> {
        options.validate()?;

        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        let inner = Arc::new(WorkerInner {
            queue: queue.into(),
            worker_id: worker_id.into(),
            store,
            handler,
            options,
            local_error_handler: RwLock::new(None),
            global_error_handler,
            buffer: CompletionBuffer::new(),
            flush_lock: Mutex::new(()),
            cycle_active: AtomicBool::new(false),
            cycle: Mutex::new(None),
            stopping: AtomicBool::new(false),
            shutdown_tx,
        });

        let poll = tokio::spawn(WorkerInner::poll_loop(
            Arc::clone(&inner),
            inner.shutdown_tx.subscribe(),
        ));
        let flush = tokio::spawn(WorkerInner::flush_loop(
            Arc::clone(&inner),
            inner.shutdown_tx.subscribe(),
        ));

        info!(
            queue = %inner.queue,
            worker_id = %inner.worker_id,
            batch_size = inner.options.batch_size,
            concurrent_jobs = inner.options.concurrent_jobs,
            polling_period_ms = inner.options.polling_period.as_millis() as u64,
            lock_period_ms = inner.options.lock_period.as_millis() as u64,
            "Queue worker started"
        );

        Ok(Arc::new(Self {
            inner,
            tasks: Mutex::new(Some(WorkerTasks { poll, flush })),
        }))
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.is_stopping()
    }

    /// Set the handler consulted when a job of this queue fails
    pub async fn set_error_handler(&self, handler: ErrorHandler) {
        *self.inner.local_error_handler.write().await = Some(handler);
    }

    /// Write buffered completions to the store now
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.inner.flush().await
    }

    /// Stop polling, wait for the active cycle and flush what it produced.
    ///
    /// Calling `stop` again after it returned is a no-op. If the final flush
    /// fails the error is returned and the unflushed jobs become due again
    /// when their locks expire.
    #[instrument(skip(self), fields(queue = %self.inner.queue))]
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.lock().await;
        let Some(WorkerTasks { poll, flush }) = tasks.take() else {
            return Ok(());
        };

        info!("Stopping queue worker");
        self.inner.stopping.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(());

        for (name, handle) in [("poll", poll), ("flush", flush)] {
            if let Err(e) = handle.await {
                error!(task = name, error = %e, "Queue worker task terminated abnormally");
            }
        }

        let cycle = self.inner.cycle.lock().await.take();
        if let Some(cycle) = cycle {
            if let Err(e) = cycle.await {
                error!(error = %e, "Poll cycle terminated abnormally");
            }
        }

        self.inner.flush().await?;

        info!("Queue worker stopped");
        Ok(())
    }
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("queue", &self.inner.queue)
            .field("worker_id", &self.inner.worker_id)
            .field("options", &self.inner.options)
            .field("stopping", &self.inner.is_stopping())
            .finish()
    }
}

/// Clears the cycle flag however the cycle ends
struct CycleGuard(Arc<WorkerInner>);

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0.cycle_active.store(false, Ordering::SeqCst);
    }
}

/// Aborts the batch heartbeat task on every exit from the batch
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl WorkerInner {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    async fn poll_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.options.polling_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    Self::start_cycle(&self).await;
                }
                _ = shutdown_rx.recv() => {
                    debug!(queue = %self.queue, "Shutdown signal received, stopping poll loop");
                    break;
                }
            }
        }
    }

    async fn start_cycle(this: &Arc<Self>) {
        if this.is_stopping() {
            return;
        }
        if this
            .cycle_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(queue = %this.queue, "Previous poll cycle still running, dropping tick");
            return;
        }

        let guard = CycleGuard(Arc::clone(this));
        let handle = tokio::spawn(async move {
            let worker = Arc::clone(&guard.0);
            worker.run_cycle().await;
            drop(guard);
        });
        *this.cycle.lock().await = Some(handle);
    }

    /// Claim batches until one comes back short
    async fn run_cycle(self: Arc<Self>) {
        let batch_size = self.options.batch_size;

        while !self.is_stopping() {
            let jobs = match self
                .store
                .fetch_and_lock(&self.queue, &self.worker_id, batch_size, self.options.lock_period)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Failed to claim jobs, ending poll cycle");
                    telemetry::record_store_error(&self.queue, "fetch_and_lock");
                    break;
                }
            };

            let claimed = jobs.len();
            if claimed > 0 {
                debug!(queue = %self.queue, claimed, "Claimed batch");
                telemetry::record_jobs_claimed(&self.queue, claimed);
                Arc::clone(&self).run_batch(jobs).await;
            }

            if claimed < batch_size {
                break;
            }
        }
    }

    async fn run_batch(self: Arc<Self>, jobs: Vec<Job>) {
        let claimed: IdSet = Arc::new(Mutex::new(jobs.iter().map(|job| job.id.clone()).collect()));
        let active: IdSet = Arc::new(Mutex::new(HashSet::new()));

        let _heartbeat = HeartbeatGuard(tokio::spawn(Self::heartbeat_loop(
            Arc::clone(&self),
            Arc::clone(&claimed),
            Arc::clone(&active),
        )));

        futures::stream::iter(jobs)
            .for_each_concurrent(self.options.concurrent_jobs, |job| {
                let worker = Arc::clone(&self);
                let claimed = Arc::clone(&claimed);
                let active = Arc::clone(&active);
                async move {
                    let id = job.id.clone();
                    active.lock().await.insert(id.clone());
                    worker.process_job(job).await;
                    active.lock().await.remove(&id);
                    claimed.lock().await.remove(&id);
                }
            })
            .await;
    }

    /// Extend locks every half lock period until aborted
    async fn heartbeat_loop(self: Arc<Self>, claimed: IdSet, active: IdSet) {
        let period = heartbeat_period(self.options.lock_period);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut beats: u32 = 0;

        loop {
            ticker.tick().await;

            let keep_waiting = self.options.max_heartbeats.map_or(true, |max| beats < max);
            let ids: Vec<String> = if keep_waiting {
                claimed.lock().await.iter().cloned().collect()
            } else {
                active.lock().await.iter().cloned().collect()
            };
            beats = beats.saturating_add(1);

            if ids.is_empty() {
                continue;
            }

            match self.store.heartbeat(&self.queue, &ids, self.options.lock_period).await {
                Ok(()) => debug!(queue = %self.queue, jobs = ids.len(), beats, "Extended job locks"),
                Err(e) => {
                    warn!(queue = %self.queue, error = %e, "Heartbeat failed");
                    telemetry::record_store_error(&self.queue, "heartbeat");
                }
            }
        }
    }

    async fn process_job(&self, job: Job) {
        let started = std::time::Instant::now();
        let handler = Arc::clone(&self.handler);
        let invocation = job.clone();
        let result = AssertUnwindSafe(async move { handler(invocation).await })
            .catch_unwind()
            .await;
        telemetry::record_job_duration(&self.queue, started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(Ok(outcome)) => {
                telemetry::record_job_success(&self.queue);
                outcome
            }
            Ok(Err(e)) => {
                telemetry::record_job_failure(&self.queue, "error");
                self.handle_failure(e, &job).await
            }
            Err(panic) => {
                telemetry::record_job_failure(&self.queue, "panic");
                let e = anyhow::anyhow!("job handler panicked: {}", panic_message(panic.as_ref()));
                self.handle_failure(e, &job).await
            }
        };

        if let Some(record) = self.completion_for(&job, outcome) {
            let size = self.buffer.push(record).await;
            telemetry::update_completion_buffer_size(&self.queue, size);
        }
    }

    async fn handle_failure(&self, e: anyhow::Error, job: &Job) -> JobOutcome {
        let failure = SchedulerError::HandlerFailure {
            queue: job.queue.clone(),
            id: job.id.clone(),
            reason: format!("{e:#}"),
        };
        warn!(job_id = %job.id, attempts = job.attempts, error = %failure, "Job handler failed");

        let policy = ErrorPolicy::new(
            self.local_error_handler.read().await.clone(),
            self.global_error_handler.read().await.clone(),
        );
        policy.resolve(e, job).await
    }

    /// Turn an outcome into the record the next flush applies, if any
    fn completion_for(&self, job: &Job, outcome: JobOutcome) -> Option<CompletionRecord> {
        let now = Utc::now();
        let after = self.options.skip_past.then_some(now);

        let (schedule, expression_override, locked_until) = match outcome {
            JobOutcome::Skip => return None,
            JobOutcome::Continue => (job.schedule(), None, None),
            JobOutcome::RelockUntil(until) => (job.schedule(), None, Some(until)),
            JobOutcome::Reschedule(expression) => match expression.lower() {
                Ok(expression) => {
                    let text = (!expression.is_cancel()).then(|| expression.to_string());
                    (Ok(expression), text, None)
                }
                Err(e) => (Err(e), None, None),
            },
        };

        let schedule = match schedule {
            Ok(schedule) => schedule,
            Err(e) => {
                error!(job_id = %job.id, expression = ?job.expression, error = %e, "Unparseable schedule, leaving job locked");
                return None;
            }
        };

        let next_run = match schedule.resolve_at(Some(job.run_at), after, now) {
            Ok(next_run) => next_run,
            Err(e) => {
                error!(job_id = %job.id, schedule = %schedule, error = %e, "Unresolvable schedule, leaving job locked");
                return None;
            }
        };

        // Finished schedules are deleted whatever lock the handler asked for
        let Some(next_run) = next_run else {
            return Some(CompletionRecord::delete(&job.id));
        };
        let record = CompletionRecord::reschedule(&job.id, next_run);

        let record = match expression_override {
            Some(text) => record.with_expression(text),
            None => record,
        };
        Some(match locked_until {
            Some(until) => record.with_locked_until(until),
            None => record,
        })
    }

    async fn flush_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = self.options.flush_period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Failures are logged and retried on the next tick
                    let _ = self.flush().await;
                }
                _ = shutdown_rx.recv() => {
                    debug!(queue = %self.queue, "Shutdown signal received, stopping flush loop");
                    break;
                }
            }
        }
    }

    async fn flush(&self) -> Result<(), StoreError> {
        let _serialized = self.flush_lock.lock().await;

        let records = self.buffer.drain().await;
        if records.is_empty() {
            return Ok(());
        }
        let deleted = records.iter().filter(|record| record.is_delete()).count();

        match self.store.flush(&self.queue, &records).await {
            Ok(()) => {
                debug!(queue = %self.queue, records = records.len(), deleted, "Flushed completions");
                telemetry::record_jobs_deleted(&self.queue, deleted);
                telemetry::update_completion_buffer_size(&self.queue, self.buffer.len().await);
                Ok(())
            }
            Err(e) => {
                error!(queue = %self.queue, records = records.len(), error = %e, "Failed to flush completions");
                telemetry::record_store_error(&self.queue, "flush");
                let size = self.buffer.requeue(records).await;
                telemetry::update_completion_buffer_size(&self.queue, size);
                Err(e)
            }
        }
    }
}

/// Half the lock period, shortened by up to 10% so renewal lands before expiry
fn heartbeat_period(lock_period: Duration) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.0..0.1);
    (lock_period / 2)
        .mul_f64(1.0 - jitter)
        .max(Duration::from_millis(1))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
