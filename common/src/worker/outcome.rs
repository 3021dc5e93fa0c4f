// Handler outcomes and handler function types

use crate::expression::ScheduleExpression;
use crate::models::Job;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// What the worker does with a job after its handler returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Reschedule with the job's own expression
    Continue,
    /// Reschedule with a different expression, which is also stored
    Reschedule(ScheduleExpression),
    /// Reschedule with the job's own expression but keep it locked until the given time
    RelockUntil(DateTime<Utc>),
    /// Leave the row untouched; it becomes due again when its lock expires
    Skip,
}

/// Callback invoked for every claimed job
pub type JobHandler =
    Arc<dyn Fn(Job) -> BoxFuture<'static, Result<JobOutcome, anyhow::Error>> + Send + Sync>;

/// Callback invoked when a job handler fails
pub type ErrorHandler =
    Arc<dyn Fn(Arc<anyhow::Error>, Job) -> BoxFuture<'static, JobOutcome> + Send + Sync>;

/// Wrap an async closure as a `JobHandler`
pub fn job_handler<F, Fut>(f: F) -> JobHandler
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobOutcome, anyhow::Error>> + Send + 'static,
{
    Arc::new(move |job| Box::pin(f(job)))
}

/// Wrap an async closure as an `ErrorHandler`
pub fn error_handler<F, Fut>(f: F) -> ErrorHandler
where
    F: Fn(Arc<anyhow::Error>, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    Arc::new(move |error, job| Box::pin(f(error, job)))
}
