// Error policy
// Resolves a handler failure into a rescheduling directive

use super::outcome::{error_handler, ErrorHandler, JobOutcome};
use crate::expression::ScheduleExpression;
use crate::models::Job;
use std::sync::Arc;
use tracing::warn;

/// Per-queue and global error handlers for one queue worker
#[derive(Clone, Default)]
pub struct ErrorPolicy {
    local: Option<ErrorHandler>,
    global: Option<ErrorHandler>,
}

impl ErrorPolicy {
    pub fn new(local: Option<ErrorHandler>, global: Option<ErrorHandler>) -> Self {
        Self { local, global }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.global.is_none()
    }

    /// Run the global handler, then the local one. The last handler that ran
    /// decides; with no handler the job is skipped and retried on lock expiry.
    pub async fn resolve(&self, error: anyhow::Error, job: &Job) -> JobOutcome {
        let error = Arc::new(error);
        let mut outcome = None;

        if let Some(global) = &self.global {
            outcome = Some(global(Arc::clone(&error), job.clone()).await);
        }
        if let Some(local) = &self.local {
            outcome = Some(local(Arc::clone(&error), job.clone()).await);
        }

        outcome.unwrap_or_else(|| {
            warn!(
                queue = %job.queue,
                job_id = %job.id,
                attempts = job.attempts,
                error = %error,
                "Job failed with no error handler, retrying after lock expiry"
            );
            JobOutcome::Skip
        })
    }
}

impl std::fmt::Debug for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorPolicy")
            .field("local", &self.local.is_some())
            .field("global", &self.global.is_some())
            .finish()
    }
}

/// Error handler that cancels a job once it has been attempted more than
/// `max_attempts` times, and retries it on lock expiry before that
pub fn cancel_after(max_attempts: i32) -> ErrorHandler {
    error_handler(move |_error, job| async move {
        if job.attempts > max_attempts {
            JobOutcome::Reschedule(ScheduleExpression::Cancel)
        } else {
            JobOutcome::Skip
        }
    })
}
