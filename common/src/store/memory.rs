// In-process job store
//
// Same claim/heartbeat/flush semantics as the PostgreSQL store, guarded by a
// single async mutex. Used by tests and single-process deployments.

use super::JobStore;
use crate::errors::StoreError;
use crate::models::{Job, NewJob};
use crate::worker::CompletionRecord;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

type JobKey = (String, String);

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<BTreeMap<JobKey, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, queue: &str, id: &str) -> Option<Job> {
        self.jobs
            .lock()
            .await
            .get(&(queue.to_string(), id.to_string()))
            .cloned()
    }

    /// Jobs of one queue ordered by id
    pub async fn list(&self, queue: &str) -> Vec<Job> {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|job| job.queue == queue)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

fn lock_deadline(now: DateTime<Utc>, lock_period: Duration) -> Result<DateTime<Utc>, StoreError> {
    TimeDelta::from_std(lock_period)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| StoreError::Query(format!("lock period out of range: {lock_period:?}")))
}

fn key(queue: &str, id: &str) -> JobKey {
    (queue.to_string(), id.to_string())
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fetch_and_lock(
        &self,
        queue: &str,
        worker_id: &str,
        batch_size: usize,
        lock_period: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let locked_until = lock_deadline(now, lock_period)?;

        let mut jobs = self.jobs.lock().await;
        let claimed: Vec<Job> = jobs
            .values_mut()
            .filter(|job| job.queue == queue && job.is_due(now))
            .take(batch_size)
            .map(|job| {
                job.locked_until = Some(locked_until);
                job.locked_by = Some(worker_id.to_string());
                job.attempts += 1;
                job.clone()
            })
            .collect();

        debug!(count = claimed.len(), "Claimed jobs");
        Ok(claimed)
    }

    async fn heartbeat(&self, queue: &str, ids: &[String], lock_period: Duration) -> Result<(), StoreError> {
        let locked_until = lock_deadline(Utc::now(), lock_period)?;

        let mut jobs = self.jobs.lock().await;
        for id in ids {
            if let Some(job) = jobs.get_mut(&key(queue, id)) {
                job.locked_until = Some(locked_until);
            }
        }
        Ok(())
    }

    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn flush(&self, queue: &str, records: &[CompletionRecord]) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        for record in records {
            let job_key = key(queue, &record.id);
            let Some(next_run) = record.next_run else {
                jobs.remove(&job_key);
                continue;
            };
            if let Some(job) = jobs.get_mut(&job_key) {
                job.run_at = next_run;
                job.locked_until = record.locked_until();
                job.locked_by = None;
                job.attempts = 0;
                if let Some(expression) = &record.expression_override {
                    job.expression = Some(expression.clone());
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self, new_jobs), fields(jobs = new_jobs.len()))]
    async fn insert(&self, queue: &str, new_jobs: &[NewJob], reset_on_conflict: bool) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        for new_job in new_jobs {
            match jobs.entry(key(queue, &new_job.id)) {
                Entry::Occupied(mut entry) => {
                    let existing = entry.get_mut();
                    existing.data = new_job.data.clone();
                    existing.expression = new_job.expression.clone();
                    if reset_on_conflict {
                        existing.run_at = new_job.run_at;
                        existing.locked_until = Some(new_job.run_at);
                        existing.locked_by = None;
                        existing.attempts = 0;
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Job {
                        queue: queue.to_string(),
                        id: new_job.id.clone(),
                        run_at: new_job.run_at,
                        data: new_job.data.clone(),
                        expression: new_job.expression.clone(),
                        locked_until: Some(new_job.run_at),
                        locked_by: None,
                        attempts: 0,
                    });
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, queue: &str, id: Option<&str>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        match id {
            Some(id) => {
                jobs.remove(&key(queue, id));
            }
            None => jobs.retain(|(job_queue, _), _| job_queue != queue),
        }
        Ok(())
    }
}
