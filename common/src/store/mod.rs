// Job store contract
//
// The worker engine and the scheduler facade only talk to persistence through
// `JobStore`. `PgJobStore` (in `db`) and `MemoryJobStore` implement it.

pub mod memory;

pub use memory::MemoryJobStore;

use crate::errors::StoreError;
use crate::models::{Job, NewJob};
use crate::worker::CompletionRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Persistence operations used by queue workers and the scheduler facade
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create the table and indexes. Safe to call repeatedly.
    async fn init(&self) -> Result<(), StoreError>;

    /// Atomically claim up to `batch_size` due jobs of `queue`.
    ///
    /// Claimed rows get `locked_until = now + lock_period`, `locked_by =
    /// worker_id` and `attempts + 1`. Rows claimed by one caller are never
    /// returned to another until the lock expires.
    async fn fetch_and_lock(
        &self,
        queue: &str,
        worker_id: &str,
        batch_size: usize,
        lock_period: Duration,
    ) -> Result<Vec<Job>, StoreError>;

    /// Extend the lock of `ids` to `now + lock_period`
    async fn heartbeat(&self, queue: &str, ids: &[String], lock_period: Duration) -> Result<(), StoreError>;

    /// Apply completion records in one batch: reschedule or delete
    async fn flush(&self, queue: &str, records: &[CompletionRecord]) -> Result<(), StoreError>;

    /// Upsert jobs keyed on `(queue, id)`.
    ///
    /// With `reset_on_conflict` an existing row gets the new run time, its
    /// lock released and its attempts zeroed; otherwise only `data` and
    /// `expression` are replaced.
    async fn insert(&self, queue: &str, jobs: &[NewJob], reset_on_conflict: bool) -> Result<(), StoreError>;

    /// Delete a single job, or the whole queue when `id` is `None`
    async fn delete(&self, queue: &str, id: Option<&str>) -> Result<(), StoreError>;
}

/// Table location of the jobs table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default = "default_table")]
    pub table: String,
}

fn default_table() -> String {
    "jobs".to_string()
}

impl TableRef {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

impl Default for TableRef {
    fn default() -> Self {
        Self::new(default_table())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let table = TableRef::default();
        assert_eq!(table.table, "jobs");
        assert!(table.schema.is_none());
    }

    #[test]
    fn test_table_with_schema() {
        let table = TableRef::new("queue_jobs").with_schema("swag");
        assert_eq!(table.schema.as_deref(), Some("swag"));
        assert_eq!(table.table, "queue_jobs");
    }
}
