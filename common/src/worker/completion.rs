// Completion buffer
// Per-job outcomes waiting for the next flush

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Outcome of one job execution, applied to the store by a flush
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub id: String,
    /// `None` deletes the job
    pub next_run: Option<DateTime<Utc>>,
    pub expression_override: Option<String>,
    pub locked_until_override: Option<DateTime<Utc>>,
}

impl CompletionRecord {
    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next_run: None,
            expression_override: None,
            locked_until_override: None,
        }
    }

    pub fn reschedule(id: impl Into<String>, next_run: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            next_run: Some(next_run),
            expression_override: None,
            locked_until_override: None,
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression_override = Some(expression.into());
        self
    }

    pub fn with_locked_until(mut self, locked_until: DateTime<Utc>) -> Self {
        self.locked_until_override = Some(locked_until);
        self
    }

    pub fn is_delete(&self) -> bool {
        self.next_run.is_none()
    }

    /// Lock time written by the flush: the override, else the next run
    pub fn locked_until(&self) -> Option<DateTime<Utc>> {
        self.locked_until_override.or(self.next_run)
    }
}

/// Records accumulated between flushes
#[derive(Debug, Default)]
pub struct CompletionBuffer {
    records: Mutex<Vec<CompletionRecord>>,
}

impl CompletionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, record: CompletionRecord) -> usize {
        let mut records = self.records.lock().await;
        records.push(record);
        records.len()
    }

    /// Take every buffered record, leaving the buffer empty
    pub async fn drain(&self) -> Vec<CompletionRecord> {
        std::mem::take(&mut *self.records.lock().await)
    }

    /// Put records from a failed flush back in front of newer ones
    pub async fn requeue(&self, mut failed: Vec<CompletionRecord>) -> usize {
        let mut records = self.records.lock().await;
        failed.append(&mut records);
        *records = failed;
        records.len()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}
