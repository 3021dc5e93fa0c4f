use crate::errors::ExpressionError;
use crate::expression::{IntoExpression, ScheduleExpression};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ============================================================================
// Job Models
// ============================================================================

/// One scheduled occurrence stored under a `(queue, id)` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub queue: String,
    pub id: String,
    pub run_at: DateTime<Utc>,
    pub data: serde_json::Value,
    /// Schedule that produced this occurrence, used to compute the next one
    pub expression: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub attempts: i32,
}

impl Job {
    /// A job is due once both its run time and its lock have passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let locked_until = self.locked_until.unwrap_or(self.run_at);
        self.run_at.max(locked_until) <= now
    }

    /// Parsed form of the stored expression; a missing expression cancels
    pub fn schedule(&self) -> Result<ScheduleExpression, ExpressionError> {
        self.expression.as_deref().into_expression()
    }
}

/// Insert request for `JobStore::insert`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: String,
    pub run_at: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub expression: Option<String>,
}

impl NewJob {
    pub fn new(id: impl Into<String>, run_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            run_at,
            data: serde_json::Value::Null,
            expression: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }
}
