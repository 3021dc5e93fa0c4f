// Queue worker options

use crate::errors::SchedulerError;
use crate::expression::{format_period, parse_period};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Options fixed for the lifetime of one queue worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Maximum jobs claimed per fetch
    pub batch_size: usize,
    /// Maximum handlers running at once
    pub concurrent_jobs: usize,
    #[serde(serialize_with = "serialize_period", deserialize_with = "deserialize_period")]
    pub polling_period: Duration,
    #[serde(serialize_with = "serialize_period", deserialize_with = "deserialize_period")]
    pub lock_period: Duration,
    #[serde(serialize_with = "serialize_period", deserialize_with = "deserialize_period")]
    pub flush_period: Duration,
    /// Skip occurrences that are already in the past when rescheduling
    pub skip_past: bool,
    /// Heartbeats that keep waiting jobs locked; `None` is unlimited
    pub max_heartbeats: Option<u32>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrent_jobs: 10,
            polling_period: Duration::from_secs(15),
            lock_period: Duration::from_secs(60),
            flush_period: Duration::from_secs(1),
            skip_past: true,
            max_heartbeats: None,
        }
    }
}

impl WorkerOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_concurrent_jobs(mut self, concurrent_jobs: usize) -> Self {
        self.concurrent_jobs = concurrent_jobs;
        self
    }

    pub fn with_polling_period(mut self, period: Duration) -> Self {
        self.polling_period = period;
        self
    }

    pub fn with_lock_period(mut self, period: Duration) -> Self {
        self.lock_period = period;
        self
    }

    pub fn with_flush_period(mut self, period: Duration) -> Self {
        self.flush_period = period;
        self
    }

    pub fn with_skip_past(mut self, skip_past: bool) -> Self {
        self.skip_past = skip_past;
        self
    }

    pub fn with_max_heartbeats(mut self, max_heartbeats: Option<u32>) -> Self {
        self.max_heartbeats = max_heartbeats;
        self
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.batch_size == 0 {
            return Err(SchedulerError::InvalidOptions(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.concurrent_jobs == 0 {
            return Err(SchedulerError::InvalidOptions(
                "concurrent_jobs must be greater than 0".to_string(),
            ));
        }
        for (name, period) in [
            ("polling_period", self.polling_period),
            ("lock_period", self.lock_period),
            ("flush_period", self.flush_period),
        ] {
            if period.is_zero() {
                return Err(SchedulerError::InvalidOptions(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// Lock period as a SQL interval literal
pub(crate) fn lock_interval(period: Duration) -> String {
    format!("{} milliseconds", period.as_millis())
}

fn serialize_period<S>(period: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_period(*period))
}

/// Accepts human periods (`"15s"`, `"1 minute"`) or plain milliseconds
pub fn deserialize_period<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Period {
        Millis(u64),
        Text(String),
    }

    match Period::deserialize(deserializer)? {
        Period::Millis(ms) => Ok(Duration::from_millis(ms)),
        Period::Text(text) => parse_period(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = WorkerOptions::default();
        assert_eq!(options.batch_size, 100);
        assert_eq!(options.concurrent_jobs, 10);
        assert_eq!(options.polling_period, Duration::from_secs(15));
        assert_eq!(options.lock_period, Duration::from_secs(60));
        assert_eq!(options.flush_period, Duration::from_secs(1));
        assert!(options.skip_past);
        assert_eq!(options.max_heartbeats, None);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(WorkerOptions::default().with_batch_size(0).validate().is_err());
        assert!(WorkerOptions::default().with_concurrent_jobs(0).validate().is_err());
        assert!(WorkerOptions::default()
            .with_lock_period(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_deserialize_human_periods() {
        let options: WorkerOptions = serde_json::from_str(
            r#"{"polling_period": "1 minute", "lock_period": "90s", "flush_period": 250, "batch_size": 5}"#,
        )
        .unwrap();
        assert_eq!(options.polling_period, Duration::from_secs(60));
        assert_eq!(options.lock_period, Duration::from_secs(90));
        assert_eq!(options.flush_period, Duration::from_millis(250));
        assert_eq!(options.batch_size, 5);
        assert_eq!(options.concurrent_jobs, 10);
    }

    #[test]
    fn test_deserialize_rejects_unreadable_period() {
        let result: Result<WorkerOptions, _> =
            serde_json::from_str(r#"{"polling_period": "whenever"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_round_trip() {
        let options = WorkerOptions::default().with_flush_period(Duration::from_millis(500));
        let json = serde_json::to_string(&options).unwrap();
        let decoded: WorkerOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, options);
    }

    #[test]
    fn test_lock_interval_literal() {
        assert_eq!(lock_interval(WorkerOptions::default().lock_period), "60000 milliseconds");
    }
}
