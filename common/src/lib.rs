// Common library for the swag job scheduler: expressions, job stores and queue workers

pub mod config;
pub mod db;
pub mod errors;
pub mod expression;
pub mod models;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use errors::{ExpressionError, FormatError, SchedulerError, StoreError};
pub use expression::{IntoExpression, ScheduleExpression};
pub use models::{Job, NewJob};
pub use scheduler::{QueueSubscription, Scheduler};
pub use store::{JobStore, MemoryJobStore, TableRef};
pub use worker::{cancel_after, error_handler, job_handler, JobOutcome, WorkerOptions};
