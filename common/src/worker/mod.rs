// Worker module for claiming, executing and rescheduling queued jobs

pub mod completion;
pub mod error_policy;
pub mod options;
pub mod outcome;
pub mod queue_worker;

pub use completion::{CompletionBuffer, CompletionRecord};
pub use error_policy::{cancel_after, ErrorPolicy};
pub use options::WorkerOptions;
pub use outcome::{error_handler, job_handler, ErrorHandler, JobHandler, JobOutcome};
pub use queue_worker::{QueueWorker, SharedErrorHandler};
