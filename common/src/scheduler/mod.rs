// Scheduler facade: schedule, remove and consume queues

pub mod facade;

pub use facade::{QueueSubscription, Scheduler};
