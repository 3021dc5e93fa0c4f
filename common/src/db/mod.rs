// Database layer module
// PostgreSQL connection pool, SQL template formatter and the PostgreSQL job store

pub mod format;
pub mod job_store;
pub mod pool;
pub mod queries;

pub use format::{format_sql, SqlParam};
pub use job_store::PgJobStore;
pub use pool::DbPool;
