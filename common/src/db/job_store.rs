// PostgreSQL job store
// Renders the dialect templates with the SQL formatter and runs them as simple queries

use crate::db::format::{format_sql, SqlParam};
use crate::db::queries::postgres;
use crate::db::DbPool;
use crate::errors::StoreError;
use crate::models::{Job, NewJob};
use crate::store::{JobStore, TableRef};
use crate::worker::options::lock_interval;
use crate::worker::CompletionRecord;
use async_trait::async_trait;
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// `JobStore` backed by a PostgreSQL table
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: DbPool,
    table: TableRef,
}

impl PgJobStore {
    pub fn new(pool: DbPool, table: TableRef) -> Self {
        Self { pool, table }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    // A multi-statement simple query runs as one implicit transaction
    async fn execute_batch(&self, statements: Vec<String>) -> Result<(), StoreError> {
        let Some(batch) = batch_sql(&statements) else {
            return Ok(());
        };

        sqlx::raw_sql(&batch).execute(self.pool.pool()).await?;
        Ok(())
    }

    fn flush_statement(&self, queue: &str, record: &CompletionRecord) -> Result<String, StoreError> {
        let sql = match record.next_run {
            None => format_sql(
                postgres::DELETE_SINGLE,
                &[(&self.table).into(), queue.into(), (&record.id).into()],
            )?,
            Some(next_run) => format_sql(
                postgres::FLUSH,
                &[
                    (&self.table).into(),
                    next_run.into(),
                    (&record.id).into(),
                    queue.into(),
                    record.expression_override.clone().into(),
                    record.locked_until().into(),
                ],
            )?,
        };
        Ok(sql)
    }

    fn insert_statement(&self, queue: &str, job: &NewJob, reset_on_conflict: bool) -> Result<String, StoreError> {
        let sql = format_sql(
            postgres::INSERT,
            &[
                (&self.table).into(),
                queue.into(),
                (&job.id).into(),
                job.run_at.into(),
                SqlParam::Json(job.data.clone()),
                job.expression.clone().into(),
                reset_on_conflict.into(),
            ],
        )?;
        Ok(sql)
    }
}

fn batch_sql(statements: &[String]) -> Option<String> {
    if statements.is_empty() {
        return None;
    }
    let statements: Vec<&str> = statements
        .iter()
        .map(|statement| statement.trim().trim_end_matches(';'))
        .collect();
    Some(format!("{};", statements.join(";\n")))
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self), fields(table = %self.table.table))]
    async fn init(&self) -> Result<(), StoreError> {
        let comment = format!("swag job queue, version {}", env!("CARGO_PKG_VERSION"));
        let sql = format_sql(
            postgres::INIT,
            &[
                (&self.table).into(),
                self.table.schema.clone().into(),
                comment.into(),
            ],
        )?;

        sqlx::raw_sql(&sql).execute(self.pool.pool()).await?;
        info!("Jobs table initialized");
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
        let sql = format_sql(
            postgres::FETCH_AND_LOCK,
            &[
                (&self.table).into(),
                worker_id.into(),
                queue.into(),
                batch_size.into(),
                lock_interval(lock_period).into(),
            ],
        )?;

        let rows = sqlx::raw_sql(&sql).fetch_all(self.pool.pool()).await?;
        let jobs = rows
            .iter()
            .map(Job::from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        debug!(count = jobs.len(), "Claimed jobs");
        Ok(jobs)
    }

    #[instrument(skip(self, ids), fields(ids = ids.len()))]
    async fn heartbeat(&self, queue: &str, ids: &[String], lock_period: Duration) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let sql = format_sql(
            postgres::HEARTBEAT,
            &[
                (&self.table).into(),
                lock_interval(lock_period).into(),
                ids.into(),
                queue.into(),
            ],
        )?;

        sqlx::raw_sql(&sql).execute(self.pool.pool()).await?;
        Ok(())
    }

    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn flush(&self, queue: &str, records: &[CompletionRecord]) -> Result<(), StoreError> {
        let statements = records
            .iter()
            .map(|record| self.flush_statement(queue, record))
            .collect::<Result<Vec<_>, _>>()?;
        self.execute_batch(statements).await
    }

    #[instrument(skip(self, jobs), fields(jobs = jobs.len()))]
    async fn insert(&self, queue: &str, jobs: &[NewJob], reset_on_conflict: bool) -> Result<(), StoreError> {
        let statements = jobs
            .iter()
            .map(|job| self.insert_statement(queue, job, reset_on_conflict))
            .collect::<Result<Vec<_>, _>>()?;
        self.execute_batch(statements).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, queue: &str, id: Option<&str>) -> Result<(), StoreError> {
        let sql = match id {
            Some(id) => format_sql(
                postgres::DELETE_SINGLE,
                &[(&self.table).into(), queue.into(), id.into()],
            )?,
            None => format_sql(postgres::DELETE_QUEUE, &[(&self.table).into(), queue.into()])?,
        };

        sqlx::raw_sql(&sql).execute(self.pool.pool()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    // A lazy pool never connects, so statement rendering can be checked offline
    fn offline_store() -> PgJobStore {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgresql://localhost/swag")
            .unwrap();
        PgJobStore::new(DbPool::from_pool(pool), TableRef::new("jobs").with_schema("swag"))
    }

    #[tokio::test]
    async fn test_flush_statement_for_delete() {
        let store = offline_store();
        let sql = store
            .flush_statement("emails", &CompletionRecord::delete("job-1"))
            .unwrap();
        assert!(sql.contains(r#"delete from "swag"."jobs""#));
        assert!(sql.contains("id = 'job-1'"));
    }

    #[tokio::test]
    async fn test_flush_statement_with_override() {
        let store = offline_store();
        let next = chrono::Utc::now();
        let sql = store
            .flush_statement(
                "emails",
                &CompletionRecord::reschedule("job-1", next).with_expression("R/PT1H"),
            )
            .unwrap();
        assert!(sql.contains("locked_by = null"));
        assert!(sql.contains(", expression = 'R/PT1H'"));
    }

    #[tokio::test]
    async fn test_insert_statement_escapes_data() {
        let store = offline_store();
        let job = NewJob::new("job-1", chrono::Utc::now())
            .with_data(serde_json::json!({"name": "o'neil"}));
        let sql = store.insert_statement("emails", &job, true).unwrap();
        assert!(sql.contains(r#"'{"name":"o''neil"}'"#));
        assert!(sql.contains("on conflict (queue, id)"));
        assert!(sql.contains("attempts = 0"));
    }

    #[test]
    fn test_batch_sql_joins_statements_once() {
        assert_eq!(batch_sql(&[]), None);

        let statements = vec![
            "delete from t where id = 'a';".to_string(),
            "\nupdate t set n = 1 where id = 'b'\n".to_string(),
        ];
        assert_eq!(
            batch_sql(&statements).unwrap(),
            "delete from t where id = 'a';\nupdate t set n = 1 where id = 'b';"
        );
    }

    #[tokio::test]
    async fn test_flush_batch_has_no_transaction_control() {
        let store = offline_store();
        let statements = vec![
            store.flush_statement("emails", &CompletionRecord::delete("a")).unwrap(),
            store
                .flush_statement("emails", &CompletionRecord::reschedule("b", chrono::Utc::now()))
                .unwrap(),
        ];
        let batch = batch_sql(&statements).unwrap();
        assert!(!batch.to_lowercase().contains("begin"));
        assert_eq!(batch.matches("delete from").count(), 1);
    }
}
