// SQL templates for the jobs table
// Rendered with `db::format::format_sql`; `$1:name` is always the table

/// PostgreSQL dialect
pub mod postgres {
    /// Claim due rows.
    ///
    /// Parameters: table, worker id, queue, batch size, lock interval.
    /// The planner hints keep the claim on the `(queue, locked_until)` index.
    pub const FETCH_AND_LOCK: &str = r#"
set local enable_seqscan = off;
set local enable_mergejoin = false;
set local enable_hashjoin = false;
set local enable_hashagg = false;
set local statement_timeout = 15000;
update $1:name
set locked_until = now() + interval $5, locked_by = $2, attempts = attempts + 1
where id in (
  select id
  from $1:name
  where queue = $3
  and locked_until <= now()
  and run_at <= now()
  limit $4
  for update skip locked
)
and queue = $3 and locked_until <= now()
returning *;
"#;

    /// Parameters: table, lock interval, ids, queue
    pub const HEARTBEAT: &str = r#"
update $1:name
set locked_until = now() + interval $2
where id in ($3:csv)
and queue = $4
"#;

    /// Parameters: table, queue, id
    pub const DELETE_SINGLE: &str = r#"
delete from $1:name
where queue = $2
and id = $3
"#;

    /// Parameters: table, queue
    pub const DELETE_QUEUE: &str = "delete from $1:name where queue = $2";

    /// Parameters: table, next run, id, queue, expression override, locked until
    pub const FLUSH: &str = r#"
update $1:name
set run_at = $2,
  locked_until = $6,
  locked_by = null,
  attempts = 0
  $5:line, expression = $5
where queue = $4
and id = $3
"#;

    /// Parameters: table, schema (may be NULL), table comment
    pub const INIT: &str = r#"
begin;
$2:line create schema if not exists $2:name;
create table if not exists $1:name (queue text, id text, run_at timestamptz, data jsonb, expression text, locked_until timestamptz, locked_by text, attempts int default 0);
drop index if exists idx_jobs_queue_run_at;
create index if not exists idx_jobs_queue_locked_until on $1:name (queue, locked_until);
create unique index if not exists idx_jobs_queue_id on $1:name (queue, id);
cluster $1:name using idx_jobs_queue_locked_until;
comment on table $1:name is $3;
commit;
"#;

    /// Parameters: table, queue, id, run at, data, expression, reset on conflict
    pub const INSERT: &str = r#"
insert into $1:name (queue, id, run_at, data, expression, locked_until)
values ($2, $3, $4, $5:json, $6, $4)
on conflict (queue, id) do update set data = $5:json, expression = $6
$7:line , run_at = $4, locked_until = $4, locked_by = null, attempts = 0"#;
}

#[cfg(test)]
mod tests {
    use super::postgres;
    use crate::db::format::{format_sql, SqlParam};
    use crate::store::TableRef;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_fetch_and_lock_renders() {
        let sql = format_sql(
            postgres::FETCH_AND_LOCK,
            &[
                TableRef::default().into(),
                "worker-1".into(),
                "emails".into(),
                SqlParam::Int(100),
                "60000 milliseconds".into(),
            ],
        )
        .unwrap();

        assert!(sql.contains(r#"update "jobs""#));
        assert!(sql.contains("interval '60000 milliseconds'"));
        assert!(sql.contains("limit 100"));
        assert!(sql.contains("for update skip locked"));
        assert!(sql.contains("run_at <= now()"));
        assert!(!sql.contains('$'));
    }

    #[test]
    fn test_flush_without_expression_leaves_it_alone() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let params = |expression: SqlParam| {
            vec![
                TableRef::default().into(),
                at.into(),
                "job-1".into(),
                "emails".into(),
                expression,
                at.into(),
            ]
        };

        let sql = format_sql(postgres::FLUSH, &params(SqlParam::Null)).unwrap();
        assert!(!sql.contains("expression"));

        let sql = format_sql(postgres::FLUSH, &params("R/P1D".into())).unwrap();
        assert!(sql.contains(", expression = 'R/P1D'"));
    }

    #[test]
    fn test_insert_reset_line() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let params = |reset: bool| {
            vec![
                TableRef::default().into(),
                "emails".into(),
                "job-1".into(),
                at.into(),
                serde_json::json!({"to": "x"}).into(),
                SqlParam::Null,
                reset.into(),
            ]
        };

        let sql = format_sql(postgres::INSERT, &params(true)).unwrap();
        assert!(sql.contains("attempts = 0"));

        let sql = format_sql(postgres::INSERT, &params(false)).unwrap();
        assert!(!sql.contains("attempts = 0"));
        assert!(sql.contains(r#"'{"to":"x"}'"#));
    }

    #[test]
    fn test_init_with_and_without_schema() {
        let sql = format_sql(
            postgres::INIT,
            &[TableRef::default().into(), SqlParam::Null, "jobs table".into()],
        )
        .unwrap();
        assert!(!sql.contains("create schema"));

        let table = TableRef::new("jobs").with_schema("swag");
        let sql = format_sql(
            postgres::INIT,
            &[table.into(), "swag".into(), "jobs table".into()],
        )
        .unwrap();
        assert!(sql.contains(r#"create schema if not exists "swag";"#));
        assert!(sql.contains(r#"create table if not exists "swag"."jobs""#));
    }
}
