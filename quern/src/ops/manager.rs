use crate::error::DatabaseError;
use crate::types::NewJob;

/// Insert a new job row. NULL binds fall through to the queue defaults: the
/// `""` queue, priority 100, ready immediately, empty args.
pub(crate) async fn insert_job<'c, E>(executor: E, job: &NewJob) -> Result<(), DatabaseError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let base_query = r#"
INSERT INTO que_jobs
    (queue, priority, run_at, job_class, args)
VALUES
    (
        coalesce($1::text, ''::text),
        coalesce($2::smallint, 100::smallint),
        coalesce($3::timestamptz, now()::timestamptz),
        $4::text,
        coalesce($5::json, '{}'::json)
    )
    "#;

    sqlx::query(base_query)
        .bind(job.queue.as_deref())
        .bind(job.priority)
        .bind(job.run_at)
        .bind(&job.job_class)
        .bind(job.args.as_ref())
        .execute(executor)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: "insert_job",
            error,
        })?;

    Ok(())
}
