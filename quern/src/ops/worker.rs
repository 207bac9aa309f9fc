use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::error::DatabaseError;

/// One row off the claim query. By the time this row is decoded, the
/// connection's session already holds the advisory lock on `job_id`.
#[derive(sqlx::FromRow, Debug)]
pub(crate) struct ClaimedRow {
    pub queue: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub job_id: i64,
    pub job_class: String,
    pub args: serde_json::Value,
    pub error_count: i32,
}

/// Claim the highest-priority ready job in `queue`.
///
/// Walks the claim index in `(priority, run_at, job_id)` order inside a
/// recursive CTE, attempting a non-blocking session advisory lock on each
/// candidate, and returns the first job whose lock was acquired. Candidates
/// locked by any other session are skipped without ever blocking on them.
///
/// The walk runs under the statement's MVCC snapshot, so the returned row may
/// already be deleted in the committed view; see `check_job`.
pub(crate) async fn lock_job(
    conn: &mut PgConnection,
    queue: &str,
) -> Result<Option<ClaimedRow>, DatabaseError> {
    let base_query = r#"
WITH RECURSIVE candidates AS (
    SELECT (j).*, pg_try_advisory_lock((j).job_id) AS locked
    FROM (
        SELECT j
        FROM que_jobs AS j
        WHERE queue = $1::text
        AND run_at <= now()
        ORDER BY priority, run_at, job_id
        LIMIT 1
    ) AS t1
    UNION ALL (
        SELECT (j).*, pg_try_advisory_lock((j).job_id) AS locked
        FROM (
            SELECT (
                SELECT j
                FROM que_jobs AS j
                WHERE queue = $1::text
                AND run_at <= now()
                AND (priority, run_at, job_id) >
                    (candidates.priority, candidates.run_at, candidates.job_id)
                ORDER BY priority, run_at, job_id
                LIMIT 1
            ) AS j
            FROM candidates
            WHERE candidates.job_id IS NOT NULL
            LIMIT 1
        ) AS t1
    )
)
SELECT queue, priority, run_at, job_id, job_class, args, error_count
FROM candidates
WHERE locked
LIMIT 1
    "#;

    sqlx::query_as(base_query)
        .bind(queue)
        .fetch_optional(conn)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: "lock_job",
            error,
        })
}

/// Re-check that a claimed row still exists in the committed view.
///
/// The claim walks an MVCC snapshot, so its advisory lock can land on a job a
/// peer finished in the meantime; this query is the authoritative answer.
pub(crate) async fn check_job(
    conn: &mut PgConnection,
    queue: &str,
    priority: i16,
    run_at: DateTime<Utc>,
    job_id: i64,
) -> Result<bool, DatabaseError> {
    let base_query = r#"
SELECT true
FROM que_jobs
WHERE queue = $1::text
AND priority = $2::smallint
AND run_at = $3::timestamptz
AND job_id = $4::bigint
    "#;

    let row: Option<bool> = sqlx::query_scalar(base_query)
        .bind(queue)
        .bind(priority)
        .bind(run_at)
        .bind(job_id)
        .fetch_optional(conn)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: "check_job",
            error,
        })?;

    Ok(row.is_some())
}

/// Delete the row for a finished job. The full compound key is matched so the
/// statement can only ever touch the row that was claimed.
pub(crate) async fn delete_job(
    conn: &mut PgConnection,
    queue: &str,
    priority: i16,
    run_at: DateTime<Utc>,
    job_id: i64,
) -> Result<(), DatabaseError> {
    let base_query = r#"
DELETE FROM que_jobs
WHERE queue = $1::text
AND priority = $2::smallint
AND run_at = $3::timestamptz
AND job_id = $4::bigint
    "#;

    sqlx::query(base_query)
        .bind(queue)
        .bind(priority)
        .bind(run_at)
        .bind(job_id)
        .execute(conn)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: "delete_job",
            error,
        })?;

    Ok(())
}

/// Record a failure: store the new count and message, and push `run_at`
/// forward by `delay_secs`.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn set_error(
    conn: &mut PgConnection,
    error_count: i32,
    delay_secs: i64,
    message: &str,
    queue: &str,
    priority: i16,
    run_at: DateTime<Utc>,
    job_id: i64,
) -> Result<(), DatabaseError> {
    let base_query = r#"
UPDATE que_jobs
SET error_count = $1::integer,
    run_at = now() + $2::bigint * interval '1 second',
    last_error = $3::text
WHERE queue = $4::text
AND priority = $5::smallint
AND run_at = $6::timestamptz
AND job_id = $7::bigint
    "#;

    sqlx::query(base_query)
        .bind(error_count)
        .bind(delay_secs)
        .bind(message)
        .bind(queue)
        .bind(priority)
        .bind(run_at)
        .bind(job_id)
        .execute(conn)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: "set_error",
            error,
        })?;

    Ok(())
}

/// Release the session advisory lock on `job_id`. Returns whether the lock
/// was actually held by this session.
pub(crate) async fn unlock_job(
    conn: &mut PgConnection,
    job_id: i64,
) -> Result<bool, DatabaseError> {
    sqlx::query_scalar("SELECT pg_advisory_unlock($1::bigint)")
        .bind(job_id)
        .fetch_one(conn)
        .await
        .map_err(|error| DatabaseError::QueryError {
            command: "unlock_job",
            error,
        })
}
