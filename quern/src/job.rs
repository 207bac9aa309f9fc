use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, Postgres};
use tracing::warn;

use crate::error::QueueError;
use crate::ops;
use crate::retry::RetryPolicy;

/// A claimed job, pinned to the pooled connection whose session holds the
/// advisory lock on its id.
///
/// The job exclusively owns that connection from claim until [`Job::done`].
/// Handing the connection back any earlier would strand the advisory lock for
/// the rest of the underlying session's lifetime, so completion, failure and
/// release all run on this one connection. All state transitions take
/// `&mut self`, so a job can only ever be driven from one place at a time.
pub struct Job {
    /// Queue the job was claimed from.
    pub queue: String,
    /// Claim priority. Lower runs first.
    pub priority: i16,
    /// The time the job became ready, as claimed. Part of the row's identity.
    pub run_at: DateTime<Utc>,
    /// A unique id identifying the job.
    pub id: i64,
    /// Handler key.
    pub job_class: String,
    /// JSON arguments as enqueued, opaque to the queue.
    pub args: serde_json::Value,
    /// Number of failures recorded before this claim.
    pub error_count: i32,
    /// Policy used by [`Job::error`] to schedule the next run. Populated from
    /// the client's policy at claim time; replace it before calling `error`
    /// to override it for this job only.
    pub retry_policy: RetryPolicy,
    conn: Option<PoolConnection<Postgres>>,
    deleted: bool,
}

impl Job {
    pub(crate) fn new(
        row: ops::worker::ClaimedRow,
        conn: PoolConnection<Postgres>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            queue: row.queue,
            priority: row.priority,
            run_at: row.run_at,
            id: row.job_id,
            job_class: row.job_class,
            args: row.args,
            error_count: row.error_count,
            retry_policy,
            conn: Some(conn),
            deleted: false,
        }
    }

    /// Remove the job's row, marking it successfully completed.
    ///
    /// At most one DELETE is ever issued; calling again after a successful
    /// delete returns without a round-trip. The advisory lock stays held until
    /// [`Job::done`].
    pub async fn delete(&mut self) -> Result<(), QueueError> {
        if self.deleted {
            return Ok(());
        }

        let conn = self
            .conn
            .as_deref_mut()
            .ok_or(QueueError::ConnectionReleased)?;
        ops::worker::delete_job(conn, &self.queue, self.priority, self.run_at, self.id).await?;
        self.deleted = true;

        Ok(())
    }

    /// Record a failure and reschedule the job.
    ///
    /// The stored `error_count` is incremented and `run_at` moves forward by
    /// the policy's delay for the current count. The row is authoritative; the
    /// in-memory `error_count` stays as claimed. The connection is not
    /// released, call [`Job::done`] for that.
    pub async fn error(&mut self, msg: &str) -> Result<(), QueueError> {
        let delay_secs = self.retry_policy.retry_delay(self.error_count);
        let error_count = self.error_count + 1;

        let conn = self
            .conn
            .as_deref_mut()
            .ok_or(QueueError::ConnectionReleased)?;
        ops::worker::set_error(
            conn,
            error_count,
            delay_secs,
            msg,
            &self.queue,
            self.priority,
            self.run_at,
            self.id,
        )
        .await?;

        Ok(())
    }

    /// Release the advisory lock and hand the connection back to the pool.
    ///
    /// Idempotent. An unlock failure is logged and swallowed: by the time it
    /// can happen a worse error is already in flight, and surfacing it would
    /// mask the outcome of the work itself. The connection is returned to the
    /// pool regardless, and the job is inert afterwards.
    pub async fn done(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };

        match ops::worker::unlock_job(&mut conn, self.id).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = self.id, "advisory lock was not held at release"),
            Err(error) => warn!(
                job_id = self.id,
                "failed to release advisory lock: {error}"
            ),
        }
        // Dropping the pooled connection returns it to the pool.
    }

    /// The connection the job's advisory lock lives on, for callers that want
    /// to run their own SQL in the job's session. `None` once [`Job::done`]
    /// has run.
    pub fn conn(&mut self) -> Option<&mut PgConnection> {
        self.conn.as_deref_mut()
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.conn.is_some() {
            warn!(
                job_id = self.id,
                "job dropped without done(); its advisory lock stays held by the pooled session"
            );
        }
    }
}
