use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;

use crate::error::{DatabaseError, QueueError};
use crate::job::Job;
use crate::ops;
use crate::retry::RetryPolicy;
use crate::types::NewJob;

/// Claim attempts per `lock_job` call before giving up with
/// [`QueueError::Again`].
pub const DEFAULT_MAX_LOCK_ATTEMPTS: u32 = 10;

/// Entry point for enqueueing and claiming jobs.
///
/// Cheaply cloneable; clones share the pool. The pool's size bounds how many
/// jobs can be in flight at once, since every claimed job pins one connection
/// until it is released.
#[derive(Clone, Debug)]
pub struct Client {
    pool: PgPool,
    retry_policy: RetryPolicy,
    max_lock_attempts: u32,
}

impl Client {
    /// A client over `pool` with the default retry policy and claim bound.
    pub fn from_pool(pool: PgPool) -> Self {
        Self::builder(pool).build()
    }

    /// Initialize a [`ClientBuilder`] for overriding the defaults.
    pub fn builder(pool: PgPool) -> ClientBuilder {
        ClientBuilder::new(pool)
    }

    /// Enqueue `job` in its own implicit transaction.
    pub async fn enqueue(&self, job: &NewJob) -> Result<(), QueueError> {
        if job.job_class.is_empty() {
            return Err(QueueError::MissingType);
        }

        ops::manager::insert_job(&self.pool, job).await?;

        Ok(())
    }

    /// Enqueue `job` on the caller's open transaction.
    ///
    /// The job becomes visible to workers only when the caller commits, which
    /// gives transactional-outbox semantics: the job exists if and only if the
    /// surrounding work does. Commit and rollback stay the caller's
    /// responsibility.
    pub async fn enqueue_in_tx(
        &self,
        job: &NewJob,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<(), QueueError> {
        if job.job_class.is_empty() {
            return Err(QueueError::MissingType);
        }

        ops::manager::insert_job(&mut **tx, job).await?;

        Ok(())
    }

    /// Claim the next ready job in `queue`, or `None` if there is nothing to
    /// do. On success the returned [`Job`] owns the pooled connection holding
    /// its advisory lock; the caller must see it through to [`Job::done`].
    ///
    /// The claim query walks the ready jobs under an MVCC snapshot, so it can
    /// acquire an advisory lock on a row a peer has deleted in the meantime.
    /// Every successful lock is therefore re-checked against the committed
    /// view; a failed check releases the stale lock and claims again, a
    /// bounded number of times. Exhausting the bound surfaces
    /// [`QueueError::Again`].
    pub async fn lock_job(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|error| DatabaseError::ConnectionError { error })?;

        for _ in 0..self.max_lock_attempts {
            let Some(row) = ops::worker::lock_job(&mut conn, queue).await? else {
                return Ok(None);
            };

            if ops::worker::check_job(&mut conn, &row.queue, row.priority, row.run_at, row.job_id)
                .await?
            {
                return Ok(Some(Job::new(row, conn, self.retry_policy.clone())));
            }

            // A peer finished this job between our snapshot and the advisory
            // lock landing. Release the stale lock before trying again, or it
            // stays held for the session's lifetime.
            if let Err(error) = ops::worker::unlock_job(&mut conn, row.job_id).await {
                warn!(
                    job_id = row.job_id,
                    "failed to release stale advisory lock: {error}"
                );
            }
        }

        Err(QueueError::Again)
    }

    /// The pool this client was built over.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Builder pattern struct to provide a [`Client`].
pub struct ClientBuilder {
    pool: PgPool,
    retry_policy: RetryPolicy,
    max_lock_attempts: u32,
}

impl ClientBuilder {
    fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
            max_lock_attempts: DEFAULT_MAX_LOCK_ATTEMPTS,
        }
    }

    /// The retry policy handed to every job this client claims.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> ClientBuilder {
        self.retry_policy = retry_policy;
        self
    }

    /// How many contended claim attempts `lock_job` makes before giving up.
    pub fn max_lock_attempts(mut self, attempts: u32) -> ClientBuilder {
        self.max_lock_attempts = attempts;
        self
    }

    /// Provide a `Client` according to build parameters provided thus far.
    pub fn build(self) -> Client {
        Client {
            pool: self.pool,
            retry_policy: self.retry_policy,
            max_lock_attempts: self.max_lock_attempts,
        }
    }
}
