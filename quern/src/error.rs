use thiserror::Error;

/// Enumeration of database-related errors.
/// Errors that can originate from sqlx and are wrapped by us to name the
/// statement that failed.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("connection acquisition failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
}

/// Enumeration of errors surfaced by `Client` and `Job` operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Rejected before touching the database: a job with an empty class can
    /// never be routed to a handler.
    #[error("can't enqueue a job with an empty job class")]
    MissingType,
    /// Every claim attempt lost the race against peer workers. Transient;
    /// call `lock_job` again after a delay.
    #[error("claiming kept racing peer workers, try again")]
    Again,
    /// The job has already released its connection; no further statements can
    /// run on its session.
    #[error("job connection was already released")]
    ConnectionReleased,
    #[error(transparent)]
    Database(#[from] DatabaseError),
}
