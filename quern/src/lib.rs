//! # Quern
//!
//! A job queue implemented on top of a PostgreSQL table, with session-level
//! advisory locks arbitrating job ownership between workers.
//!
//! Producers enqueue jobs, on the shared pool or inside their own
//! transactions, and workers poll a queue, claiming one job at a time. A
//! claimed job stays pinned to the database connection whose session holds its
//! advisory lock until it is released, so no peer can claim it in between.
//! Completion deletes the row; failure records the error and reschedules the
//! job according to a retry policy.

mod ops;

// We do this pattern (privately use a module, then re-export parts of it) so we
// can refactor or rename the internals without breaking the public API.

// Types
mod types;
pub use types::NewJob;

// Errors
mod error;
// Errors about the database itself - acquisition failures, failed statements
pub use error::DatabaseError;
// Errors about queue usage - empty job classes, contended claims, released jobs
pub use error::QueueError;

// Client
mod client;
pub use client::Client;
pub use client::ClientBuilder;
pub use client::DEFAULT_MAX_LOCK_ATTEMPTS;

// Job
mod job;
pub use job::Job;

// Retry
mod retry;
pub use retry::RetryPolicy;

// Worker
mod worker;
pub use worker::WorkFn;
pub use worker::Worker;
pub use worker::WorkerMap;
pub use worker::DEFAULT_POLL_INTERVAL;
