//! # Retry
//!
//! Module providing a `RetryPolicy` to schedule when a failed job runs again.
use std::fmt;
use std::sync::Arc;

/// Maps a job's failure count to the delay, in seconds, before the job
/// becomes ready again.
///
/// The policy is consulted with the number of failures recorded *before* the
/// one currently being recorded, so a job failing for the first time is
/// delayed by `delay(0)` seconds.
#[derive(Clone)]
pub struct RetryPolicy {
    delay: Arc<dyn Fn(i32) -> i64 + Send + Sync>,
}

impl RetryPolicy {
    pub fn new(delay: impl Fn(i32) -> i64 + Send + Sync + 'static) -> Self {
        Self {
            delay: Arc::new(delay),
        }
    }

    /// Seconds until the next run for a job that has failed `error_count`
    /// times so far.
    pub fn retry_delay(&self, error_count: i32) -> i64 {
        (self.delay)(error_count)
    }
}

impl Default for RetryPolicy {
    /// Quartic backoff: 3, 4, 19, 84, 259... seconds for failure counts
    /// 0, 1, 2, 3, 4...
    fn default() -> Self {
        Self::new(|error_count| i64::from(error_count).pow(4) + 3)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryPolicy")
    }
}
