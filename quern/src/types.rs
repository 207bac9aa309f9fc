use chrono::{DateTime, Utc};

/// A job to be enqueued.
///
/// Fields left unset fall back to the database defaults: the `""` queue,
/// priority `100`, `run_at = now()` and empty `{}` args.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    /// Handler key for this job. Must be non-empty.
    pub job_class: String,
    /// Queue the job is enqueued into.
    pub queue: Option<String>,
    /// Claim priority. Lower runs first.
    pub priority: Option<i16>,
    /// Earliest time the job may run.
    pub run_at: Option<DateTime<Utc>>,
    /// JSON arguments, opaque to the queue.
    pub args: Option<serde_json::Value>,
}

impl NewJob {
    pub fn new(job_class: &str) -> Self {
        Self {
            job_class: job_class.to_owned(),
            ..Default::default()
        }
    }

    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_owned());
        self
    }

    pub fn priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = Some(args);
        self
    }
}
