use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::client::Client;
use crate::job::Job;

/// Sleep between polls that found nothing to work.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// A job handler: borrows the claimed job for the duration of the work.
/// Returning an error records it on the job and reschedules it.
pub type WorkFn =
    Box<dyn for<'a> Fn(&'a mut Job) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

/// Maps a job class to the handler that runs it. Read-only once a worker is
/// polling.
#[derive(Default)]
pub struct WorkerMap {
    handlers: HashMap<String, WorkFn>,
}

impl WorkerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for jobs whose class is `job_class`.
    pub fn register<F>(mut self, job_class: &str, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut Job) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.handlers.insert(job_class.to_owned(), Box::new(handler));
        self
    }

    fn get(&self, job_class: &str) -> Option<&WorkFn> {
        self.handlers.get(job_class)
    }
}

/// A worker polling one queue and running claimed jobs sequentially, one at a
/// time.
///
/// Workers scale horizontally: each one owns its loop and the database
/// arbitrates claims, so no coordination between workers is needed. Share a
/// worker behind `Arc` to call [`Worker::shutdown`] from another task.
pub struct Worker {
    client: Client,
    work_map: WorkerMap,
    queue: String,
    poll_interval: Duration,
    shutdown_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

impl Worker {
    /// A worker over `client` polling the default (`""`) queue every
    /// [`DEFAULT_POLL_INTERVAL`].
    pub fn new(client: Client, work_map: WorkerMap) -> Self {
        record_panic_backtraces();

        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let (done_tx, _done_rx) = watch::channel(false);

        Self {
            client,
            work_map,
            queue: String::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_tx,
            done_tx,
        }
    }

    /// Poll `queue` instead of the default queue.
    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_owned();
        self
    }

    /// Sleep `interval` after polls that found no work.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Claim and run at most one job. Returns whether a job was worked.
    ///
    /// Claim errors are logged and reported as "no work" so a polling loop
    /// keeps its cadence instead of bailing. Handler errors and panics are
    /// recorded on the job and never propagate. On every path the job's
    /// connection is released before returning.
    pub async fn work_one(&self) -> bool {
        let mut job = match self.client.lock_job(&self.queue).await {
            Ok(Some(job)) => job,
            Ok(None) => return false,
            Err(lock_error) => {
                error!(queue = %self.queue, "failed to lock a job: {lock_error}");
                return false;
            }
        };

        let labels = [("queue", self.queue.clone())];
        metrics::counter!("quern_jobs_claimed_total", &labels).increment(1);
        let started = tokio::time::Instant::now();

        match self.work_map.get(&job.job_class) {
            None => {
                let msg = format!("unknown job type: \"{}\"", job.job_class);
                error!(job_id = job.id, "{msg}");
                if let Err(record_error) = job.error(&msg).await {
                    error!(
                        job_id = job.id,
                        "failed to record unknown job type: {record_error}"
                    );
                }
                metrics::counter!("quern_jobs_unknown_total", &labels).increment(1);
            }
            Some(handler) => match AssertUnwindSafe(handler(&mut job)).catch_unwind().await {
                Ok(Ok(())) => {
                    if let Err(delete_error) = job.delete().await {
                        error!(
                            job_id = job.id,
                            "failed to delete finished job: {delete_error}"
                        );
                    }
                    metrics::counter!("quern_jobs_completed_total", &labels).increment(1);
                }
                Ok(Err(work_error)) => {
                    let msg = format!("{work_error:#}");
                    debug!(job_id = job.id, job_class = %job.job_class, "job failed: {msg}");
                    if let Err(record_error) = job.error(&msg).await {
                        error!(job_id = job.id, "failed to record job error: {record_error}");
                    }
                    metrics::counter!("quern_jobs_errored_total", &labels).increment(1);
                }
                Err(panic) => {
                    let msg = panic_error_message(panic);
                    error!(job_id = job.id, job_class = %job.job_class, "job panicked: {msg}");
                    if let Err(record_error) = job.error(&msg).await {
                        error!(job_id = job.id, "failed to record job panic: {record_error}");
                    }
                    metrics::counter!("quern_jobs_panicked_total", &labels).increment(1);
                }
            },
        }

        metrics::histogram!("quern_jobs_processing_duration_seconds", &labels)
            .record(started.elapsed().as_secs_f64());

        job.done().await;

        true
    }

    /// Poll for jobs until [`Worker::shutdown`] is called.
    ///
    /// Runs [`Worker::work_one`] back to back while there is work, sleeping
    /// `poll_interval` between empty polls. The sleep is cut short by
    /// shutdown; a job in flight when shutdown arrives is finished and
    /// released before the loop exits.
    pub async fn work(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            if !self.work_one().await {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        debug!(queue = %self.queue, "worker stopped");
        self.done_tx.send_replace(true);
    }

    /// Signal the polling loop to stop and wait until it has.
    ///
    /// Idempotent. In-flight work is not interrupted; the loop exits once the
    /// current job (if any) has been released. Must be called while (or after)
    /// [`Worker::work`] is running, and does not prevent a later `work` call
    /// from polling again.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let mut done = self.done_tx.subscribe();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }
}

static RECORD_PANIC_BACKTRACES: Once = Once::new();

thread_local! {
    static LAST_PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a panic hook that records the backtrace at the panic point, before
/// unwinding tears the stack down. `catch_unwind` only yields the payload,
/// which is too late to see any frames.
fn record_panic_backtraces() {
    RECORD_PANIC_BACKTRACES.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            LAST_PANIC_BACKTRACE.with(|cell| {
                *cell.borrow_mut() = Some(Backtrace::force_capture().to_string());
            });
            previous(info);
        }));
    });
}

/// Render a caught panic as the message stored in `last_error`: the payload,
/// then the stack active when the panic fired. The payload is commonly but not
/// always a `&'static str` or `String`; anything else gets a placeholder.
fn panic_error_message(panic: Box<dyn Any + Send>) -> String {
    let payload = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    };

    let backtrace = LAST_PANIC_BACKTRACE
        .with(|cell| cell.borrow_mut().take())
        .unwrap_or_else(|| Backtrace::force_capture().to_string());

    format!("{payload}\n{backtrace}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_error_message_includes_payload_and_stack() {
        record_panic_backtraces();

        let panic = std::panic::catch_unwind(|| panic!("boom: {}", 7)).unwrap_err();
        let msg = panic_error_message(panic);

        assert!(msg.starts_with("boom: 7\n"));
        assert!(msg.contains("worker.rs"));
    }

    #[test]
    fn test_panic_error_message_handles_opaque_payloads() {
        record_panic_backtraces();

        let panic = std::panic::catch_unwind(|| std::panic::panic_any(17_u32)).unwrap_err();
        let msg = panic_error_message(panic);

        assert!(msg.starts_with("unknown panic payload\n"));
    }
}
