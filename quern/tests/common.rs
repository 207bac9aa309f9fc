use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;

#[derive(sqlx::FromRow, Debug)]
#[allow(dead_code)]
pub struct JobRow {
    pub job_id: i64,
    pub queue: String,
    pub priority: i16,
    pub run_at: DateTime<Utc>,
    pub job_class: String,
    pub error_count: i32,
    pub last_error: Option<String>,
}

#[allow(dead_code)]
pub async fn count_jobs(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT count(*) FROM que_jobs")
        .fetch_one(pool)
        .await
        .expect("failed to count jobs")
}

#[allow(dead_code)]
pub async fn fetch_only_job(pool: &PgPool) -> JobRow {
    sqlx::query_as(
        "SELECT job_id, queue, priority, run_at, job_class, error_count, last_error FROM que_jobs",
    )
    .fetch_one(pool)
    .await
    .expect("expected exactly one job row")
}

/// Wait until every pooled connection is idle again. Dropped connections are
/// returned to the pool asynchronously, so pool accounting can lag the end of
/// a `work_one` call by a moment.
#[allow(dead_code)]
pub async fn wait_until_quiescent(pool: &PgPool) {
    for _ in 0..500 {
        if pool.num_idle() == pool.size() as usize {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "pool connections were not all returned: {} idle of {}",
        pool.num_idle(),
        pool.size()
    );
}
