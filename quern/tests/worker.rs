use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use sqlx::PgPool;

use quern::{Client, Job, NewJob, Worker, WorkerMap};

mod common;
use common::{count_jobs, fetch_only_job, wait_until_quiescent};

#[sqlx::test(migrations = "./migrations")]
async fn test_work_one_returns_false_on_empty_queue(db: PgPool) {
    let ran = Arc::new(AtomicUsize::new(0));
    let map = WorkerMap::new().register("MyJob", {
        let ran = ran.clone();
        move |_job: &mut Job| {
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
            .boxed()
        }
    });
    let worker = Worker::new(Client::from_pool(db.clone()), map);

    assert!(!worker.work_one().await);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    wait_until_quiescent(&db).await;
}

#[sqlx::test(migrations = "./migrations")]
async fn test_work_one_runs_the_handler_and_deletes_the_job(db: PgPool) {
    let client = Client::from_pool(db.clone());
    client
        .enqueue(&NewJob::new("MyJob"))
        .await
        .expect("failed to enqueue job");

    let ran = Arc::new(AtomicUsize::new(0));
    let map = WorkerMap::new().register("MyJob", {
        let ran = ran.clone();
        move |_job: &mut Job| {
            let ran = ran.clone();
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
            .boxed()
        }
    });
    let worker = Worker::new(client, map);

    assert!(worker.work_one().await);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(count_jobs(&db).await, 0);
    wait_until_quiescent(&db).await;
}

#[sqlx::test(migrations = "./migrations")]
async fn test_handler_error_is_recorded_and_rescheduled(db: PgPool) {
    let client = Client::from_pool(db.clone());
    client
        .enqueue(&NewJob::new("MyJob"))
        .await
        .expect("failed to enqueue job");

    let map = WorkerMap::new().register("MyJob", |_job: &mut Job| {
        async move { anyhow::bail!("the error msg") }.boxed()
    });
    let worker = Worker::new(client, map);

    let before = chrono::Utc::now();
    assert!(worker.work_one().await);

    let row = fetch_only_job(&db).await;
    assert_eq!(row.error_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("the error msg"));
    // First failure reschedules by the default quartic delay of 3s.
    assert!(row.run_at - before >= chrono::Duration::seconds(2));
    assert!(row.run_at - before <= chrono::Duration::seconds(60));
    wait_until_quiescent(&db).await;
}

#[sqlx::test(migrations = "./migrations")]
async fn test_handler_panic_is_rescued_and_recorded(db: PgPool) {
    let client = Client::from_pool(db.clone());
    client
        .enqueue(&NewJob::new("MyJob"))
        .await
        .expect("failed to enqueue job");

    let map = WorkerMap::new().register("MyJob", |_job: &mut Job| {
        async move { panic!("the panic msg") }.boxed()
    });
    let worker = Worker::new(client, map);

    assert!(worker.work_one().await);

    let row = fetch_only_job(&db).await;
    assert_eq!(row.error_count, 1);
    let last_error = row.last_error.expect("expected a recorded panic");
    assert!(
        last_error.starts_with("the panic msg\n"),
        "panic payload missing from: {last_error}"
    );
    // The stack must point at both the worker's dispatch and the panic site.
    assert!(
        last_error.contains("src/worker.rs"),
        "worker frame missing from: {last_error}"
    );
    assert!(
        last_error.contains("tests/worker.rs"),
        "panic site frame missing from: {last_error}"
    );
    wait_until_quiescent(&db).await;
}

#[sqlx::test(migrations = "./migrations")]
async fn test_unknown_job_type_is_recorded_without_leaking(db: PgPool) {
    let client = Client::from_pool(db.clone());
    client
        .enqueue(&NewJob::new("MyJob"))
        .await
        .expect("failed to enqueue job");

    let worker = Worker::new(client, WorkerMap::new());

    let size_before = db.size();
    assert!(worker.work_one().await);
    wait_until_quiescent(&db).await;

    let row = fetch_only_job(&db).await;
    assert_eq!(row.error_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("unknown job type: \"MyJob\""));
    assert_eq!(db.size(), size_before);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_shutdown_stops_the_polling_loop(db: PgPool) {
    let worker = Arc::new(
        Worker::new(Client::from_pool(db.clone()), WorkerMap::new())
            .poll_interval(Duration::from_millis(50)),
    );

    let loop_handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.work().await }
    });

    // Let the loop poll the empty queue at least once.
    tokio::time::sleep(Duration::from_millis(120)).await;

    tokio::time::timeout(Duration::from_secs(5), worker.shutdown())
        .await
        .expect("shutdown did not complete");
    tokio::time::timeout(Duration::from_secs(5), loop_handle)
        .await
        .expect("work loop did not exit")
        .expect("work loop panicked");

    // Idempotent once the loop has stopped.
    tokio::time::timeout(Duration::from_secs(1), worker.shutdown())
        .await
        .expect("repeated shutdown did not return");

    assert_eq!(count_jobs(&db).await, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_shutdown_waits_for_the_in_flight_job(db: PgPool) {
    let client = Client::from_pool(db.clone());
    client
        .enqueue(&NewJob::new("Slow"))
        .await
        .expect("failed to enqueue job");

    let started = Arc::new(AtomicUsize::new(0));
    let map = WorkerMap::new().register("Slow", {
        let started = started.clone();
        move |_job: &mut Job| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                anyhow::Ok(())
            }
            .boxed()
        }
    });
    let worker = Arc::new(Worker::new(client, map).poll_interval(Duration::from_millis(50)));

    let loop_handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.work().await }
    });

    // Ask the worker to stop once the handler is demonstrably mid-job.
    while started.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::timeout(Duration::from_secs(5), worker.shutdown())
        .await
        .expect("shutdown did not complete");
    loop_handle.await.expect("work loop panicked");

    // The in-flight job ran to completion before the loop exited.
    assert_eq!(count_jobs(&db).await, 0);
    wait_until_quiescent(&db).await;
}

#[sqlx::test(migrations = "./migrations")]
async fn test_concurrent_workers_work_each_job_exactly_once(db: PgPool) {
    const JOBS: usize = 12;

    let client = Client::from_pool(db.clone());
    for _ in 0..JOBS {
        client
            .enqueue(&NewJob::new("Tally"))
            .await
            .expect("failed to enqueue job");
    }

    let tally = Arc::new(AtomicUsize::new(0));
    let make_worker = |tally: Arc<AtomicUsize>| {
        let map = WorkerMap::new().register("Tally", move |_job: &mut Job| {
            let tally = tally.clone();
            async move {
                tally.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
            .boxed()
        });
        Arc::new(Worker::new(Client::from_pool(db.clone()), map))
    };
    let worker_a = make_worker(tally.clone());
    let worker_b = make_worker(tally.clone());

    let drain = |worker: Arc<Worker>| async move { while worker.work_one().await {} };
    tokio::join!(drain(worker_a.clone()), drain(worker_b));

    // A racing attempt can bail early; one sequential sweep settles the rest.
    while worker_a.work_one().await {}

    assert_eq!(tally.load(Ordering::SeqCst), JOBS);
    assert_eq!(count_jobs(&db).await, 0);
    wait_until_quiescent(&db).await;
}
