//! Task lifecycle against a file-backed SQLite database: retries,
//! reclaiming, cancellation, shutdown and the worker pool.

mod common;

use std::sync::Arc;
use std::time::Duration;

use jobforge::scheduler::{
    Backoff, Disposition, HeartbeatMetrics, LogEvent, PollOutcome, QueueConfig, TaskOutcome,
    TaskQueue, WorkerStatus,
};
use jobforge::storage::CancelOutcome;
use jobforge::{NewTask, SchedulingPolicy, TaskId, TaskStatus, TaskStore};
use tokio_util::sync::CancellationToken;

/// Polls until `id` reaches `status` or `within` elapses.
async fn wait_for_status(store: &TaskStore, id: TaskId, status: TaskStatus, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let current = store.get(id).await.expect("get").status;
        if current == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {} stuck in {} waiting for {}",
            id,
            current,
            status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn fast_config() -> QueueConfig {
    QueueConfig::default()
        .with_poll_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(50)))
        .with_heartbeat_interval(Duration::from_millis(50))
        .with_cancel_grace(Duration::from_millis(500))
}

#[tokio::test]
async fn test_task_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let params = serde_json::json!({"url": "https://example.com/v/1", "tags": ["a", "b"]});
    let id = {
        let store = common::file_store(&dir).await;
        store
            .enqueue(NewTask::new("echo", params.clone()).with_priority(70).with_max_retries(5))
            .await
            .expect("enqueue")
    };

    let store = common::file_store(&dir).await;
    let task = store.get(id).await.expect("get");
    assert_eq!(task.task_type, "echo");
    assert_eq!(task.parameters, params);
    assert_eq!(task.priority, 70);
    assert_eq!(task.max_retries, 5);
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 0);
}

#[tokio::test]
async fn test_transient_failures_stop_at_retry_ceiling() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, clock) = common::file_store_with_clock(&dir).await;
    let config = QueueConfig::default()
        .with_retry_backoff(Backoff::new(Duration::from_secs(1), Duration::from_secs(1)));
    let queue = TaskQueue::with_store(store.clone(), config).with_seed(5);
    let worker = queue.worker().with_id("w-1");

    let id = queue
        .enqueue(NewTask::new("flaky", serde_json::json!({})).with_max_retries(3))
        .await
        .expect("enqueue");

    let shutdown = CancellationToken::new();
    let mut dispositions = Vec::new();
    loop {
        match worker.poll_once(&shutdown).await.expect("poll") {
            PollOutcome::Processed { task_id, disposition } => {
                assert_eq!(task_id, id);
                let done = disposition.terminal_status().is_some();
                dispositions.push(disposition);
                if done {
                    break;
                }
            }
            PollOutcome::Empty { .. } => clock.advance(Duration::from_secs(2)),
        }
        assert!(dispositions.len() <= 4, "task retried past its ceiling");
    }

    assert_eq!(dispositions.len(), 4);
    for (i, disposition) in dispositions.iter().take(3).enumerate() {
        assert!(
            matches!(disposition, Disposition::Retried { retry_count, .. } if *retry_count == i as u32 + 1),
            "unexpected disposition {:?}",
            disposition
        );
    }
    assert_eq!(dispositions[3], Disposition::DeadLettered);

    let task = store.get(id).await.expect("get");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert!(task.error_message.is_some());

    let logs = store.list_logs(id).await.expect("logs");
    let retried = logs.iter().filter(|e| e.event == LogEvent::Retried).count();
    assert_eq!(retried, 3);
    assert_eq!(logs.last().map(|e| e.event), Some(LogEvent::Failed));
}

#[tokio::test]
async fn test_stale_worker_task_is_reclaimed_after_ttl() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (store, clock) = common::file_store_with_clock(&dir).await;
    let queue = TaskQueue::with_store(
        store.clone(),
        QueueConfig::default().with_heartbeat_ttl(Duration::from_secs(30)),
    );

    let id = queue
        .enqueue(NewTask::new("echo", serde_json::json!({})))
        .await
        .expect("enqueue");
    queue
        .heartbeat("w-1", WorkerStatus::Busy, &HeartbeatMetrics::default())
        .await
        .expect("heartbeat");
    queue
        .claim_next("w-1", SchedulingPolicy::Fifo)
        .await
        .expect("claim")
        .expect("task");
    queue.start_task(id, "w-1").await.expect("start").expect("owned");

    clock.advance(Duration::from_secs(29));
    assert!(queue.sweep().await.expect("sweep").is_empty());
    assert_eq!(store.get(id).await.expect("get").status, TaskStatus::Running);

    clock.advance(Duration::from_secs(2));
    let report = queue.sweep().await.expect("sweep");
    assert_eq!(report.reclaimed, vec![id]);
    let task = store.get(id).await.expect("get");
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 1);

    let reclaimed = queue
        .claim_next("w-2", SchedulingPolicy::Fifo)
        .await
        .expect("claim")
        .expect("task");
    assert_eq!(reclaimed.id, id);
    assert_eq!(reclaimed.claimed_by.as_deref(), Some("w-2"));

    // The original worker's late report must not touch the new claim.
    let late = queue
        .report_result(id, "w-1", TaskOutcome::Succeeded(serde_json::json!({})))
        .await
        .expect("report");
    assert_eq!(late, Disposition::Lost);
    let task = store.get(id).await.expect("get");
    assert_eq!(task.status, TaskStatus::Claimed);
    assert_eq!(task.claimed_by.as_deref(), Some("w-2"));
}

#[tokio::test]
async fn test_cancel_queued_and_held_tasks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = common::file_store(&dir).await;
    let queue = TaskQueue::with_store(store.clone(), QueueConfig::default());

    let queued = queue
        .enqueue(NewTask::new("echo", serde_json::json!({})))
        .await
        .expect("enqueue");
    assert_eq!(queue.cancel(queued).await.expect("cancel"), CancelOutcome::Cancelled);
    assert_eq!(store.get(queued).await.expect("get").status, TaskStatus::Cancelled);
    assert_eq!(
        queue.cancel(queued).await.expect("cancel"),
        CancelOutcome::AlreadyFinished(TaskStatus::Cancelled)
    );

    let held = queue
        .enqueue(NewTask::new("echo", serde_json::json!({})))
        .await
        .expect("enqueue");
    queue
        .claim_next("w-1", SchedulingPolicy::Fifo)
        .await
        .expect("claim")
        .expect("task");
    queue.start_task(held, "w-1").await.expect("start").expect("owned");
    assert_eq!(queue.cancel(held).await.expect("cancel"), CancelOutcome::Requested);
    assert!(store.get(held).await.expect("get").cancel_requested);

    let disposition = queue
        .report_result(held, "w-1", TaskOutcome::Cancelled("stopped".to_string()))
        .await
        .expect("report");
    assert_eq!(disposition, Disposition::Cancelled);
    assert_eq!(store.get(held).await.expect("get").status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_running_worker_observes_cancellation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = common::file_store(&dir).await;
    let queue = TaskQueue::with_store(store.clone(), fast_config());
    let id = queue
        .enqueue(NewTask::new("patient", serde_json::json!({})))
        .await
        .expect("enqueue");

    let worker = Arc::new(queue.worker().with_id("w-1"));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&worker).run(shutdown.clone()));

    wait_for_status(&store, id, TaskStatus::Running, Duration::from_secs(5)).await;
    assert_eq!(queue.cancel(id).await.expect("cancel"), CancelOutcome::Requested);
    wait_for_status(&store, id, TaskStatus::Cancelled, Duration::from_secs(5)).await;

    shutdown.cancel();
    let stats = handle.await.expect("join");
    assert_eq!(stats.processed, 1);

    let logs = store.list_logs(id).await.expect("logs");
    assert_eq!(logs.last().map(|e| e.event), Some(LogEvent::Cancelled));
}

#[tokio::test]
async fn test_shutdown_releases_task_without_retry_penalty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = common::file_store(&dir).await;
    let queue = TaskQueue::with_store(store.clone(), fast_config());
    let id = queue
        .enqueue(NewTask::new("patient", serde_json::json!({})))
        .await
        .expect("enqueue");

    let worker = Arc::new(queue.worker().with_id("w-1"));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&worker).run(shutdown.clone()));

    wait_for_status(&store, id, TaskStatus::Running, Duration::from_secs(5)).await;
    shutdown.cancel();
    handle.await.expect("join");

    let task = store.get(id).await.expect("get");
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.retry_count, 0);
    assert!(task.claimed_by.is_none());
    let logs = store.list_logs(id).await.expect("logs");
    assert_eq!(logs.last().map(|e| e.event), Some(LogEvent::Released));
    assert!(store.get_heartbeat("w-1").await.expect("heartbeat").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_drains_queue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = fast_config()
        .with_database_url(common::database_url(&dir))
        .with_worker_count(3)
        .with_policy(SchedulingPolicy::Priority)
        .with_shutdown_timeout(Duration::from_secs(10));
    let queue = TaskQueue::open(config, Arc::new(common::registry()))
        .await
        .expect("open");

    let tasks: Vec<NewTask> = (0..20)
        .map(|i| NewTask::new("echo", serde_json::json!({ "n": i })).with_priority(i % 10))
        .collect();
    let ids = queue.enqueue_batch(tasks).await.expect("enqueue");

    let mut pool = queue.worker_pool();
    pool.start().await.expect("start");
    for id in &ids {
        wait_for_status(queue.store(), *id, TaskStatus::Completed, Duration::from_secs(10)).await;
    }
    pool.shutdown().await.expect("shutdown");

    let stats = pool.stats();
    assert_eq!(stats.num_workers, 3);
    assert_eq!(stats.tasks_completed, 20);
    assert_eq!(stats.tasks_failed, 0);

    let task = queue.get_task(ids[7]).await.expect("get");
    assert_eq!(task.result, Some(serde_json::json!({ "n": 7 })));

    let snapshot = queue
        .views()
        .snapshot(Duration::from_secs(30), Duration::from_secs(3600))
        .await
        .expect("snapshot");
    assert_eq!(snapshot.depth_by_status.get("completed"), Some(&20));
    assert_eq!(snapshot.throughput.completed, 20);
    assert_eq!(snapshot.fairness.samples, 20);
}
