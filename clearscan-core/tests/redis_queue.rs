//! Runs against a live Redis only when `CLEARSCAN_TEST_REDIS_URL` is set.
#![cfg(feature = "redis")]

use std::time::Duration;

use clearscan_core::{
    JobId, QueueError, ScanReport, WorkQueue,
    queue::{RedisQueue, RedisQueueConfig},
};
use redis::AsyncCommands;

async fn test_queue(lock_duration: Duration) -> Option<(RedisQueue, redis::aio::ConnectionManager)> {
    let Ok(url) = std::env::var("CLEARSCAN_TEST_REDIS_URL") else {
        eprintln!("CLEARSCAN_TEST_REDIS_URL not set; skipping");
        return None;
    };
    let config = RedisQueueConfig {
        url: url.clone(),
        name: format!("test-{}", uuid::Uuid::new_v4()),
        lock_duration,
        poll_interval: Duration::from_millis(20),
        ..RedisQueueConfig::default()
    };
    let queue = RedisQueue::connect(config).await.unwrap();
    let client = redis::Client::open(url).unwrap();
    let conn = redis::aio::ConnectionManager::new(client).await.unwrap();
    Some((queue, conn))
}

async fn enqueue(
    conn: &mut redis::aio::ConnectionManager,
    queue: &RedisQueue,
    id: &str,
    data: &str,
) {
    let id = JobId::new(id);
    let _: () = conn.hset(queue.keys().job(&id), "data", data).await.unwrap();
    let _: () = conn.lpush(queue.keys().wait(), id.as_str()).await.unwrap();
}

#[tokio::test]
async fn dequeue_then_resolve_writes_bull_fields() {
    let Some((queue, mut conn)) = test_queue(Duration::from_secs(30)).await else {
        return;
    };
    enqueue(
        &mut conn,
        &queue,
        "42",
        r#"{"files":[{"hash":"abc","path":"a.txt"}]}"#,
    )
    .await;

    let lease = queue
        .dequeue(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("job should be waiting");
    assert_eq!(lease.job.id.as_str(), "42");
    assert_eq!(lease.job.files[0].path, "a.txt");

    let lock: Option<String> = conn.get(queue.keys().lock(&lease.job.id)).await.unwrap();
    assert_eq!(lock, Some(lease.token.to_string()));
    assert!(queue.extend_lock(&lease).await.unwrap());

    queue
        .resolve(&lease, &ScanReport::new(r#"{"files":[]}"#))
        .await
        .unwrap();

    let job_key = queue.keys().job(&lease.job.id);
    let returned: String = conn.hget(&job_key, "returnvalue").await.unwrap();
    assert_eq!(returned, r#"{"result":"{\"files\":[]}"}"#);
    let completed: Option<f64> =
        conn.zscore(queue.keys().completed(), "42").await.unwrap();
    assert!(completed.is_some());
    let active: usize = conn.llen(queue.keys().active()).await.unwrap();
    assert_eq!(active, 0);

    assert!(matches!(
        queue.reject(&lease, "late").await,
        Err(QueueError::LockLost(_))
    ));
}

#[tokio::test]
async fn malformed_payload_is_failed_immediately() {
    let Some((queue, mut conn)) = test_queue(Duration::from_secs(30)).await else {
        return;
    };
    enqueue(&mut conn, &queue, "bad", "not json").await;

    let lease = queue.dequeue(Duration::from_millis(100)).await.unwrap();
    assert!(lease.is_none());

    let reason: String = conn
        .hget(queue.keys().job(&JobId::new("bad")), "failedReason")
        .await
        .unwrap();
    assert!(
        reason.starts_with("invalid job: malformed payload:"),
        "{reason}"
    );
}

#[tokio::test]
async fn stalled_jobs_are_requeued_then_failed() {
    let Some((queue, mut conn)) = test_queue(Duration::from_millis(50)).await else {
        return;
    };
    enqueue(&mut conn, &queue, "7", r#"{"files":[]}"#).await;

    let first = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let sweep = queue.recover_stalled().await.unwrap();
    assert_eq!((sweep.requeued, sweep.failed), (1, 0));
    assert!(matches!(
        queue.resolve(&first, &ScanReport::new("{}")).await,
        Err(QueueError::LockLost(_))
    ));

    let _second = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let sweep = queue.recover_stalled().await.unwrap();
    assert_eq!((sweep.requeued, sweep.failed), (0, 1));

    let failed: Option<f64> = conn.zscore(queue.keys().failed(), "7").await.unwrap();
    assert!(failed.is_some());
}
