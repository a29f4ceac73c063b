//! Integration tests against a live Redis.
//!
//! Run with: cargo test -p soundry-queue -- --ignored

use std::time::Duration;

use soundry_models::{DownloadJob, GroupId, JobPriority, ProviderRef, RetryPolicy, TrackId};
use soundry_queue::{
    FailOutcome, JobBroker, JobQueue, JobSource, QueueConfig, RedisSafeMode, SafeModeFlag,
};

/// A key prefix that will not collide with other test runs.
fn unique_prefix() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("soundry-test-{nanos}")
}

fn test_queue() -> JobQueue {
    dotenvy::dotenv().ok();
    let config = QueueConfig {
        redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into()),
        prefix: unique_prefix(),
        lease: Duration::from_secs(60),
    };
    JobQueue::new(config).expect("Failed to create queue")
}

fn job(grouped: bool) -> DownloadJob {
    DownloadJob::new(
        TrackId::new(),
        "session",
        grouped.then(GroupId::new),
        ProviderRef::youtube("dQw4w9WgXcQ"),
        vec![],
    )
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_priority_ordering() {
    let queue = test_queue();
    let grouped = job(true);
    let single = job(false);
    queue.enqueue(&grouped, JobPriority::Grouped, RetryPolicy::default()).await.unwrap();
    queue.enqueue(&single, JobPriority::Single, RetryPolicy::default()).await.unwrap();

    let first = queue.dequeue().await.unwrap().expect("job");
    assert_eq!(first.job().job_id, single.job_id);
    queue.ack(&first).await.unwrap();

    let second = queue.dequeue().await.unwrap().expect("job");
    assert_eq!(second.job().job_id, grouped.job_id);
    queue.ack(&second).await.unwrap();

    let depth = queue.depth().await.unwrap();
    assert_eq!(depth.waiting + depth.active, 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_retry_then_dead_letter() {
    let queue = test_queue();
    let policy = RetryPolicy {
        attempts: 2,
        backoff: soundry_models::Backoff::Fixed { delay_ms: 10 },
    };
    queue.enqueue(&job(false), JobPriority::Single, policy).await.unwrap();

    let delivery = queue.dequeue().await.unwrap().expect("job");
    let outcome = queue.fail(&delivery, "HTTP 503", true).await.unwrap();
    assert!(matches!(outcome, FailOutcome::Retrying { .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let delivery = queue.dequeue().await.unwrap().expect("retried job");
    assert_eq!(delivery.attempt, 2);

    let outcome = queue.fail(&delivery, "HTTP 503", true).await.unwrap();
    assert_eq!(outcome, FailOutcome::DeadLettered);
    assert_eq!(queue.dead_letters(10).await.unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_safe_mode_flag_roundtrip() {
    dotenvy::dotenv().ok();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
    let flag = RedisSafeMode::new(&url).unwrap().with_key(format!("{}:circuit", unique_prefix()));

    assert!(!flag.is_set().await.unwrap());
    flag.set().await.unwrap();
    assert!(flag.is_set().await.unwrap());
    flag.clear().await.unwrap();
    assert!(!flag.is_set().await.unwrap());
}
