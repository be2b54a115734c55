//! Integration tests against a live Redis server.
//!
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_integration -- --ignored
//!
//! Each test uses its own random key prefix so runs do not interfere.

use std::sync::Arc;
use std::time::Duration;

use frameflow::config::SchedulerConfig;
use frameflow::events::{BroadcastEventBus, EventBus, RedisEventBus, SESSION_COMPLETED_EVENT};
use frameflow::scheduler::{CleanupOutcome, Job, JobState, KeySpace, Scheduler, SessionRecord};
use frameflow::store::{ListPush, QueueStore, RedisStore, SessionDecrement};
use futures::StreamExt;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn unique_prefix() -> String {
    format!("frameflow-test-{}", uuid::Uuid::new_v4())
}

async fn connect() -> RedisStore {
    RedisStore::connect(&redis_url())
        .await
        .expect("REDIS_URL must point at a running Redis for integration tests")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_move_requeue_ack_round_trip() {
    let store = connect().await;
    let prefix = unique_prefix();
    let (queue, processing) = (format!("{prefix}:q"), format!("{prefix}:p"));

    store
        .push_batch(&[ListPush::new(queue.clone(), vec!["a".into(), "b".into()])])
        .await
        .unwrap();

    let moved = store.move_one(&queue, &processing, None).await.unwrap();
    assert_eq!(moved.as_deref(), Some("a"));
    assert_eq!(store.list_lengths(&[&queue, &processing]).await.unwrap(), vec![1, 1]);

    assert!(store.requeue(&queue, &processing, "a").await.unwrap());
    assert_eq!(store.list_lengths(&[&queue, &processing]).await.unwrap(), vec![2, 0]);

    let moved = store
        .move_one(&queue, &processing, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(moved.as_deref(), Some("b"));
    assert!(store.ack(&processing, "b").await.unwrap());
    assert!(!store.ack(&processing, "b").await.unwrap());

    store.delete(&queue).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_blocking_move_times_out_on_empty_lane() {
    let store = connect().await;
    let prefix = unique_prefix();

    let moved = store
        .move_one(
            &format!("{prefix}:empty"),
            &format!("{prefix}:p"),
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    assert!(moved.is_none());
}

#[tokio::test]
#[ignore]
async fn test_session_script_lifecycle() {
    let store = connect().await;
    let prefix = unique_prefix();
    let (record, counter) = (format!("{prefix}:s"), format!("{prefix}:s:remaining"));
    let ttl = Duration::from_secs(60);

    assert!(store.init_session(&record, &counter, "{}", 2, ttl).await.unwrap());
    assert!(!store.init_session(&record, &counter, "{}", 9, ttl).await.unwrap());

    assert_eq!(
        store.decrement_session(&record, &counter).await.unwrap(),
        SessionDecrement::Pending { remaining: 1 }
    );
    assert_eq!(
        store.decrement_session(&record, &counter).await.unwrap(),
        SessionDecrement::Cleaned {
            record: Some("{}".to_string())
        }
    );
    assert_eq!(
        store.decrement_session(&record, &counter).await.unwrap(),
        SessionDecrement::Missing
    );
}

#[tokio::test]
#[ignore]
async fn test_increment_with_ttl() {
    let store = connect().await;
    let key = format!("{}:retries", unique_prefix());

    assert_eq!(store.increment_with_ttl(&key, Duration::from_secs(60)).await.unwrap(), 1);
    assert_eq!(store.increment_with_ttl(&key, Duration::from_secs(60)).await.unwrap(), 2);
    store.delete(&key).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_concurrent_cleanup_over_redis() {
    let store = Arc::new(connect().await);
    let bus = Arc::new(BroadcastEventBus::new(64));
    let mut rx = bus.subscribe();
    let config = SchedulerConfig::default().with_key_prefix(unique_prefix());

    let processes: Vec<Scheduler> = (0..4)
        .map(|_| Scheduler::new(store.clone(), bus.clone(), config.clone()))
        .collect();
    processes[0]
        .sessions()
        .initialize_session(&SessionRecord::new("s1", "team-a", "rasterizer", 20))
        .await
        .unwrap();

    let tasks = (0..20).map(|i| {
        let scheduler = processes[i % processes.len()].clone();
        tokio::spawn(async move {
            let job = Job::new(format!("j{i}"), "rasterizer", "team-a", serde_json::Value::Null)
                .with_session("s1");
            scheduler.sessions().check_and_cleanup_session(&job).await.unwrap()
        })
    });

    let cleaned = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|outcome| matches!(outcome, Ok(CleanupOutcome::Cleaned { .. })))
        .count();

    assert_eq!(cleaned, 1);
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
#[ignore]
async fn test_producer_and_status_over_redis() {
    let store = Arc::new(connect().await);
    let config = SchedulerConfig::default()
        .with_key_prefix(unique_prefix())
        .with_fetch_timeout(Duration::from_secs(1));
    let scheduler = Scheduler::new(store, Arc::new(BroadcastEventBus::default()), config);

    let jobs = vec![
        Job::new("f1", "rasterizer", "team-a", serde_json::json!({"frame": 1})),
        Job::new("f2", "rasterizer", "team-a", serde_json::json!({"frame": 2})).with_priority(true),
    ];
    scheduler
        .producer()
        .start_session("rasterizer", "team-a", "s1", jobs, serde_json::Value::Null)
        .await
        .unwrap();

    let claimed = scheduler.manager().fetch_jobs("rasterizer", 5).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert_eq!(claimed[0].job().job_id, "f2");

    assert_eq!(
        scheduler.statuses().get_status("f1").await.unwrap().unwrap().status,
        JobState::Queued
    );
    assert_eq!(
        scheduler.registry().get_team_job_ids("team-a").await.unwrap(),
        vec!["f1", "f2"]
    );
    assert_eq!(scheduler.sessions().remaining("s1").await.unwrap(), Some(2));
}

#[tokio::test]
#[ignore]
async fn test_redis_event_bus_publishes_json() {
    let channel = KeySpace::new(unique_prefix()).events_channel();
    let client = redis::Client::open(redis_url()).unwrap();
    let mut pubsub = client.get_async_connection().await.unwrap().into_pubsub();
    pubsub.subscribe(&channel).await.unwrap();

    let bus = RedisEventBus::connect(&redis_url(), channel.clone())
        .await
        .unwrap();
    bus.publish(SESSION_COMPLETED_EVENT, serde_json::json!({"session_id": "s1"}))
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), pubsub.on_message().next())
        .await
        .expect("message should arrive")
        .expect("stream should stay open");
    let body: serde_json::Value =
        serde_json::from_str(&message.get_payload::<String>().unwrap()).unwrap();

    assert_eq!(body["event"], "session.completed");
    assert_eq!(body["payload"]["session_id"], "s1");
}
