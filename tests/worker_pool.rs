//! End-to-end tests for the worker pool against the in-memory broker.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tubeworker::broker::{BrokerCall, JobState};
use tubeworker::{
    CommandJob, CommandRouter, ConfigError, ErrorAction, InMemoryBroker, Job, JobManager,
    RecordingLogger, WorkerError, WorkerPool,
};

#[derive(Debug, Deserialize)]
struct Email {
    to: String,
}

fn pool_with_logger(broker: &InMemoryBroker) -> (WorkerPool, Arc<RecordingLogger>) {
    let logger = Arc::new(RecordingLogger::new());
    let mut pool = WorkerPool::new(broker.clone());
    pool.set_logger(logger.clone());
    (pool, logger)
}

type RunHandle = JoinHandle<Result<(), WorkerError>>;

fn start(pool: WorkerPool) -> (Arc<WorkerPool>, CancellationToken, RunHandle) {
    let pool = Arc::new(pool);
    let cancel = CancellationToken::new();
    let handle = {
        let pool = Arc::clone(&pool);
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.run(cancel).await })
    };
    (pool, cancel, handle)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn test_two_workers_deliver_each_job_exactly_once() {
    let broker = InMemoryBroker::new();
    let mut expected = HashSet::new();
    for i in 0..5 {
        let email = format!(r#"{{"to":"user{i}@example.com"}}"#);
        expected.insert(broker.put("emails", 10, Duration::ZERO, email));
        expected.insert(broker.put("audit", 10, Duration::ZERO, format!(r#"{{"event":{i}}}"#)));
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (mut pool, logger) = pool_with_logger(&broker);
    pool.set_num_workers(2);
    {
        let seen = seen.clone();
        pool.subscribe("emails", move |job: Job, email: Email| {
            let seen = seen.clone();
            async move {
                assert!(email.to.ends_with("@example.com"));
                seen.lock().unwrap().push(job.id());
                job.delete().await;
            }
        })
        .unwrap();
    }
    {
        let seen = seen.clone();
        pool.subscribe("audit", move |job: Job, _event: Value| {
            let seen = seen.clone();
            async move {
                // Yield mid-handler so the workers interleave.
                tokio::task::yield_now().await;
                seen.lock().unwrap().push(job.id());
                job.delete().await;
            }
        })
        .unwrap();
    }

    let (pool, cancel, handle) = start(pool);
    wait_until(|| seen.lock().unwrap().len() >= 10).await;
    cancel.cancel();
    handle.await.unwrap().expect("clean shutdown");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 10);
    assert_eq!(seen.iter().copied().collect::<HashSet<_>>(), expected);
    assert!(broker.is_empty());

    let stats = pool.stats();
    assert_eq!(stats.num_workers, 2);
    assert_eq!(stats.connects, 2);
    assert_eq!(stats.jobs_reserved, 10);
    assert_eq!(stats.jobs_handled, 10);
    assert!(logger.errors().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_workers_runs_exactly_one() {
    let broker = InMemoryBroker::new();
    let (mut pool, _logger) = pool_with_logger(&broker);
    pool.set_num_workers(0);
    pool.subscribe("emails", |job: Job, _email: Email| async move {
        job.delete().await;
    })
    .unwrap();

    let (pool, cancel, handle) = start(pool);
    tokio::time::sleep(Duration::from_secs(150)).await;

    assert_eq!(broker.dial_count(), 1);
    assert_eq!(pool.stats().active_workers, 1);
    assert!(pool.stats().reserve_timeouts >= 2);

    cancel.cancel();
    handle.await.unwrap().expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_handler_sees_reservation_metadata() {
    let broker = InMemoryBroker::new();
    let id = broker.put("emails", 42, Duration::ZERO, r#"{"to":"a@example.com"}"#);

    let seen = Arc::new(Mutex::new(None));
    let (mut pool, _logger) = pool_with_logger(&broker);
    {
        let seen = seen.clone();
        pool.subscribe("emails", move |job: Job, email: Email| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap() = Some((
                    job.id(),
                    job.tube().to_string(),
                    job.priority(),
                    job.delay(),
                    job.reserves(),
                    job.releases(),
                    job.return_priority(),
                    job.return_delay(),
                    email.to,
                ));
                job.delete().await;
            }
        })
        .unwrap();
    }

    let (_pool, cancel, handle) = start(pool);
    wait_until(|| seen.lock().unwrap().is_some()).await;
    cancel.cancel();
    handle.await.unwrap().expect("clean shutdown");

    assert_eq!(
        seen.lock().unwrap().clone(),
        Some((
            id,
            "emails".to_string(),
            42,
            Duration::ZERO,
            1,
            0,
            42,
            Duration::from_secs(60),
            "a@example.com".to_string(),
        ))
    );
}

#[tokio::test(start_paused = true)]
async fn test_release_with_custom_priority() {
    let broker = InMemoryBroker::new();
    let id = broker.put("emails", 100, Duration::ZERO, r#"{"to":"a@example.com"}"#);

    let (mut pool, _logger) = pool_with_logger(&broker);
    pool.subscribe("emails", |mut job: Job, _email: Email| async move {
        job.set_return_priority(5);
        job.release().await;
    })
    .unwrap();

    let (_pool, cancel, handle) = start(pool);
    wait_until(|| !broker.calls().is_empty()).await;
    cancel.cancel();
    handle.await.unwrap().expect("clean shutdown");

    assert_eq!(
        broker.calls(),
        vec![BrokerCall::Release {
            id,
            priority: 5,
            delay: Duration::from_secs(60),
        }]
    );
    assert_eq!(broker.job_state(id), Some(JobState::Delayed));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_buried_and_logged() {
    let broker = InMemoryBroker::new();
    let id = broker.put("emails", 77, Duration::ZERO, "{\"to\": ");

    let called = Arc::new(Mutex::new(false));
    let (mut pool, logger) = pool_with_logger(&broker);
    pool.set_unmarshal_error_action(ErrorAction::Bury);
    {
        let called = called.clone();
        pool.subscribe("emails", move |job: Job, _email: Email| {
            let called = called.clone();
            async move {
                *called.lock().unwrap() = true;
                job.delete().await;
            }
        })
        .unwrap();
    }

    let (pool, cancel, handle) = start(pool);
    wait_until(|| broker.job_state(id) == Some(JobState::Buried)).await;
    cancel.cancel();
    handle.await.unwrap().expect("clean shutdown");

    assert!(!*called.lock().unwrap());
    assert_eq!(broker.calls(), vec![BrokerCall::Bury { id, priority: 77 }]);
    assert!(logger.has_error_containing("Error decoding payload"));
    assert!(logger.has_error_containing("'{\"to\": '"));
    assert_eq!(pool.stats().decode_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_command_is_deleted_without_handler_call() {
    let broker = InMemoryBroker::new();
    let noop = broker.put("commands", 1, Duration::ZERO, r#"{"cmd":"noop"}"#);
    let resize = broker.put("commands", 2, Duration::ZERO, r#"{"cmd":"resize","width":640}"#);

    let widths = Arc::new(Mutex::new(Vec::new()));
    let mut router = CommandRouter::new();
    {
        let widths = widths.clone();
        router
            .subscribe("resize", move |job: CommandJob| {
                let widths = widths.clone();
                async move {
                    widths.lock().unwrap().push(job.get_field("width"));
                    job.delete().await;
                }
            })
            .unwrap();
    }

    let (mut pool, logger) = pool_with_logger(&broker);
    pool.subscribe_commands("commands", router).unwrap();

    let (pool, cancel, handle) = start(pool);
    wait_until(|| broker.is_empty()).await;
    cancel.cancel();
    handle.await.unwrap().expect("clean shutdown");

    assert_eq!(widths.lock().unwrap().clone(), vec!["640".to_string()]);
    assert_eq!(
        broker.calls(),
        vec![
            BrokerCall::Delete { id: noop },
            BrokerCall::Delete { id: resize },
        ]
    );
    assert!(logger.has_error_containing("Unrecognised command"));

    let stats = pool.stats();
    assert_eq!(stats.unknown_commands, 1);
    assert_eq!(stats.jobs_handled, 1);
}

#[tokio::test]
async fn test_run_without_subscriptions_returns_config_error() {
    let broker = InMemoryBroker::new();
    let (pool, logger) = pool_with_logger(&broker);

    let err = pool
        .run(CancellationToken::new())
        .await
        .expect_err("nothing to run");

    assert!(matches!(err, WorkerError::Config(ConfigError::NoSubscriptions)));
    assert_eq!(broker.dial_count(), 0);
    assert_eq!(logger.errors().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_touch_after_finish_logs_and_continues() {
    let broker = InMemoryBroker::new();
    broker.put("emails", 1, Duration::ZERO, r#"{"to":"a@example.com"}"#);
    broker.put("emails", 2, Duration::ZERO, r#"{"to":"b@example.com"}"#);

    let (mut pool, logger) = pool_with_logger(&broker);
    pool.subscribe("emails", |job: Job, _email: Email| async move {
        job.delete().await;
        job.touch().await;
    })
    .unwrap();

    let (_pool, cancel, handle) = start(pool);
    wait_until(|| logger.errors().len() >= 2).await;
    cancel.cancel();
    handle.await.unwrap().expect("clean shutdown");

    assert!(broker.is_empty());
    assert_eq!(logger.errors().len(), 2);
    assert!(logger.has_error_containing("Could not touch job"));
}
