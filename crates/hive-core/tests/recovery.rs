mod common;

use std::time::Duration;

use common::{Harness, ok, script, take_assignment};
use hive_core::Queen;
use hive_core::config::{CircuitBreakerConfig, HiveConfig, RetryConfig};
use hive_core::domain::{EventKind, HiveError, RunStatus, TaskStatus, WorkerId, WorkerStatus};
use hive_core::resilience::CircuitState;
use serde_json::json;

#[tokio::test]
async fn orphaned_task_moves_to_a_live_worker() {
    let h = Harness::new();
    let queen = h.hive.queen().clone();
    let mut w1 = queen.register_worker().await;
    let mut w2 = queen.register_worker().await;

    let ids = queen
        .submit(vec![script("t", json!({ "hang_first": true }))])
        .await
        .unwrap();
    let id = ids[0];

    let report = queen.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![id]);
    let w1_id = w1.id;
    let first = h.hive.worker_executor(w1_id);
    let stuck = tokio::spawn(async move {
        let assignment = take_assignment(&mut w1);
        first.run(assignment).await
    });
    h.wait_for_status(id, TaskStatus::Running).await;

    // W1 goes silent; W2 keeps heartbeating.
    h.advance_secs(16);
    queen.heartbeat(w2.id).await.unwrap();

    let report = queen.tick().await.unwrap();
    assert_eq!(report.workers_lost, vec![w1_id]);
    assert_eq!(report.orphaned, vec![id]);
    assert_eq!(report.requeued, vec![id]);
    assert_eq!(report.dispatched, vec![id]);
    assert!(matches!(
        queen.heartbeat(w1_id).await,
        Err(HiveError::WorkerUnavailable(w)) if w == w1_id
    ));

    // The revoked run learns it was cancelled and loses the write-back.
    let stale = stuck.await.unwrap().unwrap().unwrap();
    assert_eq!(stale.status, RunStatus::Cancelled);

    let assignment = take_assignment(&mut w2);
    h.hive
        .worker_executor(w2.id)
        .run(assignment)
        .await
        .unwrap()
        .unwrap();

    let task = h.task(id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.assigned_worker, Some(w2.id));
    assert_eq!(task.attempt_count, 2);

    let attempts = h.hive.context().store.list_attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts[0].superseded);
    assert_eq!(attempts[0].worker_id, w1_id);
    assert!(!attempts[1].superseded);

    let kinds = h.events.kinds_for(id).await;
    assert!(kinds.contains(&EventKind::TaskOrphaned));
    assert!(kinds.contains(&EventKind::TaskRequeued));
    assert_eq!(h.events.count(EventKind::WorkerUnavailable).await, 1);
}

#[tokio::test]
async fn unavailable_worker_is_removed_after_another_window() {
    let h = Harness::new();
    let queen = h.hive.queen();
    let worker = queen.register_worker().await;

    h.advance_secs(16);
    let report = queen.tick().await.unwrap();
    assert_eq!(report.workers_lost, vec![worker.id]);
    let workers = queen.workers().await;
    assert_eq!(workers[0].status, WorkerStatus::Unavailable);

    h.advance_secs(16);
    let report = queen.tick().await.unwrap();
    assert_eq!(report.workers_removed, vec![worker.id]);
    assert!(queen.workers().await.is_empty());
}

#[tokio::test]
async fn orphan_with_no_attempts_left_fails() {
    let h = Harness::new();
    let queen = h.hive.queen();
    let mut worker = queen.register_worker().await;

    let id = queen
        .submit(vec![script("once", json!({})).with_max_attempts(1)])
        .await
        .unwrap()[0];
    queen.tick().await.unwrap();
    let _assignment = take_assignment(&mut worker);

    h.advance_secs(16);
    let report = queen.tick().await.unwrap();
    assert_eq!(report.orphaned, vec![id]);
    assert_eq!(report.failed, vec![id]);

    let task = h.task(id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("worker heartbeat lost"));
}

#[tokio::test]
async fn overdue_task_times_out_on_the_next_poll() {
    let config = HiveConfig {
        poll_interval: Duration::from_millis(500),
        ..HiveConfig::default()
    };
    let h = Harness::with_config(config);
    let queen = h.hive.queen().clone();
    let mut worker = queen.register_worker().await;

    let id = queen
        .submit(vec![
            script("slow", json!({ "hang_first": true })).with_timeout(Duration::from_secs(2)),
        ])
        .await
        .unwrap()[0];
    queen.tick().await.unwrap();

    let executor = h.hive.worker_executor(worker.id);
    let worker_id = worker.id;
    let run = tokio::spawn(async move {
        let assignment = take_assignment(&mut worker);
        executor.run(assignment).await
    });
    h.wait_for_status(id, TaskStatus::Running).await;

    h.clock.advance(chrono::Duration::milliseconds(1500));
    queen.heartbeat(worker_id).await.unwrap();
    assert!(queen.tick().await.unwrap().timed_out.is_empty());

    // One poll interval past the deadline.
    h.clock.advance(chrono::Duration::milliseconds(1000));
    let report = queen.tick().await.unwrap();
    assert_eq!(report.timed_out, vec![id]);
    assert_eq!(report.requeued, vec![id]);

    let revoked = run.await.unwrap().unwrap().unwrap();
    assert_eq!(revoked.status, RunStatus::Cancelled);

    // Attempts remain, so it is handed straight back out.
    assert_eq!(report.dispatched, vec![id]);
    let task = h.task(id).await;
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.attempt_count, 2);

    let kinds = h.events.kinds_for(id).await;
    let timed_out = kinds.iter().position(|k| *k == EventKind::TaskTimedOut);
    let requeued = kinds.iter().position(|k| *k == EventKind::TaskRequeued);
    assert!(timed_out.is_some() && timed_out < requeued);
}

#[tokio::test(start_paused = true)]
async fn worker_enforces_the_task_deadline() {
    let h = Harness::new();
    let queen = h.hive.queen();
    let mut worker = queen.register_worker().await;

    let id = queen
        .submit(vec![
            script("sleepy", json!({ "sleep_secs": 5.0 }))
                .with_timeout(Duration::from_secs(2))
                .with_max_attempts(1),
        ])
        .await
        .unwrap()[0];
    queen.tick().await.unwrap();

    let assignment = take_assignment(&mut worker);
    let report = h
        .hive
        .worker_executor(worker.id)
        .run(assignment)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.status, RunStatus::TimedOut);
    assert!(report.duration >= Duration::from_secs(2));
    assert!(report.duration < Duration::from_secs(5));
    assert_eq!(h.status_of(id).await, TaskStatus::Timeout);

    // No attempts left: the scheduler gives up on it.
    let tick = queen.tick().await.unwrap();
    assert_eq!(tick.failed, vec![id]);
    assert_eq!(h.status_of(id).await, TaskStatus::Failed);
}

#[tokio::test]
async fn open_breaker_defers_work_without_spending_attempts() {
    let config = HiveConfig {
        max_attempts_per_task: 3,
        circuit_breaker: CircuitBreakerConfig {
            threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        },
        retry: RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        },
        ..HiveConfig::default()
    };
    let h = Harness::with_config(config);
    let queen = h.hive.queen();
    let mut w1 = queen.register_worker().await;
    let mut w2 = queen.register_worker().await;

    let ids = queen
        .submit(vec![
            script("crash", json!({ "error": true })).with_priority(90),
            ok("fine").with_priority(10),
        ])
        .await
        .unwrap();
    let (crash, fine) = (ids[0], ids[1]);
    assert_eq!(queen.tick().await.unwrap().dispatched, vec![crash, fine]);

    // The first real failure opens the breaker for the whole kind.
    let first = take_assignment(&mut w1);
    let report = h.hive.worker_executor(w1.id).run(first).await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    let breaker = h.hive.context().breakers.get(common::SCRIPT);
    assert_eq!(breaker.get_status().state, CircuitState::Open);

    // The second run never reaches the executor and is handed back.
    let second = take_assignment(&mut w2);
    let report = h.hive.worker_executor(w2.id).run(second).await.unwrap().unwrap();
    assert_eq!(report.status, RunStatus::Deferred);
    let task = h.task(fine).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 0);
    assert!(task.error.unwrap().contains("circuit breaker open"));
    assert!(h.events.kinds_for(fine).await.contains(&EventKind::TaskDeferred));

    // While the breaker cools down nothing of that kind is dispatched.
    for _ in 0..5 {
        let report = queen.tick().await.unwrap();
        assert!(report.dispatched.is_empty());
    }
    let task = h.task(crash).await;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt_count, 1);
    assert_eq!(h.task(fine).await.attempt_count, 0);

    h.hive.context().breakers.reset_all();
    let report = queen.tick().await.unwrap();
    assert_eq!(report.dispatched, vec![crash, fine]);
}

#[tokio::test]
async fn oversized_timeout_does_not_overflow_the_deadline() {
    let h = Harness::new();
    let queen = h.hive.queen();
    let worker = queen.register_worker().await;

    let id = queen.submit(vec![ok("t")]).await.unwrap()[0];
    let mut task = h.task(id).await;
    task.timeout = Duration::MAX;

    let run = h.hive.context().ids.generate_run_id();
    let (_cancel_tx, cancel) = tokio::sync::watch::channel(false);
    let report = h
        .hive
        .worker_executor(worker.id)
        .execute(&task, run, cancel)
        .await;
    assert_eq!(report.status, RunStatus::Completed);
}

/// Poll until `queen` has `size` workers, none of them `without`.
async fn wait_for_pool(queen: &Queen, size: usize, without: Option<WorkerId>) {
    for _ in 0..500 {
        let workers = queen.workers().await;
        let gone = without.is_none_or(|w| workers.iter().all(|r| r.id != w));
        if workers.len() == size && gone {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("worker pool never reached {size}");
}

#[tokio::test]
async fn started_hive_replaces_a_dropped_worker() {
    let config = HiveConfig {
        max_concurrent_workers: 2,
        heartbeat_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        ..HiveConfig::default()
    };
    let h = Harness::with_config(config);
    let events = h.events.clone();
    let running = h.hive.start().await;
    let queen = running.queen().clone();

    wait_for_pool(&queen, 2, None).await;

    // Its next heartbeat is refused, so the worker exits and is replaced.
    let dropped = queen.workers().await[0].id;
    queen.deregister_worker(dropped).await.unwrap();
    wait_for_pool(&queen, 2, Some(dropped)).await;
    assert_eq!(events.count(EventKind::WorkerRegistered).await, 3);

    running.submit(vec![ok("after")]).await.unwrap();
    let status = running
        .wait_until_settled(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(status.tasks.completed, 1);
    running.shutdown_and_join().await;
}
