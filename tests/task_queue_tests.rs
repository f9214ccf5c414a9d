use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use dtscan::error::QueueError;
use dtscan::models::{Ack, HostStatus, PortEntry, Protocol, ScanResult, TaskFilter, TaskState};
use dtscan::task_queue::TaskQueue;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

const TTL: Duration = Duration::from_secs(30);

fn result_for(task_id: Uuid, port: u16) -> ScanResult {
  ScanResult {
    task_id,
    host_status: HostStatus::Up,
    ports: vec![PortEntry { port, protocol: Protocol::Tcp }],
  }
}

#[tokio::test]
async fn duplicate_open_target_is_rejected_until_settled() {
  let queue = TaskQueue::new(3);
  let id = assert_ok!(queue.enqueue("10.0.0.1", 500).await);
  assert_eq!(assert_err!(queue.enqueue("10.0.0.1", 100).await), QueueError::DuplicateTarget("10.0.0.1".into()));

  queue.lease_batch("w1", 1, TTL).await;
  assert_err!(queue.enqueue("10.0.0.1", 500).await);

  assert_ok!(queue.submit_result(id, "w1", result_for(id, 22)).await);
  assert_ok!(queue.enqueue("10.0.0.1", 500).await);
}

#[tokio::test]
async fn failed_target_can_be_seeded_again() {
  let queue = TaskQueue::new(1);
  let id = assert_ok!(queue.enqueue("10.0.0.4", 500).await);
  queue.lease_batch("w1", 1, TTL).await;
  queue.report_failure(id, "w1", "filtered").await.unwrap();
  assert_eq!(queue.get(id).await.unwrap().state, TaskState::Failed);

  let retry = assert_ok!(queue.enqueue("10.0.0.4", 500).await);
  assert_ne!(retry, id);
  assert_err!(queue.enqueue("10.0.0.4", 500).await);
}

#[tokio::test]
async fn lease_batch_is_fifo_and_bounded() {
  let queue = TaskQueue::new(3);
  let mut ids = Vec::new();
  for i in 1..=5 {
    ids.push(queue.enqueue(&format!("10.0.0.{}", i), 100).await.unwrap());
  }

  let first = queue.lease_batch("w1", 2, TTL).await;
  assert_eq!(first.iter().map(|t| t.id).collect::<Vec<_>>(), ids[..2]);
  assert!(first.iter().all(|t| t.state == TaskState::Leased && t.lease_holder.as_deref() == Some("w1")));

  let second = queue.lease_batch("w2", 10, TTL).await;
  assert_eq!(second.iter().map(|t| t.id).collect::<Vec<_>>(), ids[2..]);
  assert!(queue.lease_batch("w3", 10, TTL).await.is_empty());
  assert!(queue.lease_batch("w3", 0, TTL).await.is_empty());
}

#[tokio::test]
async fn requeued_task_keeps_its_place_in_line() {
  let queue = TaskQueue::new(3);
  let a = queue.enqueue("10.0.0.1", 100).await.unwrap();
  let b = queue.enqueue("10.0.0.2", 100).await.unwrap();
  queue.lease_batch("w1", 1, TTL).await;
  assert_eq!(assert_ok!(queue.report_failure(a, "w1", "refused").await), Ack::Requeued { attempt_count: 1 });

  let next = queue.lease_batch("w2", 1, TTL).await;
  assert_eq!(next[0].id, a);
  assert_eq!(next[0].attempt_count, 1);
  assert_eq!(queue.lease_batch("w2", 1, TTL).await[0].id, b);
}

#[tokio::test]
async fn concurrent_leasing_never_hands_out_a_task_twice() {
  let queue = Arc::new(TaskQueue::new(3));
  for i in 0..200u32 {
    let ip = format!("10.0.{}.{}", i / 250, i % 250 + 1);
    queue.enqueue(&ip, 100).await.unwrap();
  }

  let mut handles = Vec::new();
  for n in 0..8 {
    let queue = queue.clone();
    handles.push(tokio::spawn(async move {
      let node = format!("w{}", n);
      let mut got = Vec::new();
      loop {
        let batch = queue.lease_batch(&node, 7, TTL).await;
        if batch.is_empty() {
          break got;
        }
        got.extend(batch.into_iter().map(|t| t.id));
        tokio::task::yield_now().await;
      }
    }));
  }

  let mut seen = HashSet::new();
  for handle in handles {
    for id in handle.await.unwrap() {
      assert!(seen.insert(id), "task {} leased twice", id);
    }
  }
  assert_eq!(seen.len(), 200);
}

#[tokio::test]
async fn submit_result_checks_task_and_lease() {
  let queue = TaskQueue::new(3);
  let id = queue.enqueue("10.0.0.1", 100).await.unwrap();

  let unknown = Uuid::new_v4();
  assert_eq!(assert_err!(queue.submit_result(unknown, "w1", result_for(unknown, 22)).await), QueueError::UnknownTask(unknown));
  assert_eq!(assert_err!(queue.submit_result(id, "w1", result_for(id, 22)).await), QueueError::NotLeased(id));

  queue.lease_batch("w1", 1, TTL).await;
  let err = assert_err!(queue.submit_result(id, "w2", result_for(id, 22)).await);
  assert!(matches!(err, QueueError::LeaseMismatch { ref holder, .. } if holder == "w1"));
  assert_eq!(queue.get(id).await.unwrap().state, TaskState::Leased);
}

#[tokio::test]
async fn duplicate_submission_is_an_idempotent_ack() {
  let queue = TaskQueue::new(3);
  let id = queue.enqueue("10.0.0.1", 100).await.unwrap();
  queue.lease_batch("w1", 1, TTL).await;

  assert_eq!(assert_ok!(queue.submit_result(id, "w1", result_for(id, 22)).await), Ack::Accepted);
  assert_eq!(assert_ok!(queue.submit_result(id, "w1", result_for(id, 8080)).await), Ack::AlreadyCompleted);

  let stored = queue.result(id).await.unwrap();
  assert_eq!(stored.ports, vec![PortEntry { port: 22, protocol: Protocol::Tcp }]);
  assert_eq!(queue.get(id).await.unwrap().state, TaskState::Completed);
}

#[tokio::test]
async fn submission_after_expiry_is_refused() {
  let queue = TaskQueue::new(3);
  let id = queue.enqueue("10.0.0.1", 100).await.unwrap();
  let start = Utc::now();
  queue.lease_batch_at("w1", 1, Duration::from_secs(10), start).await;

  let late = start + TimeDelta::seconds(11);
  assert_eq!(
    assert_err!(queue.submit_result_at(id, "w1", result_for(id, 22), late).await),
    QueueError::NotLeased(id)
  );
}

#[tokio::test]
async fn report_failure_requires_the_lease_holder() {
  let queue = TaskQueue::new(3);
  let id = queue.enqueue("10.0.0.1", 100).await.unwrap();
  assert_eq!(assert_err!(queue.report_failure(id, "w1", "x").await), QueueError::NotLeased(id));

  queue.lease_batch("w1", 1, TTL).await;
  assert!(matches!(assert_err!(queue.report_failure(id, "w2", "x").await), QueueError::LeaseMismatch { .. }));
  let task = queue.get(id).await.unwrap();
  assert_eq!(task.attempt_count, 0);
  assert_eq!(task.state, TaskState::Leased);
}

#[tokio::test]
async fn attempts_climb_until_the_task_fails() {
  let queue = TaskQueue::new(3);
  let id = queue.enqueue("10.0.0.1", 100).await.unwrap();

  for attempt in 1..=3u32 {
    let leased = queue.lease_batch("w1", 1, TTL).await;
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].attempt_count, attempt - 1);
    let ack = assert_ok!(queue.report_failure(id, "w1", "timeout").await);
    let task = queue.get(id).await.unwrap();
    assert_eq!(task.attempt_count, attempt);
    if attempt < 3 {
      assert_eq!(ack, Ack::Requeued { attempt_count: attempt });
      assert_eq!(task.state, TaskState::Pending);
    } else {
      assert_eq!(ack, Ack::Failed { attempt_count: 3 });
      assert_eq!(task.state, TaskState::Failed);
      assert_eq!(task.last_error.as_deref(), Some("timeout"));
    }
  }
  assert!(queue.lease_batch("w1", 1, TTL).await.is_empty());
}

#[tokio::test]
async fn single_attempt_task_fails_on_first_failure() {
  let queue = TaskQueue::new(1);
  let id = queue.enqueue("10.0.0.2", 100).await.unwrap();
  queue.lease_batch("w1", 1, TTL).await;
  assert_ok!(queue.report_failure(id, "w1", "refused").await);

  assert_eq!(queue.get(id).await.unwrap().state, TaskState::Failed);
  assert!(queue.lease_batch("w2", 5, TTL).await.is_empty());
  assert_err!(queue.submit_result(id, "w1", result_for(id, 22)).await);
}

#[tokio::test]
async fn reaper_reclaims_only_expired_leases() {
  let queue = TaskQueue::new(2);
  let short = queue.enqueue("10.0.0.1", 100).await.unwrap();
  let long = queue.enqueue("10.0.0.2", 100).await.unwrap();
  let start = Utc::now();
  queue.lease_batch_at("w1", 1, Duration::from_secs(5), start).await;
  queue.lease_batch_at("w2", 1, Duration::from_secs(60), start).await;

  assert_eq!(queue.reap_expired_at(start + TimeDelta::seconds(5)).await, 0);
  assert_eq!(queue.reap_expired_at(start + TimeDelta::seconds(6)).await, 1);

  let reclaimed = queue.get(short).await.unwrap();
  assert_eq!(reclaimed.state, TaskState::Pending);
  assert_eq!(reclaimed.attempt_count, 1);
  assert!(reclaimed.lease_holder.is_none());
  assert_eq!(queue.get(long).await.unwrap().state, TaskState::Leased);
  assert!(queue.leases("w1").await.is_empty());

  let later = start + TimeDelta::seconds(7);
  queue.lease_batch_at("w3", 1, Duration::from_secs(1), later).await;
  assert_eq!(queue.reap_expired_at(later + TimeDelta::seconds(2)).await, 1);
  assert_eq!(queue.get(short).await.unwrap().state, TaskState::Failed);
}

#[tokio::test]
async fn listing_and_stats_follow_creation_order() {
  let queue = TaskQueue::new(1);
  let a = queue.enqueue("10.0.0.1", 100).await.unwrap();
  let b = queue.enqueue("10.0.0.2", 100).await.unwrap();
  let c = queue.enqueue("10.0.0.3", 100).await.unwrap();
  queue.lease_batch("w1", 2, TTL).await;
  queue.submit_result(a, "w1", result_for(a, 22)).await.unwrap();
  queue.report_failure(b, "w1", "down").await.unwrap();

  let all = queue.list(TaskFilter::default()).await;
  assert_eq!(all.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a, b, c]);
  let failed = queue.list(TaskFilter { state: Some(TaskState::Failed), limit: None }).await;
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].id, b);
  assert_eq!(queue.list(TaskFilter { state: None, limit: Some(1) }).await.len(), 1);

  let stats = queue.stats().await;
  assert_eq!((stats.pending, stats.leased, stats.completed, stats.failed), (1, 0, 1, 1));
  assert_eq!(stats.active_leases, 0);
}
