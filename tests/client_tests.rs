use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dtscan::client::{HttpSchedulerClient, SchedulerClient, submit_with_retry};
use dtscan::error::{ClientError, ErrorKind};
use dtscan::models::{HostStatus, Outcome, PortEntry, Protocol, ScanResult, TaskBatch, TaskState};
use dtscan::routes::routes;
use dtscan::scheduler::{Scheduler, SchedulerSettings};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn scheduler() -> Arc<Scheduler> {
  Arc::new(Scheduler::new(
    3,
    SchedulerSettings {
      lease_ttl: Duration::from_secs(30),
      reap_interval: Duration::from_secs(15),
      max_batch_size: 10,
      backoff_hint: Duration::from_secs(2),
    },
  ))
}

fn serve(scheduler: Arc<Scheduler>) -> HttpSchedulerClient {
  let (addr, server) = warp::serve(routes(scheduler)).bind_ephemeral(([127, 0, 0, 1], 0));
  tokio::spawn(server);
  HttpSchedulerClient::new(format!("http://{}/", addr))
}

#[tokio::test]
async fn http_client_fetches_and_submits() {
  let scheduler = scheduler();
  scheduler.seed(&["10.0.0.1-10.0.0.2".to_string()], 250).await.unwrap();
  let client = serve(scheduler.clone());

  let batch = assert_ok!(client.fetch_tasks("w1", 5).await);
  assert_eq!(batch.tasks.len(), 2);
  assert_eq!(batch.tasks[0].rate_limit, 250);
  let task_id = batch.tasks[0].task_id;

  let result = ScanResult { task_id, host_status: HostStatus::Up, ports: vec![PortEntry { port: 22, protocol: Protocol::Tcp }] };
  assert_ok!(client.submit("w1", task_id, Outcome::Success(result)).await);
  assert_eq!(scheduler.task(task_id).await.unwrap().state, TaskState::Completed);

  let empty = assert_ok!(client.fetch_tasks("w1", 5).await);
  assert!(empty.tasks.is_empty());
  assert_eq!(empty.backoff_hint_seconds, 2);

  let completed = assert_ok!(client.list_tasks(Some("completed"), None).await);
  assert_eq!(completed.len(), 1);
  assert_eq!(assert_ok!(client.stats().await).leased, 1);
}

#[tokio::test]
async fn http_client_maps_refusals_to_typed_errors() {
  let scheduler = scheduler();
  scheduler.seed(&["10.0.0.1".to_string()], 100).await.unwrap();
  let client = serve(scheduler.clone());
  let task_id = assert_ok!(client.fetch_tasks("w1", 1).await).tasks[0].task_id;

  let err = assert_err!(client.submit("w2", task_id, Outcome::Failure("stolen".into())).await);
  assert!(matches!(err, ClientError::Rejected(ErrorKind::LeaseMismatch)), "{:?}", err);

  let err = assert_err!(client.submit("w1", Uuid::new_v4(), Outcome::Failure("gone".into())).await);
  assert!(matches!(err, ClientError::Rejected(ErrorKind::UnknownTask)), "{:?}", err);

  let err = assert_err!(client.fetch_tasks("not a node id", 1).await);
  assert!(matches!(err, ClientError::Status { status: 400, .. }), "{:?}", err);
  assert!(!err.is_transient());
}

/// Replays a fixed script of submit replies and counts the calls.
struct ScriptedClient {
  replies: Mutex<VecDeque<Result<(), ClientError>>>,
  calls: Mutex<usize>,
}

impl ScriptedClient {
  fn new(replies: Vec<Result<(), ClientError>>) -> Self {
    Self { replies: Mutex::new(replies.into()), calls: Mutex::new(0) }
  }

  fn calls(&self) -> usize {
    *self.calls.lock().unwrap()
  }
}

#[async_trait]
impl SchedulerClient for ScriptedClient {
  async fn fetch_tasks(&self, _node_id: &str, _capacity: usize) -> Result<TaskBatch, ClientError> {
    Ok(TaskBatch { tasks: vec![], backoff_hint_seconds: 0 })
  }

  async fn submit(&self, _node_id: &str, _task_id: Uuid, _outcome: Outcome) -> Result<(), ClientError> {
    *self.calls.lock().unwrap() += 1;
    self.replies.lock().unwrap().pop_front().unwrap_or(Ok(()))
  }
}

fn bad_gateway() -> ClientError {
  ClientError::Status { status: 502, body: "upstream unavailable".into() }
}

#[tokio::test(start_paused = true)]
async fn submit_retries_server_errors_until_accepted() {
  let client = ScriptedClient::new(vec![Err(bad_gateway()), Err(bad_gateway()), Ok(())]);
  assert_ok!(submit_with_retry(&client, "w1", Uuid::new_v4(), &Outcome::Failure("x".into())).await);
  assert_eq!(client.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn submit_gives_up_on_server_errors_after_the_retry_limit() {
  let client = ScriptedClient::new((0..10).map(|_| Err(bad_gateway())).collect());
  let err = assert_err!(submit_with_retry(&client, "w1", Uuid::new_v4(), &Outcome::Failure("x".into())).await);
  assert!(matches!(err, ClientError::Status { status: 502, .. }));
  assert_eq!(client.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn submit_does_not_retry_rejections() {
  let client = ScriptedClient::new(vec![
    Err(ClientError::Rejected(ErrorKind::NotLeased)),
    Ok(()),
  ]);
  let err = assert_err!(submit_with_retry(&client, "w1", Uuid::new_v4(), &Outcome::Failure("x".into())).await);
  assert!(matches!(err, ClientError::Rejected(ErrorKind::NotLeased)));
  assert_eq!(client.calls(), 1);

  let client = ScriptedClient::new(vec![Err(ClientError::Status { status: 409, body: String::new() }), Ok(())]);
  assert_err!(submit_with_retry(&client, "w1", Uuid::new_v4(), &Outcome::Failure("x".into())).await);
  assert_eq!(client.calls(), 1);
}
