use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::warn;
use uuid::Uuid;

use crate::error::ClientError;
use crate::models::{
  FetchRequest, Outcome, QueueStats, ScanTask, SubmitRequest, SubmitResponse, TaskBatch,
};
use crate::scheduler::Scheduler;

static MAX_RETRIES: usize = 5;
static BASE_DELAY_MS: u64 = 100;

/// How a worker reaches the scheduler.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
  async fn fetch_tasks(&self, node_id: &str, capacity: usize) -> Result<TaskBatch, ClientError>;

  async fn submit(&self, node_id: &str, task_id: Uuid, outcome: Outcome) -> Result<(), ClientError>;
}

/// Retries transport failures and 5xx replies with exponential backoff; scheduler rejections are final.
pub async fn submit_with_retry<C: SchedulerClient + ?Sized>(
  client: &C,
  node_id: &str,
  task_id: Uuid,
  outcome: &Outcome,
) -> Result<(), ClientError> {
  let strategy = ExponentialBackoff::from_millis(2).factor(BASE_DELAY_MS / 2).take(MAX_RETRIES);
  RetryIf::spawn(
    strategy,
    || client.submit(node_id, task_id, outcome.clone()),
    |e: &ClientError| {
      let transient = e.is_transient();
      if transient {
        warn!("Submitting task {} failed, retrying: {}", task_id, e);
      }
      transient
    },
  )
  .await
}

#[derive(Debug, Clone)]
pub struct HttpSchedulerClient {
  http: Client,
  base_url: String,
}

impl HttpSchedulerClient {
  pub fn new(base_url: impl Into<String>) -> Self {
    Self {
      http: Client::new(),
      base_url: base_url.into().trim_end_matches('/').to_string(),
    }
  }

  async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(ClientError::Status { status: status.as_u16(), body });
    }
    Ok(response.json().await?)
  }

  pub async fn list_tasks(&self, state: Option<&str>, limit: Option<usize>) -> Result<Vec<ScanTask>, ClientError> {
    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(state) = state {
      query.push(("state", state.to_string()));
    }
    if let Some(limit) = limit {
      query.push(("limit", limit.to_string()));
    }
    let response = self.http.get(format!("{}/tasks", self.base_url)).query(&query).send().await?;
    Self::decode(response).await
  }

  pub async fn stats(&self) -> Result<QueueStats, ClientError> {
    let response = self.http.get(format!("{}/stats", self.base_url)).send().await?;
    Self::decode(response).await
  }
}

#[async_trait]
impl SchedulerClient for HttpSchedulerClient {
  async fn fetch_tasks(&self, node_id: &str, capacity: usize) -> Result<TaskBatch, ClientError> {
    let request = FetchRequest { node_id: node_id.to_string(), capacity };
    let response = self
      .http
      .post(format!("{}/tasks/fetch", self.base_url))
      .json(&request)
      .send()
      .await?;
    Self::decode(response).await
  }

  async fn submit(&self, node_id: &str, task_id: Uuid, outcome: Outcome) -> Result<(), ClientError> {
    let request = SubmitRequest { node_id: node_id.to_string(), task_id, outcome };
    let response = self
      .http
      .post(format!("{}/tasks/submit", self.base_url))
      .json(&request)
      .send()
      .await?;
    let reply: SubmitResponse = Self::decode(response).await?;
    match (reply.ack, reply.error) {
      (true, _) => Ok(()),
      (false, Some(kind)) => Err(ClientError::Rejected(kind)),
      (false, None) => Err(ClientError::Status { status: 200, body: "submission not acknowledged".into() }),
    }
  }
}

/// Talks to a scheduler in the same process.
#[derive(Clone)]
pub struct LocalSchedulerClient {
  scheduler: Arc<Scheduler>,
}

impl LocalSchedulerClient {
  pub fn new(scheduler: Arc<Scheduler>) -> Self {
    Self { scheduler }
  }
}

#[async_trait]
impl SchedulerClient for LocalSchedulerClient {
  async fn fetch_tasks(&self, node_id: &str, capacity: usize) -> Result<TaskBatch, ClientError> {
    Ok(self.scheduler.request_tasks(node_id, capacity).await)
  }

  async fn submit(&self, node_id: &str, task_id: Uuid, outcome: Outcome) -> Result<(), ClientError> {
    self.scheduler.submit(node_id, task_id, outcome).await?;
    Ok(())
  }
}
