//! The worker side of the coordinator: poll for leases, scan, report back.
//!
//! Leases are never released explicitly. A worker that stops mid-batch simply
//! lets its leases run out and the scheduler's reaper hands the tasks out again.

use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{SchedulerClient, submit_with_retry};
use crate::config::WorkerConfig;
use crate::error::ScanError;
use crate::executor::ScanExecutor;
use crate::models::{Outcome, ScanResult, TaskAssignment};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub capacity: usize,
  pub concurrency: usize,
  pub rate_budget: u32,
  pub scan_timeout: Duration,
  pub backoff_initial: Duration,
  pub backoff_max: Duration,
}

impl From<&WorkerConfig> for WorkerSettings {
  fn from(config: &WorkerConfig) -> Self {
    Self {
      capacity: config.capacity,
      concurrency: config.concurrency,
      rate_budget: config.rate_budget,
      scan_timeout: config.scan_timeout,
      backoff_initial: config.backoff_initial,
      backoff_max: config.backoff_max,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
  Completed,
  Failed,
  /// The scheduler never acknowledged the outcome; the lease will expire.
  Unreported,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
  pub batches: usize,
  pub completed: usize,
  pub failed: usize,
  pub unreported: usize,
}

impl WorkerReport {
  fn absorb(&mut self, settlements: Vec<Settlement>) {
    for settlement in settlements {
      match settlement {
        Settlement::Completed => self.completed += 1,
        Settlement::Failed => self.failed += 1,
        Settlement::Unreported => self.unreported += 1,
      }
    }
  }
}

pub struct Worker {
  node_id: String,
  client: Arc<dyn SchedulerClient>,
  executor: Arc<dyn ScanExecutor>,
  settings: WorkerSettings,
  rate_budget: Semaphore,
}

impl Worker {
  pub fn new(
    node_id: impl Into<String>,
    client: Arc<dyn SchedulerClient>,
    executor: Arc<dyn ScanExecutor>,
    settings: WorkerSettings,
  ) -> Self {
    let rate_budget = Semaphore::new(settings.rate_budget.max(1) as usize);
    Self {
      node_id: node_id.into(),
      client,
      executor,
      settings,
      rate_budget,
    }
  }

  pub fn node_id(&self) -> &str {
    &self.node_id
  }

  fn idle_backoff(&self) -> ExponentialBackoff {
    let initial_ms = self.settings.backoff_initial.as_millis().max(2) as u64;
    ExponentialBackoff::from_millis(2)
      .factor(initial_ms / 2)
      .max_delay(self.settings.backoff_max)
  }

  /// Polls, scans and reports until `cancel` fires.
  pub async fn run(&self, cancel: CancellationToken) -> WorkerReport {
    let mut report = WorkerReport::default();
    let mut backoff = self.idle_backoff();
    info!("Worker {} started (capacity {}, concurrency {})", self.node_id, self.settings.capacity, self.settings.concurrency);

    while !cancel.is_cancelled() {
      let fetched = tokio::select! {
        _ = cancel.cancelled() => break,
        fetched = self.client.fetch_tasks(&self.node_id, self.settings.capacity) => fetched,
      };

      let tasks = match fetched {
        Ok(batch) if !batch.tasks.is_empty() => batch.tasks,
        Ok(batch) => {
          let hint = Duration::from_secs(batch.backoff_hint_seconds);
          let delay = next_delay(&mut backoff, self.settings.backoff_max).max(hint).min(self.settings.backoff_max);
          debug!("Worker {}: no tasks available, backing off for {:?}", self.node_id, delay);
          if !sleep_or_cancel(delay, &cancel).await {
            break;
          }
          continue;
        }
        Err(e) => {
          let delay = next_delay(&mut backoff, self.settings.backoff_max);
          warn!("Worker {}: fetching tasks failed, retrying in {:?}: {}", self.node_id, delay, e);
          if !sleep_or_cancel(delay, &cancel).await {
            break;
          }
          continue;
        }
      };

      backoff = self.idle_backoff();
      report.batches += 1;
      let count = tasks.len();
      tokio::select! {
        _ = cancel.cancelled() => {
          warn!("Worker {}: cancelled with {} task(s) in flight, leaving them to expire", self.node_id, count);
          break;
        }
        settlements = self.process_batch(tasks) => report.absorb(settlements),
      }
    }

    info!(
      "Worker {} stopped: {} batch(es), {} completed, {} failed, {} unreported",
      self.node_id, report.batches, report.completed, report.failed, report.unreported
    );
    report
  }

  async fn process_batch(&self, tasks: Vec<TaskAssignment>) -> Vec<Settlement> {
    stream::iter(tasks)
      .map(|task| self.process_task(task))
      .buffer_unordered(self.settings.concurrency.max(1))
      .collect()
      .await
  }

  async fn process_task(&self, task: TaskAssignment) -> Settlement {
    let outcome = {
      let permits = task.rate_limit.clamp(1, self.settings.rate_budget.max(1));
      let Ok(_permit) = self.rate_budget.acquire_many(permits).await else {
        return Settlement::Unreported;
      };
      info!("Worker {} scanning {} at {} pps", self.node_id, task.target_ip, task.rate_limit);
      let scan = self.executor.execute(&task.target_ip, task.rate_limit);
      match timeout(self.settings.scan_timeout, scan).await {
        Ok(Ok(scan)) => Outcome::Success(ScanResult::new(task.task_id, scan)),
        Ok(Err(e)) => Outcome::Failure(e.to_string()),
        Err(_) => Outcome::Failure(ScanError::Timeout(self.settings.scan_timeout).to_string()),
      }
    };

    let settlement = match &outcome {
      Outcome::Success(_) => Settlement::Completed,
      Outcome::Failure(reason) => {
        warn!("Worker {}: scan of {} failed: {}", self.node_id, task.target_ip, reason);
        Settlement::Failed
      }
    };

    match submit_with_retry(self.client.as_ref(), &self.node_id, task.task_id, &outcome).await {
      Ok(()) => settlement,
      Err(e) => {
        error!("Worker {}: could not report task {}: {}", self.node_id, task.task_id, e);
        Settlement::Unreported
      }
    }
  }
}

fn next_delay(backoff: &mut ExponentialBackoff, ceiling: Duration) -> Duration {
  backoff.next().unwrap_or(ceiling).min(ceiling)
}

/// Sleeps for `delay`; returns false if cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
  tokio::select! {
    _ = cancel.cancelled() => false,
    _ = sleep(delay) => true,
  }
}
