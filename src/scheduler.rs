use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::QueueError;
use crate::models::{
  Ack, Outcome, QueueStats, ScanResult, ScanTask, SeedSummary, TaskBatch, TaskFilter,
};
use crate::range::{CidrExpander, RangeExpander};
use crate::task_queue::TaskQueue;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
  pub lease_ttl: Duration,
  pub reap_interval: Duration,
  pub max_batch_size: usize,
  pub backoff_hint: Duration,
}

impl From<&Config> for SchedulerSettings {
  fn from(config: &Config) -> Self {
    Self {
      lease_ttl: config.lease_ttl,
      reap_interval: config.reap_interval,
      max_batch_size: config.max_batch_size,
      backoff_hint: config.backoff_hint,
    }
  }
}

/// The single gateway workers and operators talk to. Owns the task queue.
pub struct Scheduler {
  queue: TaskQueue,
  expander: Box<dyn RangeExpander>,
  settings: SchedulerSettings,
}

impl Scheduler {
  pub fn new(max_attempts: u32, settings: SchedulerSettings) -> Self {
    Self::with_expander(max_attempts, settings, Box::new(CidrExpander::default()))
  }

  pub fn with_expander(max_attempts: u32, settings: SchedulerSettings, expander: Box<dyn RangeExpander>) -> Self {
    Self {
      queue: TaskQueue::new(max_attempts),
      expander,
      settings,
    }
  }

  pub fn from_config(config: &Config) -> Self {
    Self::with_expander(
      config.max_attempts,
      SchedulerSettings::from(config),
      Box::new(CidrExpander::new(config.max_seed_hosts)),
    )
  }

  pub fn queue(&self) -> &TaskQueue {
    &self.queue
  }

  pub async fn seed(&self, ranges: &[String], rate_limit: u32) -> Result<SeedSummary, QueueError> {
    if rate_limit == 0 {
      return Err(QueueError::InvalidRateLimit);
    }
    let targets = self.expander.expand(ranges)?;

    let mut summary = SeedSummary::default();
    for ip in targets {
      match self.queue.enqueue(&ip.to_string(), rate_limit).await {
        Ok(_) => summary.created += 1,
        Err(QueueError::DuplicateTarget(_)) => summary.duplicates += 1,
        Err(e) => return Err(e),
      }
    }
    info!("Seeded {} task(s) at {} pps ({} duplicate target(s) skipped)", summary.created, rate_limit, summary.duplicates);
    Ok(summary)
  }

  pub async fn request_tasks(&self, node_id: &str, capacity: usize) -> TaskBatch {
    let max_count = capacity.min(self.settings.max_batch_size);
    let leased = self.queue.lease_batch(node_id, max_count, self.settings.lease_ttl).await;
    let backoff_hint_seconds = if leased.is_empty() {
      self.settings.backoff_hint.as_secs()
    } else {
      info!("Node {} leased {} task(s)", node_id, leased.len());
      0
    };
    TaskBatch {
      tasks: leased.iter().map(ScanTask::assignment).collect(),
      backoff_hint_seconds,
    }
  }

  pub async fn submit(&self, node_id: &str, task_id: Uuid, outcome: Outcome) -> Result<Ack, QueueError> {
    let ack = match outcome {
      Outcome::Success(result) => self.queue.submit_result(task_id, node_id, result).await,
      Outcome::Failure(reason) => self.queue.report_failure(task_id, node_id, &reason).await,
    };
    if let Err(e) = &ack {
      warn!("Rejected submission from {} for task {}: {}", node_id, task_id, e);
    }
    ack
  }

  pub async fn task(&self, task_id: Uuid) -> Option<ScanTask> {
    self.queue.get(task_id).await
  }

  pub async fn result(&self, task_id: Uuid) -> Option<ScanResult> {
    self.queue.result(task_id).await
  }

  pub async fn list_tasks(&self, filter: TaskFilter) -> Vec<ScanTask> {
    self.queue.list(filter).await
  }

  pub async fn stats(&self) -> QueueStats {
    self.queue.stats().await
  }

  /// Reclaims expired leases every `reap_interval` until cancelled.
  pub fn spawn_reaper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = interval(self.settings.reap_interval.max(Duration::from_millis(10)));
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = ticker.tick() => {
            let reaped = self.queue.reap_expired().await;
            if reaped > 0 {
              info!("Reaper reclaimed {} expired lease(s)", reaped);
            }
          }
        }
      }
      info!("Reaper stopped");
    })
  }
}
