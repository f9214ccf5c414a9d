//! In-memory scan task queue.
//!
//! Every state transition goes through one async mutex, so a task can never be
//! leased twice or settled by two callers at once.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{
  Ack, QueueStats, ScanResult, ScanTask, TaskFilter, TaskState, WorkerLease,
};

#[derive(Default)]
struct QueueState {
  next_seq: u64,
  tasks: HashMap<Uuid, ScanTask>,
  /// Pending tasks keyed by creation order, then id.
  pending: BTreeSet<(u64, Uuid)>,
  /// Targets with a Pending or Leased task.
  open_targets: HashMap<String, Uuid>,
  results: HashMap<Uuid, ScanResult>,
  leases: HashMap<String, Vec<WorkerLease>>,
}

impl QueueState {
  fn release_lease(&mut self, node_id: &str, task_id: Uuid) {
    if let Some(leases) = self.leases.get_mut(node_id) {
      for lease in leases.iter_mut() {
        lease.task_ids.remove(&task_id);
      }
      leases.retain(|lease| !lease.task_ids.is_empty());
      if leases.is_empty() {
        self.leases.remove(node_id);
      }
    }
  }

  /// Counts one failed attempt and either requeues the task or fails it for good.
  fn settle_failure(&mut self, task_id: Uuid, reason: &str, max_attempts: u32, now: DateTime<Utc>) -> Ack {
    let Some(task) = self.tasks.get_mut(&task_id) else {
      return Ack::Failed { attempt_count: 0 };
    };
    task.attempt_count += 1;
    task.lease_expiry = None;
    task.lease_holder = None;
    task.last_error = Some(reason.to_string());
    task.updated_at = now;

    if task.attempt_count < max_attempts {
      task.state = TaskState::Pending;
      self.pending.insert((task.seq, task.id));
      info!("Task {} ({}) requeued after attempt {}: {}", task.id, task.target_ip, task.attempt_count, reason);
      Ack::Requeued { attempt_count: task.attempt_count }
    } else {
      task.state = TaskState::Failed;
      self.open_targets.remove(&task.target_ip);
      warn!("Task {} ({}) failed permanently after {} attempts: {}", task.id, task.target_ip, task.attempt_count, reason);
      Ack::Failed { attempt_count: task.attempt_count }
    }
  }
}

pub struct TaskQueue {
  max_attempts: u32,
  state: Mutex<QueueState>,
}

impl TaskQueue {
  pub fn new(max_attempts: u32) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      state: Mutex::new(QueueState::default()),
    }
  }

  pub async fn enqueue(&self, target_ip: &str, rate_limit: u32) -> Result<Uuid, QueueError> {
    if rate_limit == 0 {
      return Err(QueueError::InvalidRateLimit);
    }
    let ip: IpAddr = target_ip
      .trim()
      .parse()
      .map_err(|_| QueueError::InvalidRange(format!("'{}' is not an IP address", target_ip)))?;
    let target = ip.to_string();

    let mut state = self.state.lock().await;
    if state.open_targets.contains_key(&target) {
      return Err(QueueError::DuplicateTarget(target));
    }
    let seq = state.next_seq;
    state.next_seq += 1;
    let task = ScanTask::new(seq, target.clone(), rate_limit, Utc::now());
    let task_id = task.id;
    state.pending.insert((seq, task_id));
    state.open_targets.insert(target, task_id);
    state.tasks.insert(task_id, task);
    Ok(task_id)
  }

  pub async fn lease_batch(&self, node_id: &str, max_count: usize, ttl: Duration) -> Vec<ScanTask> {
    self.lease_batch_at(node_id, max_count, ttl, Utc::now()).await
  }

  pub async fn lease_batch_at(
    &self,
    node_id: &str,
    max_count: usize,
    ttl: Duration,
    now: DateTime<Utc>,
  ) -> Vec<ScanTask> {
    if max_count == 0 {
      return Vec::new();
    }
    let expiry = TimeDelta::from_std(ttl)
      .ok()
      .and_then(|delta| now.checked_add_signed(delta))
      .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let mut state = self.state.lock().await;
    let picked: Vec<(u64, Uuid)> = state.pending.iter().take(max_count).copied().collect();
    if picked.is_empty() {
      return Vec::new();
    }

    let mut leased = Vec::with_capacity(picked.len());
    for key in picked {
      state.pending.remove(&key);
      if let Some(task) = state.tasks.get_mut(&key.1) {
        task.state = TaskState::Leased;
        task.lease_expiry = Some(expiry);
        task.lease_holder = Some(node_id.to_string());
        task.updated_at = now;
        leased.push(task.clone());
      }
    }

    let lease = WorkerLease {
      node_id: node_id.to_string(),
      task_ids: leased.iter().map(|task| task.id).collect(),
      issued_at: now,
      ttl,
    };
    state.leases.entry(node_id.to_string()).or_default().push(lease);
    debug!("Leased {} task(s) to {} until {}", leased.len(), node_id, expiry);
    leased
  }

  pub async fn submit_result(&self, task_id: Uuid, node_id: &str, result: ScanResult) -> Result<Ack, QueueError> {
    self.submit_result_at(task_id, node_id, result, Utc::now()).await
  }

  pub async fn submit_result_at(
    &self,
    task_id: Uuid,
    node_id: &str,
    mut result: ScanResult,
    now: DateTime<Utc>,
  ) -> Result<Ack, QueueError> {
    let mut state = self.state.lock().await;
    let task = state.tasks.get_mut(&task_id).ok_or(QueueError::UnknownTask(task_id))?;
    match task.state {
      TaskState::Completed => return Ok(Ack::AlreadyCompleted),
      TaskState::Leased => {}
      _ => return Err(QueueError::NotLeased(task_id)),
    }
    let holder = task.lease_holder.clone().unwrap_or_default();
    if holder != node_id {
      return Err(QueueError::LeaseMismatch {
        task_id,
        node_id: node_id.to_string(),
        holder,
      });
    }
    if task.lease_expired(now) {
      return Err(QueueError::NotLeased(task_id));
    }

    task.state = TaskState::Completed;
    task.lease_expiry = None;
    task.lease_holder = None;
    task.updated_at = now;
    let target = task.target_ip.clone();

    result.task_id = task_id;
    state.results.insert(task_id, result);
    state.open_targets.remove(&target);
    state.release_lease(node_id, task_id);
    info!("Task {} ({}) completed by {}", task_id, target, node_id);
    Ok(Ack::Accepted)
  }

  pub async fn report_failure(&self, task_id: Uuid, node_id: &str, reason: &str) -> Result<Ack, QueueError> {
    let now = Utc::now();
    let mut state = self.state.lock().await;
    let task = state.tasks.get(&task_id).ok_or(QueueError::UnknownTask(task_id))?;
    if task.state != TaskState::Leased {
      return Err(QueueError::NotLeased(task_id));
    }
    let holder = task.lease_holder.clone().unwrap_or_default();
    if holder != node_id {
      return Err(QueueError::LeaseMismatch {
        task_id,
        node_id: node_id.to_string(),
        holder,
      });
    }

    state.release_lease(node_id, task_id);
    Ok(state.settle_failure(task_id, reason, self.max_attempts, now))
  }

  pub async fn reap_expired(&self) -> usize {
    self.reap_expired_at(Utc::now()).await
  }

  pub async fn reap_expired_at(&self, now: DateTime<Utc>) -> usize {
    let mut state = self.state.lock().await;
    let expired: Vec<(Uuid, String)> = state
      .tasks
      .values()
      .filter(|task| task.lease_expired(now))
      .map(|task| (task.id, task.lease_holder.clone().unwrap_or_default()))
      .collect();

    for (task_id, holder) in &expired {
      state.release_lease(holder, *task_id);
      state.settle_failure(*task_id, &format!("lease held by {} expired", holder), self.max_attempts, now);
    }
    expired.len()
  }

  pub async fn get(&self, task_id: Uuid) -> Option<ScanTask> {
    self.state.lock().await.tasks.get(&task_id).cloned()
  }

  pub async fn result(&self, task_id: Uuid) -> Option<ScanResult> {
    self.state.lock().await.results.get(&task_id).cloned()
  }

  pub async fn list(&self, filter: TaskFilter) -> Vec<ScanTask> {
    let state = self.state.lock().await;
    let mut tasks: Vec<&ScanTask> = state
      .tasks
      .values()
      .filter(|task| filter.state.is_none_or(|wanted| task.state == wanted))
      .collect();
    tasks.sort_by_key(|task| (task.seq, task.id));
    tasks
      .into_iter()
      .take(filter.limit.unwrap_or(usize::MAX))
      .cloned()
      .collect()
  }

  pub async fn leases(&self, node_id: &str) -> Vec<WorkerLease> {
    self.state.lock().await.leases.get(node_id).cloned().unwrap_or_default()
  }

  pub async fn stats(&self) -> QueueStats {
    let state = self.state.lock().await;
    let mut stats = QueueStats {
      active_leases: state.leases.values().map(Vec::len).sum(),
      ..QueueStats::default()
    };
    for task in state.tasks.values() {
      match task.state {
        TaskState::Pending => stats.pending += 1,
        TaskState::Leased => stats.leased += 1,
        TaskState::Completed => stats.completed += 1,
        TaskState::Failed => stats.failed += 1,
      }
    }
    stats
  }
}
