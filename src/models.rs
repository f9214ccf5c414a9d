use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::de::{self, Unexpected};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
  Pending,
  Leased,
  Completed,
  Failed,
}

impl TaskState {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskState::Completed | TaskState::Failed)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskState::Pending => "pending",
      TaskState::Leased => "leased",
      TaskState::Completed => "completed",
      TaskState::Failed => "failed",
    }
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskState {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "pending" => Ok(TaskState::Pending),
      "leased" => Ok(TaskState::Leased),
      "completed" => Ok(TaskState::Completed),
      "failed" => Ok(TaskState::Failed),
      other => Err(format!("unknown task state '{}'", other)),
    }
  }
}

/// A single host to scan. Owned by the task queue; everything handed out is a copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTask {
  pub id: Uuid,
  pub target_ip: String,
  pub rate_limit: u32,
  pub state: TaskState,
  pub lease_expiry: Option<DateTime<Utc>>,
  pub lease_holder: Option<String>,
  pub attempt_count: u32,
  pub last_error: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  #[serde(skip)]
  pub(crate) seq: u64,
}

impl ScanTask {
  pub(crate) fn new(seq: u64, target_ip: String, rate_limit: u32, now: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      target_ip,
      rate_limit,
      state: TaskState::Pending,
      lease_expiry: None,
      lease_holder: None,
      attempt_count: 0,
      last_error: None,
      created_at: now,
      updated_at: now,
      seq,
    }
  }

  pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
    self.state == TaskState::Leased && self.lease_expiry.is_some_and(|expiry| expiry < now)
  }

  pub fn assignment(&self) -> TaskAssignment {
    TaskAssignment {
      task_id: self.id,
      target_ip: self.target_ip.clone(),
      rate_limit: self.rate_limit,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
  Up,
  Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  Tcp,
  Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEntry {
  #[serde(deserialize_with = "nonzero_port")]
  pub port: u16,
  pub protocol: Protocol,
}

fn nonzero_port<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
  let port = u16::deserialize(deserializer)?;
  if port == 0 {
    return Err(de::Error::invalid_value(Unexpected::Unsigned(0), &"a port in 1..=65535"));
  }
  Ok(port)
}

static NODE_ID: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$").expect("node id pattern is valid"));

/// Node ids are restricted to `[A-Za-z0-9_.-]`, at most 64 characters.
pub fn is_valid_node_id(node_id: &str) -> bool {
  NODE_ID.is_match(node_id)
}

/// What an executor reports for one host, before it is tied to a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostScan {
  pub host_status: HostStatus,
  pub ports: Vec<PortEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
  pub task_id: Uuid,
  pub host_status: HostStatus,
  pub ports: Vec<PortEntry>,
}

impl ScanResult {
  pub fn new(task_id: Uuid, scan: HostScan) -> Self {
    Self {
      task_id,
      host_status: scan.host_status,
      ports: scan.ports,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerLease {
  pub node_id: String,
  pub task_ids: BTreeSet<Uuid>,
  pub issued_at: DateTime<Utc>,
  pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAssignment {
  pub task_id: Uuid,
  pub target_ip: String,
  pub rate_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBatch {
  pub tasks: Vec<TaskAssignment>,
  pub backoff_hint_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
  Success(ScanResult),
  Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ack {
  Accepted,
  /// The task was already completed; the stored result is untouched.
  AlreadyCompleted,
  Requeued { attempt_count: u32 },
  Failed { attempt_count: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
  pub node_id: String,
  pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
  pub node_id: String,
  pub task_id: Uuid,
  pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
  pub ack: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<ErrorKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedRequest {
  pub ranges: Vec<String>,
  pub rate_limit: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSummary {
  pub created: usize,
  pub duplicates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
  pub pending: usize,
  pub leased: usize,
  pub completed: usize,
  pub failed: usize,
  pub active_leases: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDetail {
  pub task: ScanTask,
  pub result: Option<ScanResult>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
  pub state: Option<TaskState>,
  pub limit: Option<usize>,
}
