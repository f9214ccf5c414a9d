use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Wire-level error tags returned to workers and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  DuplicateTarget,
  UnknownTask,
  NotLeased,
  LeaseMismatch,
  InvalidRange,
  InvalidRateLimit,
}

impl ErrorKind {
  pub fn as_str(self) -> &'static str {
    match self {
      ErrorKind::DuplicateTarget => "duplicate_target",
      ErrorKind::UnknownTask => "unknown_task",
      ErrorKind::NotLeased => "not_leased",
      ErrorKind::LeaseMismatch => "lease_mismatch",
      ErrorKind::InvalidRange => "invalid_range",
      ErrorKind::InvalidRateLimit => "invalid_rate_limit",
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
  #[error("target {0} already has an open task")]
  DuplicateTarget(String),

  #[error("unknown task {0}")]
  UnknownTask(Uuid),

  #[error("task {0} is not leased")]
  NotLeased(Uuid),

  #[error("task {task_id} is leased by {holder}, not {node_id}")]
  LeaseMismatch {
    task_id: Uuid,
    node_id: String,
    holder: String,
  },

  #[error("invalid range: {0}")]
  InvalidRange(String),

  #[error("rate limit must be a positive integer")]
  InvalidRateLimit,
}

impl QueueError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      QueueError::DuplicateTarget(_) => ErrorKind::DuplicateTarget,
      QueueError::UnknownTask(_) => ErrorKind::UnknownTask,
      QueueError::NotLeased(_) => ErrorKind::NotLeased,
      QueueError::LeaseMismatch { .. } => ErrorKind::LeaseMismatch,
      QueueError::InvalidRange(_) => ErrorKind::InvalidRange,
      QueueError::InvalidRateLimit => ErrorKind::InvalidRateLimit,
    }
  }
}

#[derive(Debug, Error)]
pub enum ScanError {
  #[error("scan failed: {0}")]
  Failed(String),

  #[error("scan timed out after {0:?}")]
  Timeout(std::time::Duration),

  #[error("malformed scan output: {0}")]
  Malformed(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("scheduler returned HTTP {status}: {body}")]
  Status { status: u16, body: String },

  #[error("scheduler rejected request: {0:?}")]
  Rejected(ErrorKind),

  #[error(transparent)]
  Queue(#[from] QueueError),
}

impl ClientError {
  /// Worth retrying: the request may not have reached a healthy scheduler.
  pub fn is_transient(&self) -> bool {
    match self {
      ClientError::Transport(_) => true,
      ClientError::Status { status, .. } => (500..600).contains(status),
      ClientError::Rejected(_) | ClientError::Queue(_) => false,
    }
  }
}
