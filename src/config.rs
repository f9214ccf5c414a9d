use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, ensure};

use crate::models::is_valid_node_id;

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
  lookup(key)
    .and_then(|value| value.trim().parse().ok())
    .unwrap_or(default)
}

fn from_process_env(key: &str) -> Option<String> {
  env::var(key).ok()
}

#[derive(Debug, Clone)]
pub struct Config {
  pub server_port: u16,
  pub lease_ttl: Duration,
  pub reap_interval: Duration,
  pub max_attempts: u32,
  pub max_batch_size: usize,
  pub backoff_hint: Duration,
  pub max_seed_hosts: usize,
  pub seed_ranges: Vec<String>,
  pub seed_rate_limit: u32,
}

impl Default for Config {
  fn default() -> Self {
    Self::from_lookup(|_| None)
  }
}

impl Config {
  pub fn from_env() -> Self {
    Self::from_lookup(from_process_env)
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let lease_ttl = Duration::from_secs(parsed(&lookup, "LEASE_TTL_SECS", 60u64).max(1));
    let reap_interval = lookup("REAP_INTERVAL_SECS")
      .and_then(|value| value.trim().parse::<u64>().ok())
      .filter(|secs| *secs > 0)
      .map(Duration::from_secs)
      .unwrap_or(lease_ttl / 2);
    Self {
      server_port: parsed(&lookup, "SERVER_PORT", 8080),
      lease_ttl,
      reap_interval,
      max_attempts: parsed(&lookup, "MAX_ATTEMPTS", 3u32).max(1),
      max_batch_size: parsed(&lookup, "MAX_BATCH_SIZE", 64usize).max(1),
      backoff_hint: Duration::from_secs(parsed(&lookup, "BACKOFF_HINT_SECS", 5)),
      max_seed_hosts: parsed(&lookup, "MAX_SEED_HOSTS", 65_536),
      seed_ranges: lookup("SEED_RANGES")
        .map(|value| vec![value])
        .unwrap_or_default(),
      seed_rate_limit: parsed(&lookup, "SEED_RATE_LIMIT", 1000),
    }
  }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub scheduler_url: String,
  pub worker_id: String,
  pub capacity: usize,
  pub concurrency: usize,
  pub rate_budget: u32,
  pub scan_timeout: Duration,
  pub backoff_initial: Duration,
  pub backoff_max: Duration,
  pub scan_command: Option<String>,
  pub mock_failure_rate: f64,
}

impl WorkerConfig {
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(from_process_env)
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let scheduler_url = lookup("SCHEDULER_URL").context("SCHEDULER_URL must be set")?;
    let worker_id = lookup("WORKER_ID").context("WORKER_ID must be set")?;
    ensure!(is_valid_node_id(&worker_id), "WORKER_ID '{}' must match [A-Za-z0-9_.-]{{1,64}}", worker_id);
    let backoff_initial = Duration::from_millis(parsed(&lookup, "BACKOFF_INITIAL_MS", 500u64).max(1));
    Ok(Self {
      scheduler_url: scheduler_url.trim_end_matches('/').to_string(),
      worker_id,
      capacity: parsed(&lookup, "WORKER_CAPACITY", 8usize).max(1),
      concurrency: parsed(&lookup, "WORKER_CONCURRENCY", 4usize).max(1),
      rate_budget: parsed(&lookup, "RATE_BUDGET", 10_000u32).max(1),
      scan_timeout: Duration::from_secs(parsed(&lookup, "SCAN_TIMEOUT_SECS", 30)),
      backoff_initial,
      backoff_max: Duration::from_millis(parsed(&lookup, "BACKOFF_MAX_MS", 30_000)).max(backoff_initial),
      scan_command: lookup("SCAN_COMMAND").filter(|cmd| !cmd.trim().is_empty()),
      mock_failure_rate: parsed(&lookup, "MOCK_FAILURE_RATE", 0.0f64).clamp(0.0, 1.0),
    })
  }
}
