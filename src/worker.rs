use std::sync::Arc;

use anyhow::Result;
use dtscan::client::HttpSchedulerClient;
use dtscan::config::WorkerConfig;
use dtscan::executor::{CommandScanExecutor, MockScanExecutor, ScanExecutor};
use dtscan::worker_node::{Worker, WorkerSettings};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = WorkerConfig::from_env()?;

  let executor: Arc<dyn ScanExecutor> = match config.scan_command.as_deref().and_then(CommandScanExecutor::from_command_line) {
    Some(command) => Arc::new(command),
    None => {
      info!("SCAN_COMMAND not set, using the mock scanner");
      Arc::new(MockScanExecutor::new(config.mock_failure_rate))
    }
  };
  let client = Arc::new(HttpSchedulerClient::new(config.scheduler_url.clone()));
  let worker = Worker::new(config.worker_id.clone(), client, executor, WorkerSettings::from(&config));

  let cancel = CancellationToken::new();
  let on_signal = cancel.clone();
  tokio::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown requested");
    on_signal.cancel();
  });

  info!("Worker {} polling {}", worker.node_id(), config.scheduler_url);
  let report = worker.run(cancel).await;
  info!("Worker {} finished: {:?}", worker.node_id(), report);
  Ok(())
}
