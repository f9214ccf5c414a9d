use std::sync::Arc;

use anyhow::Result;
use dtscan::{config::Config, routes::routes, scheduler::Scheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();
  let config = Config::from_env();
  let scheduler = Arc::new(Scheduler::from_config(&config));

  if !config.seed_ranges.is_empty() {
    match scheduler.seed(&config.seed_ranges, config.seed_rate_limit).await {
      Ok(summary) => info!("Startup seed created {} task(s)", summary.created),
      Err(e) => error!("Startup seed rejected: {}", e),
    }
  }

  let cancel = CancellationToken::new();
  let reaper = scheduler.clone().spawn_reaper(cancel.clone());

  let shutdown = cancel.clone();
  let (addr, server) = warp::serve(routes(scheduler))
    .bind_with_graceful_shutdown(([0, 0, 0, 0], config.server_port), async move {
      let _ = tokio::signal::ctrl_c().await;
      shutdown.cancel();
    });
  info!(
    "Scheduler listening on {} (lease ttl {:?}, reap every {:?}, max attempts {})",
    addr, config.lease_ttl, config.reap_interval, config.max_attempts
  );
  server.await;

  cancel.cancel();
  reaper.await?;
  info!("Scheduler shut down");
  Ok(())
}
