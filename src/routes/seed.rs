use std::sync::Arc;

use tracing::error;
use warp::Filter;

use crate::models::SeedRequest;
use crate::routes::{ApiError, with_scheduler};
use crate::scheduler::Scheduler;

pub fn seed_route(scheduler: Arc<Scheduler>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path!("seed")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_scheduler(scheduler))
    .and_then(handle_seed)
}

async fn handle_seed(request: SeedRequest, scheduler: Arc<Scheduler>) -> Result<impl warp::Reply, warp::Rejection> {
  let summary = scheduler
    .seed(&request.ranges, request.rate_limit)
    .await
    .map_err(|e| {
      error!("Seeding {:?} failed: {}", request.ranges, e);
      warp::reject::custom(ApiError::from(e))
    })?;
  Ok(warp::reply::json(&summary))
}
