use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use tracing::error;
use warp::Filter;
use warp::http::StatusCode;

use crate::error::QueueError;
use crate::models::is_valid_node_id;
use crate::scheduler::Scheduler;

pub mod seed;
pub mod sse;
pub mod tasks;

pub fn routes(
  scheduler: Arc<Scheduler>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
  tasks::fetch_route(scheduler.clone())
    .or(tasks::submit_route(scheduler.clone()))
    .or(tasks::list_route(scheduler.clone()))
    .or(tasks::detail_route(scheduler.clone()))
    .or(tasks::stats_route(scheduler.clone()))
    .or(seed::seed_route(scheduler.clone()))
    .or(sse::sse_route(scheduler))
    .recover(handle_rejection)
}

pub(crate) fn with_scheduler(
  scheduler: Arc<Scheduler>,
) -> impl Filter<Extract = (Arc<Scheduler>,), Error = Infallible> + Clone {
  warp::any().map(move || scheduler.clone())
}

pub(crate) fn validate_node_id(node_id: &str) -> Result<(), warp::Rejection> {
  if is_valid_node_id(node_id) {
    Ok(())
  } else {
    Err(warp::reject::custom(ApiError::bad_request(format!("invalid node_id '{}'", node_id))))
  }
}

#[derive(Debug)]
pub(crate) struct ApiError {
  status: StatusCode,
  code: &'static str,
  message: String,
}

impl ApiError {
  pub(crate) fn bad_request(message: String) -> Self {
    Self { status: StatusCode::BAD_REQUEST, code: "bad_request", message }
  }

  pub(crate) fn not_found(message: String) -> Self {
    Self { status: StatusCode::NOT_FOUND, code: "not_found", message }
  }
}

impl From<QueueError> for ApiError {
  fn from(e: QueueError) -> Self {
    let status = match e {
      QueueError::UnknownTask(_) => StatusCode::NOT_FOUND,
      QueueError::DuplicateTarget(_) | QueueError::NotLeased(_) | QueueError::LeaseMismatch { .. } => StatusCode::CONFLICT,
      QueueError::InvalidRange(_) | QueueError::InvalidRateLimit => StatusCode::BAD_REQUEST,
    };
    Self { status, code: e.kind().as_str(), message: e.to_string() }
  }
}

impl warp::reject::Reject for ApiError {}

#[derive(Serialize)]
struct ErrorBody<'a> {
  error: &'a str,
  message: String,
}

async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
  let (status, code, message) = if let Some(e) = err.find::<ApiError>() {
    (e.status, e.code, e.message.clone())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not_found", "no such route".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, "bad_request", e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, "bad_request", e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method_not_allowed", "method not allowed".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal error".to_string())
  };

  let body = warp::reply::json(&ErrorBody { error: code, message });
  Ok(warp::reply::with_status(body, status))
}
