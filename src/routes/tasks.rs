use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;
use warp::Filter;

use crate::models::{FetchRequest, SubmitRequest, SubmitResponse, TaskDetail, TaskFilter, TaskState};
use crate::routes::{ApiError, validate_node_id, with_scheduler};
use crate::scheduler::Scheduler;

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
  pub state: Option<String>,
  pub limit: Option<usize>,
}

pub fn fetch_route(scheduler: Arc<Scheduler>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path!("tasks" / "fetch")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_scheduler(scheduler))
    .and_then(handle_fetch)
}

pub fn submit_route(scheduler: Arc<Scheduler>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path!("tasks" / "submit")
    .and(warp::post())
    .and(warp::body::json())
    .and(with_scheduler(scheduler))
    .and_then(handle_submit)
}

pub fn list_route(scheduler: Arc<Scheduler>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path!("tasks")
    .and(warp::get())
    .and(warp::query::<TaskQuery>())
    .and(with_scheduler(scheduler))
    .and_then(handle_list)
}

pub fn detail_route(scheduler: Arc<Scheduler>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path!("tasks" / Uuid)
    .and(warp::get())
    .and(with_scheduler(scheduler))
    .and_then(handle_detail)
}

pub fn stats_route(scheduler: Arc<Scheduler>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path!("stats")
    .and(warp::get())
    .and(with_scheduler(scheduler))
    .and_then(handle_stats)
}

async fn handle_fetch(request: FetchRequest, scheduler: Arc<Scheduler>) -> Result<impl warp::Reply, warp::Rejection> {
  validate_node_id(&request.node_id)?;
  let batch = scheduler.request_tasks(&request.node_id, request.capacity).await;
  Ok(warp::reply::json(&batch))
}

async fn handle_submit(request: SubmitRequest, scheduler: Arc<Scheduler>) -> Result<impl warp::Reply, warp::Rejection> {
  validate_node_id(&request.node_id)?;
  let response = match scheduler.submit(&request.node_id, request.task_id, request.outcome).await {
    Ok(ack) => {
      info!("Task {} outcome from {} acknowledged: {:?}", request.task_id, request.node_id, ack);
      SubmitResponse { ack: true, error: None }
    }
    Err(e) => SubmitResponse { ack: false, error: Some(e.kind()) },
  };
  Ok(warp::reply::json(&response))
}

async fn handle_list(query: TaskQuery, scheduler: Arc<Scheduler>) -> Result<impl warp::Reply, warp::Rejection> {
  let state = query
    .state
    .as_deref()
    .map(str::parse::<TaskState>)
    .transpose()
    .map_err(|e| warp::reject::custom(ApiError::bad_request(e)))?;
  let tasks = scheduler.list_tasks(TaskFilter { state, limit: query.limit }).await;
  Ok(warp::reply::json(&tasks))
}

async fn handle_detail(task_id: Uuid, scheduler: Arc<Scheduler>) -> Result<impl warp::Reply, warp::Rejection> {
  let task = scheduler
    .task(task_id)
    .await
    .ok_or_else(|| warp::reject::custom(ApiError::not_found(format!("unknown task {}", task_id))))?;
  let result = scheduler.result(task_id).await;
  Ok(warp::reply::json(&TaskDetail { task, result }))
}

async fn handle_stats(scheduler: Arc<Scheduler>) -> Result<impl warp::Reply, warp::Rejection> {
  Ok(warp::reply::json(&scheduler.stats().await))
}
