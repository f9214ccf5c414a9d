use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use uuid::Uuid;
use warp::Filter;

use crate::models::{ScanTask, TaskState};
use crate::routes::{ApiError, with_scheduler};
use crate::scheduler::Scheduler;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct SseQuery {
  pub task_id: Uuid,
}

pub fn sse_route(scheduler: Arc<Scheduler>) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
  warp::path!("sse")
    .and(warp::get())
    .and(warp::query::<SseQuery>())
    .and(with_scheduler(scheduler))
    .and_then(handle_sse)
}

/// Emits one event per state change and ends after the task settles.
async fn handle_sse(query: SseQuery, scheduler: Arc<Scheduler>) -> Result<impl warp::Reply, warp::Rejection> {
  let task_id = query.task_id;
  if scheduler.task(task_id).await.is_none() {
    return Err(warp::reject::custom(ApiError::not_found(format!("unknown task {}", task_id))));
  }

  let mut settled = false;
  let mut last_state: Option<TaskState> = None;
  let interval = IntervalStream::new(tokio::time::interval(POLL_INTERVAL));
  let stream = interval
    .then(move |_| {
      let scheduler = scheduler.clone();
      async move { scheduler.task(task_id).await }
    })
    .map_while(move |task: Option<ScanTask>| {
      if settled {
        return None;
      }
      let task = task?;
      settled = task.state.is_terminal();
      Some(task)
    })
    .filter_map(move |task| {
      if last_state == Some(task.state) {
        return None;
      }
      last_state = Some(task.state);
      let event = warp::sse::Event::default().event(task.state.as_str()).data(
        json!({
          "task_id": task.id,
          "target_ip": task.target_ip,
          "state": task.state,
          "attempt_count": task.attempt_count,
          "lease_holder": task.lease_holder,
        })
        .to_string(),
      );
      Some(Ok::<_, Infallible>(event))
    });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
