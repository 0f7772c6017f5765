use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::stats::Stats;
use crate::task::{State, Task, TaskEvent};

use super::types::Worker;

/// Error envelope returned on request failures and decoded by the manager.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrResponse {
    #[serde(rename = "HTTPStatusCode")]
    pub http_status_code: u16,
    #[serde(rename = "Message")]
    pub message: String,
}

/// HTTP surface of one worker agent.
pub struct Api {
    pub address: String,
    pub port: u16,
    pub worker: Arc<Mutex<Worker>>,
}

pub fn router(worker: Arc<Mutex<Worker>>) -> Router {
    Router::new()
        .route("/tasks", get(get_tasks).post(start_task))
        .route("/tasks/{task_id}", get(get_task).delete(stop_task))
        .route("/stats", get(get_stats))
        .with_state(worker)
}

impl Api {
    pub async fn start(self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.address, self.port);
        let app = router(self.worker);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "worker API listening");
        axum::serve(listener, app).await
    }
}

async fn start_task(
    AxumState(worker): AxumState<Arc<Mutex<Worker>>>,
    payload: Result<Json<TaskEvent>, JsonRejection>,
) -> Response {
    let Json(te) = match payload {
        Ok(body) => body,
        Err(rejection) => {
            let message = format!("error unmarshalling body: {rejection}");
            warn!(%message, "rejecting task submission");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrResponse {
                    http_status_code: 400,
                    message,
                }),
            )
                .into_response();
        }
    };
    let task = te.task.clone();
    worker.lock().await.add_task(te.task);
    info!(task_id = %task.id, "added task to the queue");
    (StatusCode::CREATED, Json(task)).into_response()
}

async fn get_tasks(AxumState(worker): AxumState<Arc<Mutex<Worker>>>) -> Json<Vec<Task>> {
    Json(worker.lock().await.get_tasks())
}

async fn get_task(
    AxumState(worker): AxumState<Arc<Mutex<Worker>>>,
    Path(task_id): Path<Uuid>,
) -> Response {
    match worker.lock().await.db.get(&task_id.to_string()) {
        Ok(Some(task)) => (StatusCode::OK, Json(task)).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Enqueue a copy of the stored task with a Completed target so the run loop
/// tears the container down.
async fn stop_task(
    AxumState(worker): AxumState<Arc<Mutex<Worker>>>,
    Path(task_id): Path<Uuid>,
) -> Response {
    let mut w = worker.lock().await;
    let stored = match w.db.get(&task_id.to_string()) {
        Ok(Some(task)) => task,
        _ => {
            warn!(%task_id, "no task found to stop");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let mut stopping = stored;
    stopping.state = State::Completed;
    info!(%task_id, container_id = %stopping.container_id, "added task to stop container");
    w.add_task(stopping);
    StatusCode::NO_CONTENT.into_response()
}

async fn get_stats(AxumState(worker): AxumState<Arc<Mutex<Worker>>>) -> Json<Option<Stats>> {
    Json(worker.lock().await.stats.clone())
}
