use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::node::Node;
use crate::task::{State, Task, TaskEvent};
use crate::worker::api::ErrResponse;

use super::types::Manager;

/// HTTP surface of the control plane.
pub struct Api {
    pub address: String,
    pub port: u16,
    pub manager: Arc<Mutex<Manager>>,
}

pub fn router(manager: Arc<Mutex<Manager>>) -> Router {
    Router::new()
        .route("/tasks", get(get_tasks).post(start_task))
        .route("/tasks/{task_id}", get(get_task).delete(stop_task))
        .route("/nodes", get(get_nodes))
        .with_state(manager)
}

impl Api {
    pub async fn start(self) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.address, self.port);
        let app = router(self.manager);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "manager API listening");
        axum::serve(listener, app).await
    }
}

async fn start_task(
    AxumState(manager): AxumState<Arc<Mutex<Manager>>>,
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
    manager.lock().await.add_task(te);
    (StatusCode::CREATED, Json(task)).into_response()
}

async fn get_tasks(AxumState(manager): AxumState<Arc<Mutex<Manager>>>) -> Json<Vec<Task>> {
    Json(manager.lock().await.get_tasks())
}

async fn get_task(
    AxumState(manager): AxumState<Arc<Mutex<Manager>>>,
    Path(task_id): Path<Uuid>,
) -> Response {
    match manager.lock().await.task_db.get(&task_id.to_string()) {
        Ok(Some(task)) => (StatusCode::OK, Json(task)).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Enqueue a Completed-targeted event for the task; the send-work loop relays
/// the stop to the assigned worker.
async fn stop_task(
    AxumState(manager): AxumState<Arc<Mutex<Manager>>>,
    Path(task_id): Path<Uuid>,
) -> Response {
    let mut m = manager.lock().await;
    let stored = match m.task_db.get(&task_id.to_string()) {
        Ok(Some(task)) => task,
        _ => {
            warn!(%task_id, "no task found to stop");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let te = TaskEvent {
        id: Uuid::new_v4(),
        state: State::Completed,
        timestamp: Some(Utc::now()),
        task: stored,
    };
    info!(%task_id, event_id = %te.id, "added stop event for task");
    m.add_task(te);
    StatusCode::NO_CONTENT.into_response()
}

async fn get_nodes(AxumState(manager): AxumState<Arc<Mutex<Manager>>>) -> Json<Vec<Node>> {
    Json(manager.lock().await.worker_nodes.clone())
}
