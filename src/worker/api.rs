//! Worker HTTP surface: accept task events, report tasks and stats.

use axum::{
    Json, Router,
    extract::{Path, State as AxumState, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::Worker;
use crate::task::{State, Task, TaskEvent};
use crate::worker::stats::WorkerStats;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

pub struct WorkerApi {
    worker: Arc<Mutex<Worker>>,
    address: String,
    port: u16,
}

impl WorkerApi {
    pub fn new(worker: Arc<Mutex<Worker>>, address: &str, port: u16) -> Self {
        WorkerApi {
            worker,
            address: address.to_string(),
            port,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/tasks", get(get_tasks))
            .route("/tasks", post(start_task))
            .route("/tasks/{id}", delete(stop_task))
            .route("/stats", get(get_stats))
            .with_state(self.worker.clone())
    }

    pub async fn serve(self) -> std::io::Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(format!("{}:{}", self.address, self.port)).await?;
        info!(address = %self.address, port = self.port, "worker api listening");
        axum::serve(listener, app).await
    }
}

async fn get_tasks(AxumState(worker): AxumState<Arc<Mutex<Worker>>>) -> Json<Vec<Task>> {
    Json(worker.lock().await.get_tasks())
}

async fn get_stats(AxumState(worker): AxumState<Arc<Mutex<Worker>>>) -> Json<WorkerStats> {
    Json(worker.lock().await.stats())
}

async fn start_task(
    AxumState(worker): AxumState<Arc<Mutex<Worker>>>,
    payload: Result<Json<TaskEvent>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(event)) => {
            info!(task_id = %event.task.id, "task queued");
            worker.lock().await.add_task(event.task.clone());
            (StatusCode::CREATED, Json(event.task)).into_response()
        }
        Err(rejection) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                status: StatusCode::BAD_REQUEST.as_u16(),
                message: rejection.body_text(),
            }),
        )
            .into_response(),
    }
}

async fn stop_task(
    AxumState(worker): AxumState<Arc<Mutex<Worker>>>,
    Path(id): Path<Uuid>,
) -> Response {
    let mut guard = worker.lock().await;
    let Some(mut task) = guard.task(&id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                status: StatusCode::NOT_FOUND.as_u16(),
                message: format!("task {id} not found"),
            }),
        )
            .into_response();
    };

    task.state = State::Completed;
    guard.add_task(task);
    info!(task_id = %id, "task queued to stop");
    StatusCode::NO_CONTENT.into_response()
}
