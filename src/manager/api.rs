//! Manager HTTP surface: the cluster-level submission and status boundary.

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

use super::{Manager, ManagerError};
use crate::task::{Task, TaskEvent};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

pub struct ManagerApi {
    manager: Arc<Mutex<Manager>>,
    address: String,
    port: u16,
}

impl ManagerApi {
    pub fn new(manager: Arc<Mutex<Manager>>, address: &str, port: u16) -> Self {
        ManagerApi {
            manager,
            address: address.to_string(),
            port,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/tasks", get(get_tasks))
            .route("/tasks", post(start_task))
            .route("/tasks/{id}", delete(stop_task))
            .route("/events", get(get_events))
            .with_state(self.manager.clone())
    }

    pub async fn serve(self) -> std::io::Result<()> {
        let app = self.router();
        let listener = TcpListener::bind(format!("{}:{}", self.address, self.port)).await?;
        info!(address = %self.address, port = self.port, "manager api listening");
        axum::serve(listener, app).await
    }
}

async fn get_tasks(AxumState(manager): AxumState<Arc<Mutex<Manager>>>) -> Json<Vec<Task>> {
    Json(manager.lock().await.get_tasks())
}

async fn get_events(AxumState(manager): AxumState<Arc<Mutex<Manager>>>) -> Json<Vec<TaskEvent>> {
    Json(manager.lock().await.get_events())
}

async fn start_task(
    AxumState(manager): AxumState<Arc<Mutex<Manager>>>,
    payload: Result<Json<TaskEvent>, JsonRejection>,
) -> Response {
    match payload {
        Ok(Json(event)) => {
            let task = event.task.clone();
            info!(task_id = %task.id, "task accepted");
            manager.lock().await.add_task(event);
            (StatusCode::CREATED, Json(task)).into_response()
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
    AxumState(manager): AxumState<Arc<Mutex<Manager>>>,
    Path(id): Path<Uuid>,
) -> Response {
    match manager.lock().await.stop_task(&id) {
        Ok(_) => {
            info!(task_id = %id, "stop requested");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(ManagerError::UnknownTask(_)) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                status: StatusCode::NOT_FOUND.as_u16(),
                message: format!("task {id} not found"),
            }),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                message: err.to_string(),
            }),
        )
            .into_response(),
    }
}
