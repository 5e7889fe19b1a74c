//! The task is the lowest unit of work: a container image plus resource
//! requests, moving through the lifecycle in [`state`].

pub mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use state::{State, valid_transition};

/// A unit of work. Owned by whichever registry holds the authoritative
/// copy: the worker while executing, the manager once reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub state: State,
    pub image: String,
    /// Requested cpu cores.
    pub cpu: f64,
    /// Requested memory in MB.
    pub memory: u64,
    /// Requested disk in MB.
    pub disk: u64,
    pub env: Vec<String>,
    /// Container ports in docker notation, e.g. "80/tcp".
    pub exposed_ports: Vec<String>,
    pub restart_policy: String,
    /// Execution unit backing this task; empty until started.
    pub container_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: &str, image: &str) -> Self {
        Task {
            id: Uuid::new_v4(),
            name: name.to_string(),
            state: State::Pending,
            image: image.to_string(),
            cpu: 0.0,
            memory: 0,
            disk: 0,
            env: Vec::new(),
            exposed_ports: Vec::new(),
            restart_policy: String::new(),
            container_id: None,
            start_time: None,
            finish_time: None,
        }
    }
}

/// A request to move a task toward a target state. An event is a command,
/// not the task itself, so it carries its own id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: Uuid,
    pub state: State,
    pub timestamp: DateTime<Utc>,
    pub task: Task,
}

impl TaskEvent {
    pub fn new(state: State, task: Task) -> Self {
        TaskEvent {
            id: Uuid::new_v4(),
            state,
            timestamp: Utc::now(),
            task,
        }
    }
}
