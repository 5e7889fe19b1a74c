//! The runtime collaborator: creates, stops, and inspects the isolated
//! execution units backing tasks. Every call is fallible and non-atomic.

pub mod docker;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::task::Task;

pub use docker::DockerRuntime;

/// Runtime-level description of one execution unit, derived from a task's
/// resource fields.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSpec {
    pub name: String,
    pub image: String,
    pub cpu: f64,
    /// Memory limit in MB.
    pub memory: u64,
    pub disk: u64,
    pub env: Vec<String>,
    pub exposed_ports: Vec<String>,
    pub restart_policy: String,
}

impl RuntimeSpec {
    pub fn from_task(task: &Task) -> Self {
        RuntimeSpec {
            name: task.name.clone(),
            image: task.image.clone(),
            cpu: task.cpu,
            memory: task.memory,
            disk: task.disk,
            env: task.env.clone(),
            exposed_ports: task.exposed_ports.clone(),
            restart_policy: task.restart_policy.clone(),
        }
    }
}

/// Last observed condition of an execution unit.
#[derive(Debug, Clone, Default)]
pub struct UnitStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("cannot reach container daemon: {0}")]
    Connect(#[source] bollard::errors::Error),
    #[error("image pull failed for {image}: {source}")]
    Pull {
        image: String,
        source: bollard::errors::Error,
    },
    #[error("create failed for {name}: {source}")]
    Create {
        name: String,
        source: bollard::errors::Error,
    },
    #[error("start failed for {name}: {source}")]
    Start {
        name: String,
        source: bollard::errors::Error,
    },
    #[error("stop failed for unit {id}: {source}")]
    Stop {
        id: String,
        source: bollard::errors::Error,
    },
    #[error("remove failed for unit {id}: {source}")]
    Remove {
        id: String,
        source: bollard::errors::Error,
    },
    #[error("inspect failed for unit {id}: {source}")]
    Inspect {
        id: String,
        source: bollard::errors::Error,
    },
    #[error("runtime action exceeded deadline of {0:?}")]
    Deadline(Duration),
    #[error("{0}")]
    Other(String),
}

/// Capability surface of the container runtime. Injected so the worker can
/// be tested against a deterministic fake.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create and start a unit for the spec, returning its id. May partially
    /// succeed: a created-but-unstarted container surfaces as an error.
    async fn run(&self, spec: &RuntimeSpec) -> Result<String, RuntimeError>;

    async fn stop(&self, unit_id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, unit_id: &str) -> Result<(), RuntimeError>;

    async fn inspect(&self, unit_id: &str) -> Result<UnitStatus, RuntimeError>;
}
