//! Transport to workers: submit events, pull task lists and stats.

use async_trait::async_trait;
use thiserror::Error;

use crate::task::{Task, TaskEvent};
use crate::worker::stats::WorkerStats;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("worker {addr} answered {status}")]
    Status { addr: String, status: u16 },
}

/// Capability surface the manager needs from a worker. Injected so the
/// manager can be tested against in-process fakes.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn submit_task(&self, addr: &str, event: &TaskEvent) -> Result<(), TransportError>;

    async fn list_tasks(&self, addr: &str) -> Result<Vec<Task>, TransportError>;

    async fn fetch_stats(&self, addr: &str) -> Result<WorkerStats, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpWorkerClient {
    http: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn check(addr: &str, resp: &reqwest::Response) -> Result<(), TransportError> {
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                addr: addr.to_string(),
                status: resp.status().as_u16(),
            })
        }
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn submit_task(&self, addr: &str, event: &TaskEvent) -> Result<(), TransportError> {
        let url = format!("http://{addr}/tasks");
        let resp = self.http.post(&url).json(event).send().await?;
        Self::check(addr, &resp)
    }

    async fn list_tasks(&self, addr: &str) -> Result<Vec<Task>, TransportError> {
        let url = format!("http://{addr}/tasks");
        let resp = self.http.get(&url).send().await?;
        Self::check(addr, &resp)?;
        Ok(resp.json().await?)
    }

    async fn fetch_stats(&self, addr: &str) -> Result<WorkerStats, TransportError> {
        let url = format!("http://{addr}/stats");
        let resp = self.http.get(&url).send().await?;
        Self::check(addr, &resp)?;
        Ok(resp.json().await?)
    }
}
