//! Cluster-wide coordination: the pending queue, the task and event
//! registries, the worker roster, dispatch, and reconciliation.
//!
//! The manager is a pass-through aggregator, not an independent authority:
//! it never re-derives task state, it trusts the worker's last report.

pub mod api;
pub mod client;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::scheduler::{Node, ScheduleError, Scheduler};
use crate::task::{State, Task, TaskEvent};
use crate::worker::stats::WorkerStats;
use client::{TransportError, WorkerClient};

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("unknown task {0}")]
    UnknownTask(Uuid),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Result of one dispatch step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Pending queue was empty.
    Idle,
    /// No worker has headroom right now; the event went back to the queue.
    Deferred(Uuid),
    Sent { task: Uuid, worker: String },
}

pub struct Manager {
    pending: VecDeque<TaskEvent>,
    task_db: HashMap<Uuid, Task>,
    event_db: HashMap<Uuid, TaskEvent>,
    workers: Vec<String>,
    worker_stats: HashMap<String, WorkerStats>,
    missed_polls: HashMap<String, u32>,
    worker_task_map: HashMap<String, Vec<Uuid>>,
    task_worker_map: HashMap<Uuid, String>,
    scheduler: Box<dyn Scheduler>,
    client: Arc<dyn WorkerClient>,
    /// Consecutive failed polls after which a worker stops receiving new
    /// work. It keeps being polled so it can recover.
    demote_after: u32,
}

impl Manager {
    pub fn new(
        workers: Vec<String>,
        scheduler: Box<dyn Scheduler>,
        client: Arc<dyn WorkerClient>,
        demote_after: u32,
    ) -> Self {
        Manager {
            pending: VecDeque::new(),
            task_db: HashMap::new(),
            event_db: HashMap::new(),
            workers,
            worker_stats: HashMap::new(),
            missed_polls: HashMap::new(),
            worker_task_map: HashMap::new(),
            task_worker_map: HashMap::new(),
            scheduler,
            client,
            demote_after,
        }
    }

    /// Record the event and queue its task for dispatch. No transition
    /// validation here: the worker owns that once the event reaches it,
    /// since the manager may not hold the latest persisted state.
    pub fn add_task(&mut self, event: TaskEvent) {
        self.task_db.insert(event.task.id, event.task.clone());
        self.event_db.insert(event.id, event.clone());
        self.pending.push_back(event);
    }

    pub fn get_tasks(&self) -> Vec<Task> {
        self.task_db.values().cloned().collect()
    }

    pub fn task(&self, id: &Uuid) -> Option<Task> {
        self.task_db.get(id).cloned()
    }

    /// Every event this manager has accepted, in no particular order.
    pub fn get_events(&self) -> Vec<TaskEvent> {
        self.event_db.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Synthesize a completed-targeted event from the last known copy and
    /// feed it through the normal submission path. Stopping is a transition
    /// request, not a distinct code path.
    pub fn stop_task(&mut self, id: &Uuid) -> Result<Task, ManagerError> {
        let mut task = self
            .task_db
            .get(id)
            .cloned()
            .ok_or(ManagerError::UnknownTask(*id))?;
        task.state = State::Completed;
        let event = TaskEvent::new(State::Completed, task.clone());
        self.add_task(event);
        Ok(task)
    }

    fn is_demoted(&self, addr: &str) -> bool {
        self.missed_polls.get(addr).copied().unwrap_or(0) >= self.demote_after
    }

    /// Scheduling view of the non-demoted roster. A worker with no stats
    /// yet degrades to the zero snapshot, which simply fails candidacy for
    /// any task with real resource requests.
    fn nodes(&self) -> Vec<Node> {
        let zero = WorkerStats::default();
        self.workers
            .iter()
            .filter(|addr| !self.is_demoted(addr))
            .map(|addr| Node::from_stats(addr, self.worker_stats.get(addr).unwrap_or(&zero)))
            .collect()
    }

    fn record_assignment(&mut self, worker: &str, event: TaskEvent) {
        let task_id = event.task.id;
        self.task_db.insert(task_id, event.task.clone());
        self.event_db.insert(event.id, event);
        let hosted = self.worker_task_map.entry(worker.to_string()).or_default();
        if !hosted.contains(&task_id) {
            hosted.push(task_id);
        }
        self.task_worker_map.insert(task_id, worker.to_string());
    }

    /// One dispatch step: pop a pending event, run the scheduler pipeline,
    /// forward to the chosen worker. Infeasibility and transport failure
    /// both requeue the event at the back; retry happens on the next cycle
    /// with no backoff.
    pub async fn send_work(&mut self) -> Result<Dispatch, ManagerError> {
        let Some(event) = self.pending.pop_front() else {
            debug!("no pending tasks to send");
            return Ok(Dispatch::Idle);
        };
        let task_id = event.task.id;

        // A task that already has a home keeps it: follow-up events (stop
        // requests, resubmissions) must reach the worker hosting the unit,
        // not whichever node the policy would pack next.
        if let Some(worker) = self.task_worker_map.get(&task_id).cloned() {
            return self.dispatch(worker, event).await;
        }

        let nodes = self.nodes();
        let candidates = self.scheduler.select_candidates(&event.task, &nodes);
        if candidates.is_empty() {
            info!(task_id = %task_id, "no worker has headroom, deferring");
            self.pending.push_back(event);
            return Ok(Dispatch::Deferred(task_id));
        }

        let scores = self.scheduler.score(&event.task, &candidates);
        let worker = self.scheduler.pick(&scores)?;
        self.dispatch(worker, event).await
    }

    async fn dispatch(
        &mut self,
        worker: String,
        event: TaskEvent,
    ) -> Result<Dispatch, ManagerError> {
        let task_id = event.task.id;
        match self.client.submit_task(&worker, &event).await {
            Ok(()) => {
                info!(task_id = %task_id, worker = %worker, "task dispatched");
                self.record_assignment(&worker, event);
                Ok(Dispatch::Sent {
                    task: task_id,
                    worker,
                })
            }
            Err(err) => {
                warn!(task_id = %task_id, worker = %worker, error = %err, "dispatch failed, requeueing");
                self.pending.push_back(event);
                Err(err.into())
            }
        }
    }

    /// Reconciliation: pull every worker's task list and overwrite local
    /// entries whose reported state differs. Also refreshes the worker's
    /// stats snapshot and its missed-poll counter.
    pub async fn update_tasks(&mut self) {
        for worker in self.workers.clone() {
            debug!(worker = %worker, "polling worker");
            match self.client.list_tasks(&worker).await {
                Err(err) => {
                    let entry = self.missed_polls.entry(worker.clone()).or_insert(0);
                    *entry += 1;
                    let missed = *entry;
                    if missed == self.demote_after {
                        warn!(worker = %worker, missed, "worker unreachable, demoting from scheduling");
                    } else {
                        warn!(worker = %worker, missed, error = %err, "worker poll failed");
                    }
                }
                Ok(tasks) => {
                    self.missed_polls.insert(worker.clone(), 0);
                    for task in tasks {
                        self.reconcile_task(&worker, task);
                    }
                    match self.client.fetch_stats(&worker).await {
                        Ok(stats) => {
                            self.worker_stats.insert(worker.clone(), stats);
                        }
                        Err(err) => {
                            warn!(worker = %worker, error = %err, "stats poll failed");
                            self.worker_stats
                                .insert(worker.clone(), WorkerStats::default());
                        }
                    }
                }
            }
        }
    }

    fn reconcile_task(&mut self, worker: &str, reported: Task) {
        let Some(local) = self.task_db.get(&reported.id) else {
            // Not a task this manager dispatched; nothing to update.
            return;
        };

        if local.state != reported.state {
            debug!(task_id = %reported.id, from = %local.state, to = %reported.state, "updating task");
            let merged = Task {
                state: reported.state,
                container_id: reported.container_id.clone(),
                start_time: reported.start_time,
                finish_time: reported.finish_time,
                ..local.clone()
            };
            self.task_db.insert(reported.id, merged);
        }

        // Keep both indices agreeing with the report.
        let current = self.task_worker_map.get(&reported.id).cloned();
        if current.as_deref() != Some(worker) {
            if let Some(old) = current {
                if let Some(hosted) = self.worker_task_map.get_mut(&old) {
                    hosted.retain(|id| *id != reported.id);
                }
            }
            let hosted = self.worker_task_map.entry(worker.to_string()).or_default();
            if !hosted.contains(&reported.id) {
                hosted.push(reported.id);
            }
            self.task_worker_map.insert(reported.id, worker.to_string());
        }
    }
}

/// Dispatch loop: drain the pending queue until idle or deferred, sleep.
pub async fn run_dispatch(manager: Arc<Mutex<Manager>>, interval: Duration) {
    loop {
        loop {
            match manager.lock().await.send_work().await {
                Ok(Dispatch::Sent { task, worker }) => {
                    debug!(task_id = %task, worker = %worker, "dispatched");
                }
                Ok(Dispatch::Idle) | Ok(Dispatch::Deferred(_)) => break,
                Err(err) => {
                    warn!(error = %err, "dispatch step failed");
                    break;
                }
            }
        }
        tokio::time::sleep(interval).await;
    }
}

/// Reconciliation loop.
pub async fn run_reconcile(manager: Arc<Mutex<Manager>>, interval: Duration) {
    loop {
        manager.lock().await.update_tasks().await;
        tokio::time::sleep(interval).await;
    }
}
