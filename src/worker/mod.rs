//! The execution engine: one queue of desired task states, one registry of
//! what this worker knows, and the loop that turns desired states into
//! runtime actions.

pub mod api;
pub mod stats;

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sysinfo::System;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::runtime::{Runtime, RuntimeError, RuntimeSpec};
use crate::task::{State, Task, valid_transition};
use stats::WorkerStats;

/// What to do when stopping a task's unit fails. `BestEffort` still marks
/// the task completed (forward progress over strict cleanup); `Strict`
/// surfaces the error and leaves the registry untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopPolicy {
    #[default]
    BestEffort,
    Strict,
}

impl FromStr for StopPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best-effort" => Ok(StopPolicy::BestEffort),
            "strict" => Ok(StopPolicy::Strict),
            other => Err(format!("unknown stop policy '{other}'")),
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: State, to: State },
    #[error("no action implemented for desired state {0}")]
    UnsupportedState(State),
    #[error("task {0} has no execution unit to stop")]
    MissingUnit(Uuid),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Result of one pass over the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Queue was empty; nothing to do.
    Idle,
    Started(Uuid),
    Completed(Uuid),
}

pub struct Worker {
    name: String,
    queue: VecDeque<Task>,
    db: HashMap<Uuid, Task>,
    stats: WorkerStats,
    runtime: Arc<dyn Runtime>,
    stop_policy: StopPolicy,
    action_timeout: Duration,
}

async fn with_deadline<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, RuntimeError>>,
) -> Result<T, RuntimeError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(RuntimeError::Deadline(limit)),
    }
}

impl Worker {
    pub fn new(
        name: &str,
        runtime: Arc<dyn Runtime>,
        stop_policy: StopPolicy,
        action_timeout: Duration,
    ) -> Self {
        Worker {
            name: name.to_string(),
            queue: VecDeque::new(),
            db: HashMap::new(),
            stats: WorkerStats::default(),
            runtime,
            stop_policy,
            action_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a desired task state. Validation is deferred to dequeue time
    /// since the registry may move on between enqueue and processing.
    pub fn add_task(&mut self, task: Task) {
        self.queue.push_back(task);
    }

    /// Snapshot of every registry entry. Stale the moment it is returned.
    pub fn get_tasks(&self) -> Vec<Task> {
        self.db.values().cloned().collect()
    }

    pub fn task(&self, id: &Uuid) -> Option<Task> {
        self.db.get(id).cloned()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.clone()
    }

    pub fn set_stats(&mut self, stats: WorkerStats) {
        self.stats = stats;
    }

    pub fn active_task_count(&self) -> u64 {
        self.db.values().filter(|t| !t.state.is_terminal()).count() as u64
    }

    /// Dequeue one task and validate its desired state against the
    /// persisted copy, returning the runtime action it calls for. A task
    /// never seen before is inserted as its own persisted baseline, so a
    /// fresh `Scheduled` submission passes the gate through the self-loop.
    fn next_action(&mut self) -> Result<Option<Action>, WorkerError> {
        let Some(queued) = self.queue.pop_front() else {
            debug!(worker = %self.name, "no tasks in queue");
            return Ok(None);
        };

        let persisted = match self.db.get(&queued.id) {
            Some(task) => task.state,
            None => {
                self.db.insert(queued.id, queued.clone());
                queued.state
            }
        };

        if !valid_transition(persisted, queued.state) {
            return Err(WorkerError::InvalidTransition {
                from: persisted,
                to: queued.state,
            });
        }

        match queued.state {
            State::Scheduled => Ok(Some(Action::Start(queued))),
            State::Completed => Ok(Some(Action::Stop(queued))),
            other => Err(WorkerError::UnsupportedState(other)),
        }
    }

    fn commit(&mut self, task: Task) {
        self.db.insert(task.id, task);
    }

    /// Dequeue one task and act on its desired state.
    pub async fn run_next_task(&mut self) -> Result<WorkOutcome, WorkerError> {
        let Some(action) = self.next_action()? else {
            return Ok(WorkOutcome::Idle);
        };
        let (write_back, result) = execute(
            self.runtime.clone(),
            self.action_timeout,
            self.stop_policy,
            action,
        )
        .await;
        if let Some(task) = write_back {
            self.commit(task);
        }
        result
    }

    /// Inspect the unit behind every running task; a unit that is gone or
    /// stopped moves the task to failed. Inspect errors are left for the
    /// next cycle.
    pub async fn check_units(&mut self) {
        let running: Vec<Task> = self
            .db
            .values()
            .filter(|t| t.state == State::Running)
            .cloned()
            .collect();

        for mut task in running {
            let Some(unit_id) = task.container_id.clone() else {
                continue;
            };
            match with_deadline(self.action_timeout, self.runtime.inspect(&unit_id)).await {
                Ok(status) if status.running => {}
                Ok(status) => {
                    warn!(
                        task_id = %task.id,
                        unit = %unit_id,
                        exit_code = ?status.exit_code,
                        "unit no longer running, marking task failed"
                    );
                    task.state = State::Failed;
                    task.finish_time = Some(Utc::now());
                    self.db.insert(task.id, task);
                }
                Err(err) => {
                    warn!(task_id = %task.id, unit = %unit_id, error = %err, "unit inspect failed");
                }
            }
        }
    }

    #[cfg(test)]
    fn seed_task(&mut self, task: Task) {
        self.db.insert(task.id, task);
    }
}

/// A dequeued task translated into the runtime action it calls for.
enum Action {
    Start(Task),
    Stop(Task),
}

/// Run one action against the runtime. Returns the task to write back to
/// the registry (if any) alongside the outcome. Takes its collaborators by
/// value so callers can release the worker lock while the action runs.
async fn execute(
    runtime: Arc<dyn Runtime>,
    action_timeout: Duration,
    stop_policy: StopPolicy,
    action: Action,
) -> (Option<Task>, Result<WorkOutcome, WorkerError>) {
    match action {
        Action::Start(mut task) => {
            task.start_time = Some(Utc::now());
            let spec = RuntimeSpec::from_task(&task);

            match with_deadline(action_timeout, runtime.run(&spec)).await {
                Ok(unit_id) => {
                    info!(task_id = %task.id, unit = %unit_id, "task started");
                    task.container_id = Some(unit_id);
                    task.state = State::Running;
                    let id = task.id;
                    (Some(task), Ok(WorkOutcome::Started(id)))
                }
                Err(err) => {
                    // A failed attempt is itself an observable state.
                    error!(task_id = %task.id, error = %err, "task start failed");
                    task.state = State::Failed;
                    (Some(task), Err(err.into()))
                }
            }
        }
        Action::Stop(mut task) => {
            let Some(unit_id) = task.container_id.clone() else {
                return (None, Err(WorkerError::MissingUnit(task.id)));
            };

            let mut cleanup = with_deadline(action_timeout, runtime.stop(&unit_id)).await;
            if cleanup.is_ok() {
                cleanup = with_deadline(action_timeout, runtime.remove(&unit_id)).await;
            }

            if let Err(err) = cleanup {
                match stop_policy {
                    StopPolicy::Strict => {
                        error!(task_id = %task.id, unit = %unit_id, error = %err, "stop failed");
                        return (None, Err(err.into()));
                    }
                    StopPolicy::BestEffort => {
                        warn!(
                            task_id = %task.id,
                            unit = %unit_id,
                            error = %err,
                            "stop failed, marking completed anyway"
                        );
                    }
                }
            }

            task.state = State::Completed;
            task.finish_time = Some(Utc::now());
            info!(task_id = %task.id, unit = %unit_id, "task stopped and removed");
            let id = task.id;
            (Some(task), Ok(WorkOutcome::Completed(id)))
        }
    }
}

/// Drain loop: process while the queue has work, then sleep. Errors are
/// logged and never abort the loop. The lock is held only to dequeue and
/// to write back; the runtime action itself runs unlocked, so the api
/// handlers and the stats loop stay responsive during a slow start or
/// stop.
pub async fn run_tasks(worker: Arc<Mutex<Worker>>, interval: Duration) {
    loop {
        loop {
            let step = {
                let mut guard = worker.lock().await;
                match guard.next_action() {
                    Ok(None) => None,
                    Ok(Some(action)) => Some(Ok((
                        guard.runtime.clone(),
                        guard.action_timeout,
                        guard.stop_policy,
                        action,
                    ))),
                    Err(err) => Some(Err(err)),
                }
            };
            match step {
                None => break,
                Some(Err(err)) => warn!(error = %err, "error running task"),
                Some(Ok((runtime, timeout, policy, action))) => {
                    let (write_back, result) = execute(runtime, timeout, policy, action).await;
                    if let Some(task) = write_back {
                        worker.lock().await.commit(task);
                    }
                    match result {
                        Ok(outcome) => debug!(?outcome, "processed task"),
                        Err(err) => warn!(error = %err, "error running task"),
                    }
                }
            }
        }
        debug!("no tasks to process, sleeping");
        tokio::time::sleep(interval).await;
    }
}

/// Stats loop: refresh the host snapshot on a fixed interval.
pub async fn collect_stats(worker: Arc<Mutex<Worker>>, interval: Duration) {
    let mut sys = System::new_all();
    loop {
        sys.refresh_all();
        {
            let mut guard = worker.lock().await;
            let task_count = guard.active_task_count();
            guard.set_stats(stats::get_stats(&sys, task_count));
        }
        tokio::time::sleep(interval).await;
    }
}

/// Unit watcher loop: reconcile registry state with what the runtime
/// actually reports for each unit.
pub async fn watch_units(worker: Arc<Mutex<Worker>>, interval: Duration) {
    loop {
        worker.lock().await.check_units().await;
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::UnitStatus;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap as StdHashMap;

    #[derive(Default)]
    struct FakeRuntime {
        fail_run: bool,
        fail_stop: bool,
        hang_run: bool,
        units: std::sync::Mutex<StdHashMap<String, bool>>,
    }

    impl FakeRuntime {
        fn failing_run() -> Self {
            FakeRuntime {
                fail_run: true,
                ..Default::default()
            }
        }

        fn failing_stop() -> Self {
            FakeRuntime {
                fail_stop: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Runtime for FakeRuntime {
        async fn run(&self, spec: &RuntimeSpec) -> Result<String, RuntimeError> {
            if self.hang_run {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail_run {
                return Err(RuntimeError::Other("image refused".to_string()));
            }
            let id = format!("unit-{}", spec.name);
            self.units.lock().unwrap().insert(id.clone(), true);
            Ok(id)
        }

        async fn stop(&self, unit_id: &str) -> Result<(), RuntimeError> {
            if self.fail_stop {
                return Err(RuntimeError::Other("daemon hiccup".to_string()));
            }
            self.units
                .lock()
                .unwrap()
                .insert(unit_id.to_string(), false);
            Ok(())
        }

        async fn remove(&self, unit_id: &str) -> Result<(), RuntimeError> {
            self.units.lock().unwrap().remove(unit_id);
            Ok(())
        }

        async fn inspect(&self, unit_id: &str) -> Result<UnitStatus, RuntimeError> {
            let running = self
                .units
                .lock()
                .unwrap()
                .get(unit_id)
                .copied()
                .unwrap_or(false);
            Ok(UnitStatus {
                running,
                exit_code: if running { None } else { Some(137) },
            })
        }
    }

    fn worker_with(runtime: FakeRuntime, policy: StopPolicy) -> Worker {
        Worker::new(
            "w1",
            Arc::new(runtime),
            policy,
            Duration::from_secs(5),
        )
    }

    fn scheduled_task(name: &str) -> Task {
        let mut task = Task::new(name, "busybox:latest");
        task.state = State::Scheduled;
        task
    }

    #[tokio::test]
    async fn empty_queue_is_idle() {
        let mut worker = worker_with(FakeRuntime::default(), StopPolicy::BestEffort);
        let outcome = worker.run_next_task().await.unwrap();
        assert_eq!(outcome, WorkOutcome::Idle);
    }

    #[tokio::test]
    async fn first_sighting_scheduled_task_starts() {
        let mut worker = worker_with(FakeRuntime::default(), StopPolicy::BestEffort);
        let task = scheduled_task("t1");
        let id = task.id;

        worker.add_task(task);
        let outcome = worker.run_next_task().await.unwrap();

        assert_eq!(outcome, WorkOutcome::Started(id));
        let persisted = worker.task(&id).unwrap();
        assert_eq!(persisted.state, State::Running);
        assert_eq!(persisted.container_id.as_deref(), Some("unit-t1"));
        assert!(persisted.start_time.is_some());
    }

    #[tokio::test]
    async fn duplicate_scheduled_event_accepted_via_self_loop() {
        let mut worker = worker_with(FakeRuntime::default(), StopPolicy::BestEffort);
        let task = scheduled_task("t1");
        let id = task.id;

        // Registry already holds the scheduled copy, e.g. a resubmission
        // arriving before the first dispatch was processed.
        worker.seed_task(task.clone());
        worker.add_task(task);

        let outcome = worker.run_next_task().await.unwrap();
        assert_eq!(outcome, WorkOutcome::Started(id));
        assert_eq!(worker.get_tasks().len(), 1);
    }

    #[tokio::test]
    async fn completed_against_pending_is_rejected() {
        let mut worker = worker_with(FakeRuntime::default(), StopPolicy::BestEffort);
        let mut task = Task::new("t1", "busybox:latest");
        task.state = State::Pending;
        let id = task.id;
        worker.seed_task(task.clone());

        task.state = State::Completed;
        worker.add_task(task);

        let err = worker.run_next_task().await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::InvalidTransition {
                from: State::Pending,
                to: State::Completed
            }
        ));
        // Registry untouched.
        assert_eq!(worker.task(&id).unwrap().state, State::Pending);
    }

    #[tokio::test]
    async fn legal_but_unimplemented_state_is_an_internal_error() {
        let mut worker = worker_with(FakeRuntime::default(), StopPolicy::BestEffort);
        let task = scheduled_task("t1");
        worker.seed_task(task.clone());

        let mut desired = task;
        desired.state = State::Running;
        worker.add_task(desired);

        let err = worker.run_next_task().await.unwrap_err();
        assert!(matches!(err, WorkerError::UnsupportedState(State::Running)));
    }

    #[tokio::test]
    async fn start_failure_marks_task_failed() {
        let mut worker = worker_with(FakeRuntime::failing_run(), StopPolicy::BestEffort);
        let task = scheduled_task("t1");
        let id = task.id;
        worker.add_task(task);

        let err = worker.run_next_task().await.unwrap_err();
        assert!(matches!(err, WorkerError::Runtime(_)));
        assert_eq!(worker.task(&id).unwrap().state, State::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn start_deadline_expiry_marks_task_failed() {
        let runtime = FakeRuntime {
            hang_run: true,
            ..Default::default()
        };
        let mut worker = Worker::new(
            "w1",
            Arc::new(runtime),
            StopPolicy::BestEffort,
            Duration::from_millis(50),
        );
        let task = scheduled_task("t1");
        let id = task.id;
        worker.add_task(task);

        let err = worker.run_next_task().await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Runtime(RuntimeError::Deadline(_))
        ));
        assert_eq!(worker.task(&id).unwrap().state, State::Failed);
    }

    fn running_task(name: &str, unit: &str) -> Task {
        let mut task = Task::new(name, "busybox:latest");
        task.state = State::Running;
        task.container_id = Some(unit.to_string());
        task
    }

    #[tokio::test]
    async fn stop_completes_task_and_stamps_finish_time() {
        let runtime = FakeRuntime::default();
        runtime
            .units
            .lock()
            .unwrap()
            .insert("unit-t1".to_string(), true);
        let mut worker = worker_with(runtime, StopPolicy::BestEffort);

        let task = running_task("t1", "unit-t1");
        let id = task.id;
        worker.seed_task(task.clone());

        let mut desired = task;
        desired.state = State::Completed;
        worker.add_task(desired);

        let outcome = worker.run_next_task().await.unwrap();
        assert_eq!(outcome, WorkOutcome::Completed(id));
        let persisted = worker.task(&id).unwrap();
        assert_eq!(persisted.state, State::Completed);
        assert!(persisted.finish_time.is_some());
    }

    #[tokio::test]
    async fn stop_failure_best_effort_still_completes() {
        let mut worker = worker_with(FakeRuntime::failing_stop(), StopPolicy::BestEffort);
        let task = running_task("t1", "unit-t1");
        let id = task.id;
        worker.seed_task(task.clone());

        let mut desired = task;
        desired.state = State::Completed;
        worker.add_task(desired);

        let outcome = worker.run_next_task().await.unwrap();
        assert_eq!(outcome, WorkOutcome::Completed(id));
        assert_eq!(worker.task(&id).unwrap().state, State::Completed);
    }

    #[tokio::test]
    async fn stop_failure_strict_keeps_state() {
        let mut worker = worker_with(FakeRuntime::failing_stop(), StopPolicy::Strict);
        let task = running_task("t1", "unit-t1");
        let id = task.id;
        worker.seed_task(task.clone());

        let mut desired = task;
        desired.state = State::Completed;
        worker.add_task(desired);

        let err = worker.run_next_task().await.unwrap_err();
        assert!(matches!(err, WorkerError::Runtime(_)));
        assert_eq!(worker.task(&id).unwrap().state, State::Running);
    }

    #[tokio::test]
    async fn stop_without_unit_is_rejected() {
        let mut worker = worker_with(FakeRuntime::default(), StopPolicy::BestEffort);
        let mut task = Task::new("t1", "busybox:latest");
        task.state = State::Running;
        let id = task.id;
        worker.seed_task(task.clone());

        task.state = State::Completed;
        worker.add_task(task);

        let err = worker.run_next_task().await.unwrap_err();
        assert!(matches!(err, WorkerError::MissingUnit(task_id) if task_id == id));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_loop_releases_lock_during_runtime_action() {
        let runtime = FakeRuntime {
            hang_run: true,
            ..Default::default()
        };
        let worker = Arc::new(Mutex::new(Worker::new(
            "w1",
            Arc::new(runtime),
            StopPolicy::BestEffort,
            Duration::from_secs(120),
        )));
        worker.lock().await.add_task(scheduled_task("t1"));

        let drain = tokio::spawn(run_tasks(worker.clone(), Duration::from_secs(5)));
        // Let the loop dequeue the task and block inside the runtime call.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        // The registry must stay reachable while the start is in flight.
        let guard = tokio::time::timeout(Duration::from_millis(10), worker.lock()).await;
        assert!(guard.is_ok());
        drop(guard);
        drain.abort();
    }

    #[tokio::test]
    async fn vanished_unit_marks_task_failed() {
        // Registry says running, but the runtime has no such unit.
        let mut worker = worker_with(FakeRuntime::default(), StopPolicy::BestEffort);
        let task = running_task("t1", "unit-gone");
        let id = task.id;
        worker.seed_task(task);

        worker.check_units().await;

        let persisted = worker.task(&id).unwrap();
        assert_eq!(persisted.state, State::Failed);
        assert!(persisted.finish_time.is_some());
    }

    #[tokio::test]
    async fn healthy_unit_is_left_alone() {
        let runtime = FakeRuntime::default();
        runtime
            .units
            .lock()
            .unwrap()
            .insert("unit-t1".to_string(), true);
        let mut worker = worker_with(runtime, StopPolicy::BestEffort);

        let task = running_task("t1", "unit-t1");
        let id = task.id;
        worker.seed_task(task);

        worker.check_units().await;
        assert_eq!(worker.task(&id).unwrap().state, State::Running);
    }
}
