//! corral: a minimal cluster orchestrator. A manager accepts task events,
//! schedules them onto workers, and reconciles its view of task state with
//! what the workers report; each worker runs tasks as resource-bounded
//! containers through a pluggable runtime.

pub mod config;
pub mod manager;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use config::Config;
pub use manager::Manager;
pub use task::{State, Task, TaskEvent};
pub use worker::Worker;
