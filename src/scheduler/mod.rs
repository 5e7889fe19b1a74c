//! Placement decisions: which worker gets a task. Three separable phases
//! (candidate selection, scoring, picking) so alternate policies can be
//! swapped in without touching the manager's call sites.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::task::Task;
use crate::worker::stats::WorkerStats;

/// Scheduling view of one worker, built from its last stats report.
#[derive(Debug, Clone)]
pub struct Node {
    pub addr: String,
    pub cores: u64,
    pub memory_mb: u64,
    pub memory_available_mb: u64,
    pub disk_mb: u64,
    pub disk_available_mb: u64,
    /// Fraction in [0, 1].
    pub cpu_usage: f64,
    pub task_count: u64,
}

impl Node {
    pub fn from_stats(addr: &str, stats: &WorkerStats) -> Self {
        Node {
            addr: addr.to_string(),
            cores: stats.cores,
            memory_mb: stats.mem_total_mb,
            memory_available_mb: stats.mem_available_mb,
            disk_mb: stats.disk_total_mb,
            disk_available_mb: stats.disk_available_mb,
            cpu_usage: stats.cpu_usage,
            task_count: stats.task_count,
        }
    }

    fn cpu_headroom(&self) -> f64 {
        self.cores as f64 * (1.0 - self.cpu_usage)
    }

    /// Whether this node has the free memory, disk, and cpu the task asks for.
    pub fn can_fit(&self, task: &Task) -> bool {
        self.memory_available_mb >= task.memory
            && self.disk_available_mb >= task.disk
            && self.cpu_headroom() >= task.cpu
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ScheduleError {
    #[error("pick called with no scored candidates")]
    NoCandidates,
}

/// Placement policy. `score` maps lower to more preferred; `pick` must only
/// be called with a non-empty score map.
pub trait Scheduler: Send + Sync {
    fn select_candidates(&self, task: &Task, nodes: &[Node]) -> Vec<Node>;

    fn score(&self, task: &Task, candidates: &[Node]) -> BTreeMap<String, f64>;

    fn pick(&self, scores: &BTreeMap<String, f64>) -> Result<String, ScheduleError>;
}

/// Bin-packing policy: place onto the viable node that would be left with
/// the least remaining headroom, keeping emptier nodes free for larger
/// tasks. Ties break on node address so repeated runs agree.
#[derive(Debug, Default)]
pub struct BinPack;

impl Scheduler for BinPack {
    fn select_candidates(&self, task: &Task, nodes: &[Node]) -> Vec<Node> {
        nodes.iter().filter(|n| n.can_fit(task)).cloned().collect()
    }

    fn score(&self, task: &Task, candidates: &[Node]) -> BTreeMap<String, f64> {
        candidates
            .iter()
            .map(|node| {
                let mem_left = (node.memory_available_mb.saturating_sub(task.memory)) as f64
                    / node.memory_mb.max(1) as f64;
                let disk_left = (node.disk_available_mb.saturating_sub(task.disk)) as f64
                    / node.disk_mb.max(1) as f64;
                (node.addr.clone(), mem_left + disk_left)
            })
            .collect()
    }

    fn pick(&self, scores: &BTreeMap<String, f64>) -> Result<String, ScheduleError> {
        // BTreeMap iterates in address order, so keeping the first strict
        // minimum breaks score ties toward the smallest address.
        let mut best: Option<(&String, f64)> = None;
        for (addr, &score) in scores {
            match best {
                Some((_, s)) if score >= s => {}
                _ => best = Some((addr, score)),
            }
        }
        best.map(|(addr, _)| addr.clone())
            .ok_or(ScheduleError::NoCandidates)
    }
}
