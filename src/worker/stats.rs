//! Host resource snapshot used as scheduler scoring input.

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

/// Point-in-time view of a worker host. A missing or failed probe degrades
/// to the zero snapshot via `Default`; scheduling treats that as a host
/// with no headroom rather than an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    pub hostname: String,
    pub cores: u64,
    /// Global cpu usage as a fraction in [0, 1].
    pub cpu_usage: f64,
    pub load_avg_one: f64,
    pub mem_total_mb: u64,
    pub mem_available_mb: u64,
    pub disk_total_mb: u64,
    pub disk_available_mb: u64,
    pub task_count: u64,
}

const MB: u64 = 1024 * 1024;

pub fn get_stats(sys: &System, task_count: u64) -> WorkerStats {
    let disks = Disks::new_with_refreshed_list();
    let disk_total: u64 = disks.iter().map(|d| d.total_space()).sum();
    let disk_available: u64 = disks.iter().map(|d| d.available_space()).sum();

    WorkerStats {
        hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        cores: sys.cpus().len() as u64,
        cpu_usage: f64::from(sys.global_cpu_usage()) / 100.0,
        load_avg_one: System::load_average().one,
        mem_total_mb: sys.total_memory() / MB,
        mem_available_mb: sys.available_memory() / MB,
        disk_total_mb: disk_total / MB,
        disk_available_mb: disk_available / MB,
        task_count,
    }
}
