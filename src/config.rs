//! Environment-driven configuration. Every knob has a default so a bare
//! `corral` starts a single-host cluster.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::worker::StopPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub worker_name: String,
    pub worker_host: String,
    pub worker_port: u16,
    pub manager_host: String,
    pub manager_port: u16,
    /// Worker addresses known to the manager at startup.
    pub workers: Vec<String>,
    pub drain_interval: Duration,
    pub stats_interval: Duration,
    pub unit_check_interval: Duration,
    pub dispatch_interval: Duration,
    pub reconcile_interval: Duration,
    /// Deadline applied to every runtime action.
    pub action_timeout: Duration,
    pub stop_policy: StopPolicy,
    /// Consecutive failed polls before a worker is demoted from scheduling.
    pub demote_after: u32,
}

fn parse_var<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(value) => value.parse().map_err(|err: T::Err| ConfigError::Invalid {
            var: var.to_string(),
            value,
            reason: err.to_string(),
        }),
    }
}

fn interval_var(var: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_var(var, default_secs)?))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_host: String =
            parse_var("CORRAL_WORKER_HOST", "127.0.0.1".to_string())?;
        let worker_port: u16 = parse_var("CORRAL_WORKER_PORT", 8081)?;

        let workers = match env::var("CORRAL_WORKERS") {
            Ok(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => vec![format!("{worker_host}:{worker_port}")],
        };

        Ok(Config {
            worker_name: parse_var("CORRAL_WORKER_NAME", "worker-1".to_string())?,
            worker_host,
            worker_port,
            manager_host: parse_var("CORRAL_MANAGER_HOST", "127.0.0.1".to_string())?,
            manager_port: parse_var("CORRAL_MANAGER_PORT", 8080)?,
            workers,
            drain_interval: interval_var("CORRAL_DRAIN_INTERVAL_SECS", 5)?,
            stats_interval: interval_var("CORRAL_STATS_INTERVAL_SECS", 15)?,
            unit_check_interval: interval_var("CORRAL_UNIT_CHECK_INTERVAL_SECS", 15)?,
            dispatch_interval: interval_var("CORRAL_DISPATCH_INTERVAL_SECS", 5)?,
            reconcile_interval: interval_var("CORRAL_RECONCILE_INTERVAL_SECS", 15)?,
            action_timeout: interval_var("CORRAL_ACTION_TIMEOUT_SECS", 120)?,
            stop_policy: parse_var("CORRAL_STOP_POLICY", StopPolicy::BestEffort)?,
            demote_after: parse_var("CORRAL_DEMOTE_AFTER", 3)?,
        })
    }
}
