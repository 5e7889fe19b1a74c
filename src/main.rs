use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use corral::config::Config;
use corral::manager::{self, Manager, api::ManagerApi, client::HttpWorkerClient};
use corral::runtime::DockerRuntime;
use corral::scheduler::BinPack;
use corral::worker::{self, Worker, api::WorkerApi};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    info!(?config, "starting corral");

    let runtime = Arc::new(DockerRuntime::new().context("connecting to container runtime")?);
    let worker = Arc::new(Mutex::new(Worker::new(
        &config.worker_name,
        runtime,
        config.stop_policy,
        config.action_timeout,
    )));
    tokio::spawn(worker::run_tasks(worker.clone(), config.drain_interval));
    tokio::spawn(worker::collect_stats(worker.clone(), config.stats_interval));
    tokio::spawn(worker::watch_units(
        worker.clone(),
        config.unit_check_interval,
    ));
    let worker_api = WorkerApi::new(worker, &config.worker_host, config.worker_port);

    let manager = Arc::new(Mutex::new(Manager::new(
        config.workers.clone(),
        Box::new(BinPack),
        Arc::new(HttpWorkerClient::new()),
        config.demote_after,
    )));
    tokio::spawn(manager::run_dispatch(
        manager.clone(),
        config.dispatch_interval,
    ));
    tokio::spawn(manager::run_reconcile(
        manager.clone(),
        config.reconcile_interval,
    ));
    let manager_api = ManagerApi::new(manager, &config.manager_host, config.manager_port);

    tokio::try_join!(worker_api.serve(), manager_api.serve()).context("serving http apis")?;
    Ok(())
}
