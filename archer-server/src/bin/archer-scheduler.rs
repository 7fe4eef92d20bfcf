//! `archer-scheduler`: turns finished stages into the next stage's tasks.

use std::sync::Arc;

use anyhow::Context;
use archer_core::store::PostgresScanStore;
use archer_core::{CoordinatorClient, Scheduler, TaskHandler, WorkerRuntime, shutdown_on_ctrl_c};
use archer_model::{ALL_MODULES, SCHEDULER_QUEUE};
use archer_server::bootstrap::{
    CommonArgs, connect_database, job_queue, load_config, module_router, search_index, worker_id,
    worker_registry, worker_settings,
};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "archer-scheduler")]
#[command(about = "Schedules follow-up Archer tasks from indexed results")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Concurrent scheduling jobs (overrides [scheduler].concurrency)
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.common)?;

    let id = worker_id(config.scheduler.id.as_deref());
    let concurrency = cli.concurrency.unwrap_or(config.scheduler.concurrency);

    let pool = connect_database(&config).await?;
    let queue = job_queue(&pool, &config).await?;
    let registry = worker_registry(&config).await?;
    let index = search_index(&config).await?;
    let mux = module_router(&config, &ALL_MODULES, &index)?;

    let scheduler = Arc::new(Scheduler::new(
        Arc::new(PostgresScanStore::new(pool.clone())),
        queue.clone(),
        registry.clone(),
        config.queue.clone(),
    ));

    let coordinator = CoordinatorClient::new(
        &config.coordinator.url,
        config.coordinator.timeout,
        Some(id.clone()),
    )
    .context("failed to build coordinator client")?;
    if let Err(err) = coordinator.health().await {
        warn!(url = %coordinator.base_url(), error = %err, "coordinator is not reachable yet");
    }

    let handler = TaskHandler::new(
        id.clone(),
        Arc::new(mux),
        Arc::new(coordinator),
        index,
        config.search.bulk.clone(),
    )
    .with_scheduler(scheduler);
    let runtime = Arc::new(WorkerRuntime::new(
        worker_settings(
            id.clone(),
            vec![SCHEDULER_QUEUE.to_string()],
            concurrency,
            &config,
        ),
        queue,
        registry,
        Arc::new(handler),
    ));

    info!(scheduler = %id, concurrency, "starting scheduler");
    shutdown_on_ctrl_c(runtime.shutdown_token());
    runtime.run().await.context("scheduler runtime failed")
}
