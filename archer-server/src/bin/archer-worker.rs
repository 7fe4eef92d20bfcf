//! `archer-worker`: runs masscan, httpx and nuclei tasks from the queue.

use std::sync::Arc;

use anyhow::Context;
use archer_core::{CoordinatorClient, TaskHandler, WorkerRuntime, shutdown_on_ctrl_c};
use archer_server::bootstrap::{
    CommonArgs, connect_database, job_queue, load_config, module_router, parse_modules,
    search_index, worker_id, worker_registry, worker_settings,
};
use clap::Parser;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "archer-worker")]
#[command(about = "Runs Archer scan modules against queued tasks")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Module to serve; repeat for several (overrides [worker].modules)
    #[arg(long = "module", value_name = "NAME")]
    modules: Vec<String>,

    /// Concurrent tasks (overrides [worker].concurrency)
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.common)?;

    let names = if cli.modules.is_empty() {
        config.worker.modules.clone()
    } else {
        cli.modules
    };
    let modules = parse_modules(&names)?;
    let id = worker_id(config.worker.id.as_deref());
    let concurrency = cli.concurrency.unwrap_or(config.worker.concurrency);

    let pool = connect_database(&config).await?;
    let queue = job_queue(&pool, &config).await?;
    let registry = worker_registry(&config).await?;
    let index = search_index(&config).await?;
    let mux = module_router(&config, &modules, &index)?;

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
    );
    let queues = modules
        .iter()
        .map(|module| module.queue().to_string())
        .collect();
    let runtime = Arc::new(WorkerRuntime::new(
        worker_settings(id.clone(), queues, concurrency, &config),
        queue,
        registry,
        Arc::new(handler),
    ));

    info!(worker = %id, modules = ?modules, concurrency, "starting worker");
    shutdown_on_ctrl_c(runtime.shutdown_token());
    runtime.run().await.context("worker runtime failed")
}
