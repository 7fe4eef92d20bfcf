//! `archer-server`: the coordinator HTTP service.

use std::sync::Arc;

use anyhow::Context;
use archer_core::store::PostgresScanStore;
use archer_core::{ScanService, Scheduler};
use archer_server::{
    AppState,
    bootstrap::{
        CommonArgs, connect_database, job_queue, load_config, run_migrations, worker_registry,
    },
    create_app,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "archer-server")]
#[command(about = "Coordinator for the Archer distributed recon pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    common: CommonArgs,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Db(DbCommand::Migrate)) => run_db_migrate(&cli.common).await,
        None => run_server(cli).await,
    }
}

async fn run_db_migrate(args: &CommonArgs) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let pool = connect_database(&config).await?;
    run_migrations(&pool).await
}

async fn run_server(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(&cli.common)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host {
        config.server.host = host;
    }

    let pool = connect_database(&config).await?;
    run_migrations(&pool).await?;

    let store = Arc::new(PostgresScanStore::new(pool.clone()));
    let queue = job_queue(&pool, &config).await?;
    let registry = worker_registry(&config).await?;
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        queue,
        registry,
        config.queue.clone(),
    ));
    let service = Arc::new(ScanService::new(store, scheduler));
    let router = create_app(AppState::new(service));

    let address = config.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!("Starting Archer coordinator on {}", address);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("coordinator server failed")?;
    info!("coordinator stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(err) => warn!(error = %err, "failed to listen for ctrl-c; shutting down"),
    }
}
