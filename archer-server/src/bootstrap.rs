//! Startup wiring shared by the coordinator, worker and scheduler binaries.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use archer_config::{Config, ConfigLoad, ConfigLoader};
use archer_core::queue::{
    Backoff, InMemoryWorkerRegistry, PostgresJobQueue, RedisWorkerRegistry, WorkerRegistry,
};
use archer_core::search::{ElasticsearchClient, SearchIndex};
use archer_core::{HttpxModule, MasscanModule, Mux, NucleiModule, WorkerSettings};
use archer_model::{ModuleName, WorkerId};
use clap::Args;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::telemetry::init_tracing;

/// Flags every Archer process accepts.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Path to archer.toml
    #[arg(long, env = "ARCHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

/// Load configuration, install logging and report any warnings.
pub fn load_config(args: &CommonArgs) -> anyhow::Result<Config> {
    let loader = match &args.config {
        Some(path) => ConfigLoader::new().with_config_path(path),
        None => ConfigLoader::new(),
    };
    let ConfigLoad { config, warnings } = loader.load().context("failed to load configuration")?;

    init_tracing(args.debug);

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }
    Ok(config)
}

pub async fn connect_database(config: &Config) -> anyhow::Result<PgPool> {
    let url = config
        .database_url()
        .ok_or_else(|| anyhow!("DATABASE_URL or [database].url must be provided"))?;
    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        anyhow::bail!("Invalid database URL: must start with postgres:// or postgresql://");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    info!(max_connections = config.database.max_connections, "connected to PostgreSQL");
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    archer_core::MIGRATOR
        .run(pool)
        .await
        .context("database migration failed")?;
    info!("database migrations applied");
    Ok(())
}

pub async fn job_queue(pool: &PgPool, config: &Config) -> anyhow::Result<Arc<PostgresJobQueue>> {
    let queue = PostgresJobQueue::new(
        pool.clone(),
        Backoff::from_config(&config.queue),
        config.queue.lease_ttl,
    )
    .await
    .context("failed to initialize the job queue")?;
    Ok(Arc::new(queue))
}

/// Redis-backed liveness when configured. Without Redis every module
/// counts as one live slot.
pub async fn worker_registry(config: &Config) -> anyhow::Result<Arc<dyn WorkerRegistry>> {
    match &config.redis.url {
        Some(url) => {
            let registry = RedisWorkerRegistry::new(url)
                .await
                .context("failed to connect to Redis")?;
            Ok(Arc::new(registry))
        }
        None => {
            warn!("REDIS_URL not set; worker liveness is tracked in memory only");
            Ok(Arc::new(InMemoryWorkerRegistry::new()))
        }
    }
}

pub async fn search_index(config: &Config) -> anyhow::Result<Arc<dyn SearchIndex>> {
    let client = ElasticsearchClient::new(&config.search).context("invalid search configuration")?;
    if let Err(err) = client.ensure_index().await {
        warn!(index = %client.index(), error = %err, "search index is not ready");
    }
    Ok(Arc::new(client))
}

pub fn parse_modules(names: &[String]) -> anyhow::Result<Vec<ModuleName>> {
    if names.is_empty() {
        anyhow::bail!("no modules configured; set [worker].modules or pass --module");
    }
    let mut modules = Vec::with_capacity(names.len());
    for name in names {
        let module = name.parse::<ModuleName>()?;
        if !modules.contains(&module) {
            modules.push(module);
        }
    }
    Ok(modules)
}

/// Register each module under its own name, with its configured section or
/// the defaults.
pub fn module_router(
    config: &Config,
    modules: &[ModuleName],
    index: &Arc<dyn SearchIndex>,
) -> anyhow::Result<Mux> {
    let mux: Mux = Mux::new();
    for module in modules {
        match module {
            ModuleName::Masscan => mux.register(
                module.as_str(),
                Arc::new(MasscanModule::new(
                    config.modules.masscan.clone().unwrap_or_default(),
                )),
            ),
            ModuleName::Httpx => mux.register(
                module.as_str(),
                Arc::new(HttpxModule::new(
                    config.modules.httpx.clone().unwrap_or_default(),
                    Arc::clone(index),
                )),
            ),
            ModuleName::Nuclei => mux.register(
                module.as_str(),
                Arc::new(NucleiModule::new(
                    config.modules.nuclei.clone().unwrap_or_default(),
                    Arc::clone(index),
                )),
            ),
        }
        .with_context(|| format!("failed to register {module}"))?;
    }
    Ok(mux)
}

pub fn worker_id(configured: Option<&str>) -> WorkerId {
    configured
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(WorkerId::from_raw)
        .unwrap_or_else(WorkerId::generate)
}

pub fn worker_settings(
    id: WorkerId,
    queues: Vec<String>,
    concurrency: usize,
    config: &Config,
) -> WorkerSettings {
    WorkerSettings {
        id,
        queues,
        concurrency: concurrency.max(1),
        poll_interval: config.queue.poll_interval,
        heartbeat_interval: config.redis.heartbeat_interval,
        worker_ttl: config.redis.worker_ttl,
        housekeeping_interval: config.queue.housekeeping_interval,
    }
}
