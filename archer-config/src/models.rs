use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Fully resolved configuration shared by every Archer process.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub search: SearchConfig,
    pub coordinator: CoordinatorConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub modules: ModulesConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Database URL, if one was configured anywhere.
    pub fn database_url(&self) -> Option<&str> {
        self.database.url.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: Option<String>,
    /// How often a worker refreshes its liveness registration.
    pub heartbeat_interval: Duration,
    /// Registrations older than this are considered dead.
    pub worker_ttl: Duration,
}

/// Durable job queue policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on a single job's execution time.
    #[serde(with = "crate::duration")]
    pub task_timeout: Duration,
    /// How long finished jobs are kept before the housekeeper purges them.
    #[serde(with = "crate::duration")]
    pub retention: Duration,
    pub max_retry: u32,
    /// Sleep between empty dequeue attempts.
    #[serde(with = "crate::duration")]
    pub poll_interval: Duration,
    /// Grace period past a job's timeout before its lease counts as abandoned.
    #[serde(with = "crate::duration")]
    pub lease_ttl: Duration,
    #[serde(with = "crate::duration")]
    pub housekeeping_interval: Duration,
    #[serde(with = "crate::duration")]
    pub backoff_base: Duration,
    #[serde(with = "crate::duration")]
    pub backoff_max: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(24 * 60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            max_retry: 25,
            poll_interval: Duration::from_millis(500),
            lease_ttl: Duration::from_secs(60),
            housekeeping_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub hosts: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub index: String,
    pub bulk: BulkConfig,
}

/// Bulk indexer tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Flush once the pending NDJSON body reaches this many bytes.
    pub flush_bytes: usize,
    #[serde(with = "crate::duration")]
    pub flush_interval: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,
    /// Flushing tasks per indexer, each with its own pending batch.
    pub workers: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            flush_bytes: 5 * 1024 * 1024,
            flush_interval: Duration::from_secs(30),
            pipeline: None,
            workers: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: Option<String>,
    pub concurrency: usize,
    pub modules: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub id: Option<String>,
    pub concurrency: usize,
}

/// Per-tool settings; a module a worker serves must have its section.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModulesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masscan: Option<MasscanConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub httpx: Option<HttpxConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nuclei: Option<NucleiConfig>,
}

fn default_config_dir() -> PathBuf {
    std::env::temp_dir()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MasscanConfig {
    #[serde(default = "MasscanConfig::default_binary")]
    pub binary: String,
    /// Directory that receives the per-task masscan configuration files.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_port: Option<u16>,
    #[serde(default)]
    pub persist_config: bool,
}

impl MasscanConfig {
    fn default_binary() -> String {
        "masscan".into()
    }
}

impl Default for MasscanConfig {
    fn default() -> Self {
        Self {
            binary: Self::default_binary(),
            config_dir: default_config_dir(),
            exclude_file: None,
            rate: None,
            adapter_port: None,
            persist_config: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpxConfig {
    #[serde(default = "HttpxConfig::default_binary")]
    pub binary: String,
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub persist_config: bool,
}

impl HttpxConfig {
    fn default_binary() -> String {
        "httpx".into()
    }
}

impl Default for HttpxConfig {
    fn default() -> Self {
        Self {
            binary: Self::default_binary(),
            config_dir: default_config_dir(),
            http_proxy: None,
            socks_proxy: None,
            threads: None,
            rate_limit: None,
            persist_config: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NucleiConfig {
    pub binary: String,
    pub config_dir: PathBuf,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub proxies: Vec<String>,
    /// Seconds nuclei waits before timing out a request.
    pub timeout: u32,
    pub retries: u32,
    pub rate_limit: u32,
    pub bulk_size: u32,
    pub concurrency: u32,
    pub persist_config: bool,
}

impl Default for NucleiConfig {
    fn default() -> Self {
        Self {
            binary: "nuclei".into(),
            config_dir: default_config_dir(),
            proxies: Vec::new(),
            timeout: 5,
            retries: 1,
            rate_limit: 150,
            bulk_size: 200,
            concurrency: 500,
            persist_config: false,
        }
    }
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
