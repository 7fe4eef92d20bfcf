use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::{BulkConfig, ModulesConfig, QueueConfig};

/// Raw configuration as defined in `archer.toml`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub redis: FileRedisConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub search: FileSearchConfig,
    #[serde(default)]
    pub coordinator: FileCoordinatorConfig,
    #[serde(default)]
    pub worker: FileWorkerConfig,
    #[serde(default)]
    pub scheduler: FileSchedulerConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRedisConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub heartbeat_interval: Option<Duration>,
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub worker_ttl: Option<Duration>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSearchConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosts: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default)]
    pub bulk: BulkConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCoordinatorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(
        default,
        with = "crate::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileWorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSchedulerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub elasticsearch_url: Option<Vec<String>>,
    pub coordinator_url: Option<String>,
    pub worker_id: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_blank_var("ARCHER_CONFIG").map(PathBuf::from),
            server_host: non_blank_var("SERVER_HOST"),
            server_port: std::env::var("SERVER_PORT")
                .ok()
                .and_then(|s| s.trim().parse().ok()),
            database_url: non_blank_var("DATABASE_URL"),
            redis_url: non_blank_var("REDIS_URL"),
            elasticsearch_url: parse_csv_var("ELASTICSEARCH_URL"),
            coordinator_url: non_blank_var("COORDINATOR_URL"),
            worker_id: non_blank_var("WORKER_ID"),
        }
    }
}

fn non_blank_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_csv_var(name: &str) -> Option<Vec<String>> {
    let parsed: Vec<String> = std::env::var(name)
        .ok()?
        .split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect();
    if parsed.is_empty() { None } else { Some(parsed) }
}
