use once_cell::sync::Lazy;
use std::{fs, path::PathBuf, time::Duration};
use thiserror::Error;

use super::{
    models::{
        Config, ConfigMetadata, CoordinatorConfig, DatabaseConfig,
        RedisConfig, SchedulerConfig, SearchConfig, ServerConfig,
        WorkerConfig,
    },
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("archer.toml"),
        PathBuf::from("config/archer.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Load `.env`, then the TOML file, then process environment overrides.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let mut load = self.load_with_env(EnvConfig::gather())?;
        load.config.metadata.env_file_loaded = env_file_loaded;
        Ok(load)
    }

    /// Resolve configuration against an explicit set of environment values.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) = compose_config(file_config, env, config_path)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigLoadError::MissingConfig { path });
                }
                path
            }
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
            {
                Some(path) => path.clone(),
                None => return Ok((None, None)),
            },
        };

        let contents = fs::read_to_string(&path).map_err(|err| {
            ConfigLoadError::Io {
                path: path.clone(),
                source: err,
            }
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    config_path: Option<PathBuf>,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if config_path.is_none() {
        warnings.push_with_hint(
            "No archer.toml detected; falling back to defaults and environment variables",
            "Pass --config, set ARCHER_CONFIG, or place archer.toml in the working directory",
        );
    }

    let FileConfig {
        server: file_server,
        database: file_database,
        redis: file_redis,
        queue,
        search: file_search,
        coordinator: file_coordinator,
        worker: file_worker,
        scheduler: file_scheduler,
        modules,
    } = file_config.unwrap_or_default();

    let server = ServerConfig {
        host: env
            .server_host
            .clone()
            .or(file_server.host)
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port: env.server_port.or(file_server.port).unwrap_or(8080),
    };

    let database = DatabaseConfig {
        url: env.database_url.clone().or(file_database.url),
        max_connections: file_database.max_connections.unwrap_or(10),
    };

    let redis = RedisConfig {
        url: env.redis_url.clone().or(file_redis.url),
        heartbeat_interval: file_redis
            .heartbeat_interval
            .unwrap_or(Duration::from_secs(5)),
        worker_ttl: file_redis.worker_ttl.unwrap_or(Duration::from_secs(15)),
    };

    let search = SearchConfig {
        hosts: env
            .elasticsearch_url
            .clone()
            .or(file_search.hosts)
            .unwrap_or_else(|| vec!["http://localhost:9200".to_string()]),
        username: file_search.username,
        password: file_search.password,
        index: file_search.index.unwrap_or_else(|| "archer".to_string()),
        bulk: file_search.bulk,
    };

    let coordinator = CoordinatorConfig {
        url: env
            .coordinator_url
            .clone()
            .or(file_coordinator.url)
            .unwrap_or_else(|| "http://localhost:8080".to_string()),
        timeout: file_coordinator
            .timeout
            .unwrap_or(Duration::from_secs(10)),
    };

    let worker = WorkerConfig {
        id: env.worker_id.clone().or(file_worker.id),
        concurrency: file_worker.concurrency.unwrap_or(1),
        modules: file_worker.modules.unwrap_or_default(),
    };

    let scheduler = SchedulerConfig {
        id: env.worker_id.clone().or(file_scheduler.id),
        concurrency: file_scheduler.concurrency.unwrap_or(4),
    };

    let config = Config {
        server,
        database,
        redis,
        queue,
        search,
        coordinator,
        worker,
        scheduler,
        modules,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded: false,
        },
    };

    let guard_warnings = validation::apply_guard_rails(&config)?;
    warnings.extend(guard_warnings);

    Ok((config, warnings))
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn load(contents: &str) -> Result<ConfigLoad, ConfigLoadError> {
        let file = write_config(contents);
        ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(EnvConfig::default())
    }

    #[test]
    fn defaults_apply_to_an_empty_file() {
        let load = load("").unwrap();
        let config = load.config;
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.queue.max_retry, 25);
        assert_eq!(config.queue.task_timeout, Duration::from_secs(86_400));
        assert_eq!(config.coordinator.timeout, Duration::from_secs(10));
        assert_eq!(config.search.hosts, vec!["http://localhost:9200"]);
        assert!(config.metadata.config_path.is_some());
    }

    #[test]
    fn human_durations_and_module_sections_parse() {
        let load = load(
            r#"
            [queue]
            task_timeout = "2h"
            poll_interval = "250ms"

            [coordinator]
            url = "http://coordinator:8080"
            timeout = "30s"

            [worker]
            id = "worker1"
            concurrency = 2
            modules = ["httpx", "nuclei"]

            [modules.httpx]
            binary = "/usr/local/bin/httpx"
            threads = 50

            [modules.nuclei]
            rate_limit = 300
            "#,
        )
        .unwrap();
        let config = load.config;
        assert_eq!(config.queue.task_timeout, Duration::from_secs(7_200));
        assert_eq!(config.queue.poll_interval, Duration::from_millis(250));
        assert_eq!(config.coordinator.timeout, Duration::from_secs(30));
        assert_eq!(config.worker.modules, vec!["httpx", "nuclei"]);
        let nuclei = config.modules.nuclei.unwrap();
        assert_eq!(nuclei.rate_limit, 300);
        assert_eq!(nuclei.timeout, 5);
        assert_eq!(config.modules.httpx.unwrap().threads, Some(50));
    }

    #[test]
    fn environment_overrides_file_values() {
        let file = write_config(
            r#"
            [server]
            port = 9000
            [coordinator]
            url = "http://file:8080"
            "#,
        );
        let env = EnvConfig {
            server_port: Some(9100),
            coordinator_url: Some("http://env:8080".into()),
            worker_id: Some("from-env".into()),
            ..EnvConfig::default()
        };
        let config = ConfigLoader::new()
            .with_config_path(file.path())
            .load_with_env(env)
            .unwrap()
            .config;
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.coordinator.url, "http://env:8080");
        assert_eq!(config.worker.id.as_deref(), Some("from-env"));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let cases = [
            ("[search.bulk]\nflush_interval = \"0s\"", "search.bulk.flush_interval"),
            ("[redis]\nheartbeat_interval = \"0s\"", "redis.heartbeat_interval"),
            ("[queue]\npoll_interval = \"0ms\"", "queue.poll_interval"),
            ("[queue]\nhousekeeping_interval = \"0s\"", "queue.housekeeping_interval"),
        ];
        for (contents, expected) in cases {
            let err = load(contents).unwrap_err();
            assert!(
                matches!(
                    err,
                    ConfigLoadError::GuardRail(ConfigGuardRailError::ZeroDuration { field })
                        if field == expected
                ),
                "{expected}: {err}"
            );
        }
        assert!(load("[search.bulk]\nflush_interval = \"1ms\"").is_ok());
    }

    #[test]
    fn unknown_worker_module_is_rejected() {
        let err = load(
            r#"
            [worker]
            modules = ["zmap"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::GuardRail(ConfigGuardRailError::UnknownModule(ref m)) if m == "zmap"
        ));
    }

    #[test]
    fn worker_module_requires_its_section() {
        let err = load(
            r#"
            [worker]
            modules = ["masscan"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::GuardRail(
                ConfigGuardRailError::MissingModuleSection("masscan")
            )
        ));
    }

    #[test]
    fn httpx_rejects_two_proxies() {
        let err = load(
            r#"
            [modules.httpx]
            http_proxy = "http://127.0.0.1:8080"
            socks_proxy = "socks5://127.0.0.1:1080"
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::GuardRail(
                ConfigGuardRailError::ConflictingHttpxProxies
            )
        ));
    }

    #[test]
    fn masscan_concurrency_warns() {
        let load = load(
            r#"
            [worker]
            concurrency = 4
            modules = ["masscan"]

            [modules.masscan]
            rate = 1000
            "#,
        )
        .unwrap();
        assert!(
            load.warnings
                .items
                .iter()
                .any(|w| w.message.contains("not recommended"))
        );
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new()
            .with_config_path(dir.path().join("absent.toml"))
            .load_with_env(EnvConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }
}
