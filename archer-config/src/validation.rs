use archer_model::ModuleName;
use thiserror::Error;
use url::Url;

use super::models::Config;

#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("worker module '{0}' is not a valid module")]
    UnknownModule(String),
    #[error("worker serves '{0}' but [modules.{0}] is not configured")]
    MissingModuleSection(&'static str),
    #[error("httpx accepts either http_proxy or socks_proxy, not both")]
    ConflictingHttpxProxies,
    #[error("{field} must be at least 1")]
    ZeroConcurrency { field: &'static str },
    #[error("{field} must be longer than zero")]
    ZeroDuration { field: &'static str },
    #[error("search.hosts must list at least one Elasticsearch node")]
    NoSearchHosts,
    #[error("invalid {field} URL '{value}'")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if config.worker.concurrency == 0 {
        return Err(ConfigGuardRailError::ZeroConcurrency {
            field: "worker.concurrency",
        });
    }
    if config.scheduler.concurrency == 0 {
        return Err(ConfigGuardRailError::ZeroConcurrency {
            field: "scheduler.concurrency",
        });
    }

    let intervals = [
        ("redis.heartbeat_interval", config.redis.heartbeat_interval),
        ("redis.worker_ttl", config.redis.worker_ttl),
        ("queue.poll_interval", config.queue.poll_interval),
        ("queue.housekeeping_interval", config.queue.housekeeping_interval),
        ("queue.task_timeout", config.queue.task_timeout),
        ("search.bulk.flush_interval", config.search.bulk.flush_interval),
    ];
    if let Some((field, _)) = intervals.iter().find(|(_, value)| value.is_zero()) {
        return Err(ConfigGuardRailError::ZeroDuration { field: *field });
    }

    if config.search.hosts.is_empty() {
        return Err(ConfigGuardRailError::NoSearchHosts);
    }
    for host in &config.search.hosts {
        check_url("search.hosts", host)?;
    }
    check_url("coordinator.url", &config.coordinator.url)?;

    for raw in &config.worker.modules {
        let module: ModuleName = raw
            .parse()
            .map_err(|_| ConfigGuardRailError::UnknownModule(raw.clone()))?;
        let configured = match module {
            ModuleName::Masscan => config.modules.masscan.is_some(),
            ModuleName::Httpx => config.modules.httpx.is_some(),
            ModuleName::Nuclei => config.modules.nuclei.is_some(),
        };
        if !configured {
            return Err(ConfigGuardRailError::MissingModuleSection(
                module.as_str(),
            ));
        }
        if module == ModuleName::Masscan && config.worker.concurrency > 1 {
            warnings.push_with_hint(
                "masscan with worker concurrency above 1 is not recommended",
                "masscan saturates the adapter on its own; \
                 run masscan workers with concurrency = 1",
            );
        }
    }

    if let Some(httpx) = &config.modules.httpx
        && httpx.http_proxy.is_some()
        && httpx.socks_proxy.is_some()
    {
        return Err(ConfigGuardRailError::ConflictingHttpxProxies);
    }

    if config.redis.url.is_none() {
        warnings.push_with_hint(
            "REDIS_URL not configured; worker liveness falls back to a single assumed worker",
            "Set REDIS_URL or [redis].url so the scheduler can shard across live workers",
        );
    }

    Ok(warnings)
}

fn check_url(
    field: &'static str,
    value: &str,
) -> Result<(), ConfigGuardRailError> {
    Url::parse(value).map(|_| ()).map_err(|source| {
        ConfigGuardRailError::InvalidUrl {
            field,
            value: value.to_string(),
            source,
        }
    })
}
