//! Shared configuration library for Archer.
//!
//! Every Archer process (coordinator, worker, scheduler and the operator CLI)
//! resolves its settings through [`ConfigLoader`]: `.env` first, then an
//! optional `archer.toml`, then environment overrides, followed by guard-rail
//! validation that either rejects the result or attaches [`ConfigWarnings`].

pub mod duration;
pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    BulkConfig, Config, ConfigMetadata, CoordinatorConfig, DatabaseConfig,
    HttpxConfig, MasscanConfig, ModulesConfig, NucleiConfig, QueueConfig,
    RedisConfig, SchedulerConfig, SearchConfig, ServerConfig, WorkerConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
