//! Archer core: everything between a scan request and the indexed findings.
//!
//! The coordinator side owns the [`lifecycle`] state machine and the
//! [`scheduler`] that turns scans into queued tasks. Worker processes lease
//! those tasks from the [`queue`], route them through the [`mux`] to a
//! [`modules`] implementation, and stream results into the [`search`] index
//! while reporting progress through the [`coordinator`] client.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

/// Request-scoped values carried through one job
pub mod context;

/// Worker-side coordinator client and the task notifier seam
pub mod coordinator;

/// Target sharding across live workers
pub mod distribute;

/// Error types and error handling utilities
pub mod error;

/// Leased-job execution
pub mod handler;

/// Scan and task state transitions
pub mod lifecycle;

/// masscan, httpx and nuclei, plus the process execution engine
pub mod modules;

/// Job-type routing
pub mod mux;

/// Durable job queue and worker liveness
pub mod queue;

/// Task creation and sharding
pub mod scheduler;

/// Search index client, bulk indexer and merge scripts
pub mod search;

/// Scan and task persistence
pub mod store;

/// Worker process runtime
pub mod worker;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use context::TaskContext;
pub use coordinator::{CoordinatorClient, InProcessNotifier, LifecycleNotifier};
pub use distribute::distribute;
pub use error::{ArcherError, FieldError, Result};
pub use handler::TaskHandler;
pub use lifecycle::{ScanService, validate_new_scan};
pub use modules::{HttpxModule, MasscanModule, NucleiModule, ScanModule};
pub use mux::Mux;
pub use scheduler::{PlannedTask, Scheduler};
pub use worker::{WorkerRuntime, WorkerSettings, shutdown_on_ctrl_c};
