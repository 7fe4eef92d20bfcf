//! # Archer Server
//!
//! The coordinator: an Axum service that accepts scans, tracks their tasks
//! through the lifecycle state machine and enqueues work for the
//! `archer-worker` and `archer-scheduler` processes built from this crate.

pub mod bootstrap;
pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use errors::{ApiError, ApiResult};
pub use routes::create_app;
pub use state::AppState;
