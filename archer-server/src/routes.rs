use archer_contracts::routes;
use axum::{
    Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// API version prefix mirroring the root routes.
pub const V1: &str = "/v1";

fn api_routes() -> Router<AppState> {
    Router::new()
        .route(routes::HEALTH, get(handlers::health))
        .route(
            routes::SCANS,
            get(handlers::list_scans).post(handlers::create_scan),
        )
        .route(routes::SCAN, get(handlers::get_scan))
        .route(routes::SCAN_TASKS, get(handlers::get_scan_tasks))
        .route(routes::TASK, get(handlers::get_task))
        .route(routes::TASK_STARTED, post(handlers::task_started))
        .route(routes::TASK_COMPLETED, post(handlers::task_completed))
        .route(routes::TASK_FAILED, post(handlers::task_failed))
}

/// Coordinator router, served at the root and under [`V1`].
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(api_routes())
        .nest(V1, api_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
