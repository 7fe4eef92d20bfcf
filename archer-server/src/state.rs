use std::fmt;
use std::sync::Arc;

use archer_core::ScanService;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ScanService>,
}

impl AppState {
    pub fn new(service: Arc<ScanService>) -> Self {
        Self { service }
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
