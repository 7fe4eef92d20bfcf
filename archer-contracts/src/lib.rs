//! Request and response bodies exchanged with the Archer coordinator.

pub mod headers;
pub mod requests;
pub mod responses;

pub use headers::{USER_AGENT_PREFIX, WORKER_ID_HEADER};
pub use requests::{CompletedTaskRequest, NewScanRequest};
pub use responses::{ApiErrorItem, ApiErrorKind, ErrorResponse, SuccessResponse};

/// Path constants for the coordinator surface.
pub mod routes {
    /// Liveness probe.
    pub const HEALTH: &str = "/health";
    /// Collection of scans.
    pub const SCANS: &str = "/scans";
    /// Single scan.
    pub const SCAN: &str = "/scans/{id}";
    /// Tasks belonging to a scan.
    pub const SCAN_TASKS: &str = "/scans/{id}/tasks";
    /// Single task.
    pub const TASK: &str = "/tasks/{id}";
    /// Worker reports a task start.
    pub const TASK_STARTED: &str = "/tasks/{id}/started";
    /// Worker reports a task completion.
    pub const TASK_COMPLETED: &str = "/tasks/{id}/completed";
    /// Worker reports a task failure.
    pub const TASK_FAILED: &str = "/tasks/{id}/failed";

    /// Substitute an id into one of the templated paths above.
    pub fn with_id(template: &str, id: &str) -> String {
        template.replace("{id}", id)
    }
}
