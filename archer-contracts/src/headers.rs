/// Header carrying the reporting worker's identity on task transitions.
pub const WORKER_ID_HEADER: &str = "x-worker-id";

/// Prefix of the user agent workers send to the coordinator.
pub const USER_AGENT_PREFIX: &str = "archer-worker";
