//! Authoritative scan and task state.

pub mod memory;
pub mod postgres;

use std::fmt;

use archer_model::{Scan, ScanId, Task, TaskId, WorkerId};
use async_trait::async_trait;

use crate::error::Result;

pub use memory::InMemoryScanStore;
pub use postgres::PostgresScanStore;

/// Persistence for scans and tasks.
///
/// Task transitions are serialized per task. Implementations return
/// `AlreadyTerminal` instead of touching a completed or failed task, and
/// `NotFound` for unknown ids.
#[async_trait]
pub trait ScanStore: Send + Sync + fmt::Debug {
    async fn insert_scan(&self, scan: &Scan) -> Result<()>;

    async fn scan(&self, id: &ScanId) -> Result<Scan>;

    /// Newest first.
    async fn scans(&self) -> Result<Vec<Scan>>;

    async fn insert_task(&self, task: &Task) -> Result<()>;

    async fn task(&self, id: &TaskId) -> Result<Task>;

    /// Oldest first.
    async fn tasks(&self, scan: &ScanId) -> Result<Vec<Task>>;

    /// Mark the task active and, in the same transaction, promote its scan
    /// from pending to active. Replays keep the first start time.
    async fn start_task(&self, id: &TaskId, worker: &WorkerId) -> Result<Task>;

    /// Mark the task completed and insert `follow_ups` in the same
    /// transaction. Follow-ups are pending tasks of the same scan, so the
    /// scan stays open until they run.
    async fn complete_task(
        &self,
        id: &TaskId,
        worker: &WorkerId,
        results: i64,
        follow_ups: &[Task],
    ) -> Result<Task>;

    /// Failing an already failed task is a no-op that returns it unchanged.
    async fn fail_task(&self, id: &TaskId, worker: &WorkerId) -> Result<Task>;

    /// Fail a task that never reached a worker, such as one whose job could
    /// not be queued.
    async fn abandon_task(&self, id: &TaskId) -> Result<Task>;

    /// Complete the scan if none of its tasks are pending or active.
    /// Returns true only for the call that performed the transition.
    async fn try_complete_scan(&self, id: &ScanId) -> Result<bool>;
}
