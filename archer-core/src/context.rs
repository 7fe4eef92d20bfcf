use archer_model::{ScanId, TaskId, WorkerId};
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Request-scoped values threaded through one job's execution.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub worker_id: WorkerId,
    /// Job type the job was enqueued with.
    pub job_type: String,
    /// Module the router resolved the job to.
    pub module: String,
    pub scan_id: ScanId,
    pub task_id: TaskId,
    pub queue: String,
    pub retry: u32,
    pub max_retry: u32,
    pub span: Span,
    pub cancel: CancellationToken,
}

impl TaskContext {
    /// Build a context and open its `task` span.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: WorkerId,
        job_type: impl Into<String>,
        module: impl Into<String>,
        scan_id: ScanId,
        task_id: TaskId,
        queue: impl Into<String>,
        retry: u32,
        max_retry: u32,
        cancel: CancellationToken,
    ) -> Self {
        let job_type = job_type.into();
        let module = module.into();
        let queue = queue.into();
        let span = tracing::info_span!(
            "task",
            worker = %worker_id,
            module = %module,
            scan = %scan_id,
            task = %task_id,
            queue = %queue,
            retry,
            max_retry,
        );
        Self {
            worker_id,
            job_type,
            module,
            scan_id,
            task_id,
            queue,
            retry,
            max_retry,
            span,
            cancel,
        }
    }

    /// Whether this attempt is the queue's last.
    pub fn is_last_attempt(&self) -> bool {
        self.retry >= self.max_retry
    }

    /// A child token for one unit of work inside this job.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

#[cfg(test)]
pub(crate) fn test_context(module: &str) -> TaskContext {
    TaskContext::new(
        WorkerId::from_raw("test-worker"),
        module,
        module,
        ScanId::from_raw("scan00000001"),
        TaskId::from_raw("task00000001"),
        module,
        0,
        25,
        CancellationToken::new(),
    )
}
