//! Worker process runtime: slot loops that lease and run jobs, plus the
//! heartbeat and housekeeping loops that keep the pool healthy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use archer_model::WorkerId;
use chrono::Utc;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ArcherError, Result};
use crate::handler::TaskHandler;
use crate::queue::{FailOutcome, JobLease, JobQueue, WorkerRegistration, WorkerRegistry};

/// How long shutdown waits for the loops to notice cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub id: WorkerId,
    /// Queues this process consumes.
    pub queues: Vec<String>,
    /// Concurrent slot loops.
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub worker_ttl: Duration,
    pub housekeeping_interval: Duration,
}

pub struct WorkerRuntime {
    settings: WorkerSettings,
    queue: Arc<dyn JobQueue>,
    registry: Arc<dyn WorkerRegistry>,
    handler: Arc<TaskHandler>,
    shutdown: CancellationToken,
}

impl fmt::Debug for WorkerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("settings", &self.settings)
            .field("queue", &self.queue)
            .field("handler", &self.handler)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WorkerRuntime {
    pub fn new(
        settings: WorkerSettings,
        queue: Arc<dyn JobQueue>,
        registry: Arc<dyn WorkerRegistry>,
        handler: Arc<TaskHandler>,
    ) -> Self {
        Self {
            settings,
            queue,
            registry,
            handler,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Cancelling this token stops every loop and in-flight job.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shutdown, then deregister.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let concurrency = self.settings.concurrency.max(1);
        info!(
            worker = %self.settings.id,
            queues = ?self.settings.queues,
            concurrency,
            "worker starting"
        );

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(concurrency + 2);
        for slot in 0..concurrency {
            let runtime = Arc::clone(&self);
            handles.push(tokio::spawn(async move { runtime.slot_loop(slot).await }));
        }
        let runtime = Arc::clone(&self);
        handles.push(tokio::spawn(async move { runtime.heartbeat_loop().await }));
        let runtime = Arc::clone(&self);
        handles.push(tokio::spawn(async move { runtime.housekeeper_loop().await }));

        self.shutdown.cancelled().await;
        info!(worker = %self.settings.id, "worker shutting down");

        match tokio::time::timeout(SHUTDOWN_GRACE, join_all(handles)).await {
            Ok(results) => {
                for err in results.into_iter().filter_map(|res| res.err()) {
                    warn!("worker loop failed: {err:?}");
                }
            }
            Err(_) => warn!("worker loops timed out during shutdown"),
        }

        if let Err(err) = self.registry.deregister(&self.settings.id).await {
            warn!(worker = %self.settings.id, error = %err, "failed to deregister");
        }
        info!(worker = %self.settings.id, "worker stopped");
        Ok(())
    }

    async fn slot_loop(&self, slot: usize) {
        debug!(worker = %self.settings.id, slot, "slot started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(true) => false,
                Ok(false) => true,
                Err(err) => {
                    warn!(worker = %self.settings.id, slot, error = %err, "dequeue failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.poll_interval) => {}
                }
            }
        }
        debug!(worker = %self.settings.id, slot, "slot stopped");
    }

    /// Lease and run at most one job. Returns whether a job was found.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(lease) = self
            .queue
            .dequeue(&self.settings.queues, &self.settings.id)
            .await?
        else {
            return Ok(false);
        };
        self.execute(lease).await;
        Ok(true)
    }

    async fn execute(&self, lease: JobLease) {
        let cancel = self.shutdown.child_token();
        let outcome = tokio::select! {
            result = tokio::time::timeout(
                lease.timeout,
                self.handler.handle(&lease, cancel.clone()),
            ) => {
                result.unwrap_or_else(|_| {
                    Err(ArcherError::ModuleExecution(format!(
                        "task timed out after {:?}",
                        lease.timeout
                    )))
                })
            }
            _ = self.shutdown.cancelled() => Err(ArcherError::Cancelled),
        };
        cancel.cancel();

        match outcome {
            Ok(result) => {
                if let Err(err) = self.queue.complete(&lease, result).await {
                    error!(task = %lease.job_id, error = %err, "failed to complete job");
                }
            }
            Err(err) => self.fail(&lease, err).await,
        }
    }

    async fn fail(&self, lease: &JobLease, err: ArcherError) {
        let retryable = err.is_retryable();
        match self.queue.fail(lease, retryable, &err.to_string()).await {
            Ok(FailOutcome::Retrying { retry, delay }) => warn!(
                task = %lease.job_id,
                job_type = %lease.job_type,
                retry,
                max_retry = lease.max_retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "task failed; retrying"
            ),
            Ok(outcome) if outcome.is_final() => {
                error!(
                    task = %lease.job_id,
                    job_type = %lease.job_type,
                    retry = lease.retry,
                    max_retry = lease.max_retry,
                    retryable,
                    error = %err,
                    "retry exhausted"
                );
                if let Err(notify) = self.handler.notifier().failed(&lease.job_id).await {
                    error!(task = %lease.job_id, error = %notify, "failed to report task failure");
                }
            }
            Ok(_) => warn!(
                task = %lease.job_id,
                error = %err,
                "lease lost before failure was recorded"
            ),
            Err(queue_err) => {
                error!(task = %lease.job_id, error = %queue_err, "failed to record job failure")
            }
        }
    }

    async fn heartbeat_loop(&self) {
        let registration = WorkerRegistration {
            id: self.settings.id.clone(),
            queues: self.settings.queues.clone(),
            concurrency: self.settings.concurrency.max(1),
            started_at: Utc::now(),
        };
        let mut ticker = tokio::time::interval(self.settings.heartbeat_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let beat = self
                        .registry
                        .heartbeat(&registration, self.settings.worker_ttl)
                        .await;
                    if let Err(err) = beat {
                        warn!(worker = %self.settings.id, error = %err, "heartbeat failed");
                    }
                }
            }
        }
    }

    async fn housekeeper_loop(&self) {
        let mut ticker = tokio::time::interval(self.settings.housekeeping_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.queue.scan_expired_leases().await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "resurrected expired leases"),
                        Err(err) => warn!("housekeeper scan_expired_leases error: {err}"),
                    }
                    match self.queue.purge_expired().await {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "purged finished jobs"),
                        Err(err) => warn!("housekeeper purge_expired error: {err}"),
                    }
                }
            }
        }
    }
}

/// Cancel `token` on Ctrl-C.
pub fn shutdown_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!("failed to listen for Ctrl-C: {err}");
                    return;
                }
                info!("received Ctrl-C");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}
