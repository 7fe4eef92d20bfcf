//! Durable job queue and worker liveness.
//!
//! Jobs carry the id of the task row they execute, so a job and its task can
//! always be correlated. A dequeued job is leased to one worker until it is
//! completed, failed, or its lease expires and the housekeeper puts it back.

pub mod memory;
pub mod postgres;
pub mod workers;

use std::fmt;
use std::time::Duration;

use archer_config::QueueConfig;
use archer_model::{TaskId, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;

use crate::error::Result;

pub use memory::{InMemoryJobQueue, JobSnapshot};
pub use postgres::PostgresJobQueue;
pub use workers::{
    InMemoryWorkerRegistry, RedisWorkerRegistry, WorkerRegistration, WorkerRegistry,
};

/// Storage states of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Ready,
    Leased,
    Completed,
    /// Retries exhausted.
    Dead,
    /// Terminal error, never retried.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Leased => "leased",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
            JobState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    /// Job id; always the id of the task row the job executes.
    pub id: TaskId,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub timeout: Duration,
    pub retention: Duration,
    pub max_retry: u32,
}

impl EnqueueRequest {
    /// A request using the configured timeout, retention and retry budget.
    pub fn new(
        id: TaskId,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        payload: Value,
        policy: &QueueConfig,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            job_type: job_type.into(),
            payload,
            timeout: policy.task_timeout,
            retention: policy.retention,
            max_retry: policy.max_retry,
        }
    }
}

/// A job leased to one worker.
#[derive(Debug, Clone)]
pub struct JobLease {
    pub job_id: TaskId,
    /// Token proving ownership; a resurrected job gets a new one.
    pub lease_id: String,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    /// Failed attempts before this one.
    pub retry: u32,
    pub max_retry: u32,
    pub timeout: Duration,
    pub owner: WorkerId,
    pub expires_at: DateTime<Utc>,
}

/// What `fail` did with the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to ready after `delay`.
    Retrying { retry: u32, delay: Duration },
    /// No attempts left.
    Exhausted,
    /// Terminal error.
    Discarded,
    /// The lease was no longer held, so nothing changed.
    LeaseLost,
}

impl FailOutcome {
    /// Whether the job will never run again.
    pub fn is_final(&self) -> bool {
        matches!(self, FailOutcome::Exhausted | FailOutcome::Discarded)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync + fmt::Debug {
    /// Fails if a job with the same id already exists.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<()>;

    /// Lease the oldest ready job from any of `queues`.
    async fn dequeue(&self, queues: &[String], worker: &WorkerId) -> Result<Option<JobLease>>;

    async fn complete(&self, lease: &JobLease, result: Vec<u8>) -> Result<()>;

    async fn fail(&self, lease: &JobLease, retryable: bool, error: &str) -> Result<FailOutcome>;

    /// Put jobs whose lease expired back to ready, or dead when out of
    /// attempts. Returns how many were resurrected.
    async fn scan_expired_leases(&self) -> Result<u64>;

    /// Delete finished jobs past their retention.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Exponential retry delays with jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            base: config.backoff_base,
            max: config.backoff_max,
        }
    }

    fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }
        let exp = attempt.saturating_sub(1).min(62) as i32;
        let scaled = (self.base.as_millis() as f64) * 2f64.powi(exp);
        scaled.min(self.max.as_millis() as f64).max(0.0) as u64
    }

    /// Delay before retry number `attempt` (1-based), within 25% of the
    /// exponential value and never above `max`.
    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let base = self.base_delay_ms(attempt);
        if base == 0 {
            return Duration::ZERO;
        }
        let upper_cap = (self.max.as_millis() as u64).max(1);
        let capped = base.min(upper_cap) as f64;
        let spread = (capped * 0.25).max(1.0);
        let lower = (capped - spread).max(1.0);
        let upper = (capped + spread).min(upper_cap as f64).max(lower);
        Duration::from_millis(rng.random_range(lower..=upper).round() as u64)
    }
}

/// Random token identifying one lease.
pub(crate) fn new_lease_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}
