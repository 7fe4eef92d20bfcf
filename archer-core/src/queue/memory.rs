use std::time::Duration;

use archer_model::{TaskId, WorkerId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use super::{EnqueueRequest, FailOutcome, JobLease, JobQueue, JobState, new_lease_id};
use crate::error::{ArcherError, Result};

#[derive(Debug, Clone)]
struct StoredJob {
    request: EnqueueRequest,
    state: JobState,
    attempts: u32,
    available_at: DateTime<Utc>,
    lease_id: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    result: Option<Vec<u8>>,
    last_error: Option<String>,
    retain_until: Option<DateTime<Utc>>,
    created_seq: u64,
}

/// Read-only view of a queued job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: TaskId,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,
    pub attempts: u32,
    pub result: Option<Vec<u8>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Jobs {
    jobs: Vec<StoredJob>,
    seq: u64,
}

/// Process-local queue with the same lease and retry semantics as the
/// Postgres queue. Retries become ready immediately.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    jobs: Mutex<Jobs>,
    lease_ttl: Duration,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(1))
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Jobs::default()),
            lease_ttl: Duration::from_secs(60),
        }
    }

    /// Leases last exactly `ttl`, ignoring job timeouts.
    pub fn with_lease_ttl(ttl: Duration) -> Self {
        Self {
            jobs: Mutex::new(Jobs::default()),
            lease_ttl: ttl,
        }
    }

    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.jobs
            .lock()
            .jobs
            .iter()
            .map(|job| JobSnapshot {
                id: job.request.id.clone(),
                queue: job.request.queue.clone(),
                job_type: job.request.job_type.clone(),
                payload: job.request.payload.clone(),
                state: job.state,
                attempts: job.attempts,
                result: job.result.clone(),
                last_error: job.last_error.clone(),
            })
            .collect()
    }

    pub fn job(&self, id: &TaskId) -> Option<JobSnapshot> {
        self.snapshot().into_iter().find(|job| &job.id == id)
    }

    /// Jobs currently ready on `queue`.
    pub fn ready(&self, queue: &str) -> Vec<JobSnapshot> {
        self.snapshot()
            .into_iter()
            .filter(|job| job.queue == queue && job.state == JobState::Ready)
            .collect()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<()> {
        let mut guard = self.jobs.lock();
        if guard.jobs.iter().any(|job| job.request.id == request.id) {
            return Err(ArcherError::Queue(format!(
                "job {} is already enqueued",
                request.id
            )));
        }
        guard.seq += 1;
        let created_seq = guard.seq;
        guard.jobs.push(StoredJob {
            request,
            state: JobState::Ready,
            attempts: 0,
            available_at: Utc::now(),
            lease_id: None,
            lease_expires_at: None,
            result: None,
            last_error: None,
            retain_until: None,
            created_seq,
        });
        Ok(())
    }

    async fn dequeue(&self, queues: &[String], worker: &WorkerId) -> Result<Option<JobLease>> {
        let now = Utc::now();
        let mut guard = self.jobs.lock();
        let Some(job) = guard
            .jobs
            .iter_mut()
            .filter(|job| {
                job.state == JobState::Ready
                    && job.available_at <= now
                    && queues.contains(&job.request.queue)
            })
            .min_by_key(|job| (job.available_at, job.created_seq))
        else {
            return Ok(None);
        };

        let lease_id = new_lease_id();
        let expires_at = now + to_chrono(self.lease_ttl);
        job.state = JobState::Leased;
        job.lease_id = Some(lease_id.clone());
        job.lease_expires_at = Some(expires_at);

        Ok(Some(JobLease {
            job_id: job.request.id.clone(),
            lease_id,
            queue: job.request.queue.clone(),
            job_type: job.request.job_type.clone(),
            payload: job.request.payload.clone(),
            retry: job.attempts,
            max_retry: job.request.max_retry,
            timeout: job.request.timeout,
            owner: worker.clone(),
            expires_at,
        }))
    }

    async fn complete(&self, lease: &JobLease, result: Vec<u8>) -> Result<()> {
        let mut guard = self.jobs.lock();
        if let Some(job) = guard.jobs.iter_mut().find(|job| {
            job.state == JobState::Leased && job.lease_id.as_deref() == Some(&lease.lease_id)
        }) {
            job.state = JobState::Completed;
            job.result = Some(result);
            job.lease_id = None;
            job.lease_expires_at = None;
            job.retain_until = Some(Utc::now() + to_chrono(job.request.retention));
        }
        Ok(())
    }

    async fn fail(&self, lease: &JobLease, retryable: bool, error: &str) -> Result<FailOutcome> {
        let mut guard = self.jobs.lock();
        let Some(job) = guard.jobs.iter_mut().find(|job| {
            job.state == JobState::Leased && job.lease_id.as_deref() == Some(&lease.lease_id)
        }) else {
            return Ok(FailOutcome::LeaseLost);
        };

        job.lease_id = None;
        job.lease_expires_at = None;
        job.last_error = Some(error.to_string());

        if retryable && job.attempts < job.request.max_retry {
            job.attempts += 1;
            job.state = JobState::Ready;
            job.available_at = Utc::now();
            return Ok(FailOutcome::Retrying {
                retry: job.attempts,
                delay: Duration::ZERO,
            });
        }

        job.retain_until = Some(Utc::now() + to_chrono(job.request.retention));
        if retryable {
            job.state = JobState::Dead;
            Ok(FailOutcome::Exhausted)
        } else {
            job.state = JobState::Failed;
            Ok(FailOutcome::Discarded)
        }
    }

    async fn scan_expired_leases(&self) -> Result<u64> {
        let now = Utc::now();
        let mut guard = self.jobs.lock();
        let mut resurrected = 0;
        for job in guard.jobs.iter_mut().filter(|job| {
            job.state == JobState::Leased && job.lease_expires_at.is_some_and(|at| at < now)
        }) {
            job.lease_id = None;
            job.lease_expires_at = None;
            job.last_error.get_or_insert_with(|| "lease expired".into());
            if job.attempts < job.request.max_retry {
                job.attempts += 1;
                job.state = JobState::Ready;
                job.available_at = now;
                resurrected += 1;
            } else {
                job.state = JobState::Dead;
                job.retain_until = Some(now + to_chrono(job.request.retention));
            }
        }
        Ok(resurrected)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut guard = self.jobs.lock();
        let before = guard.jobs.len();
        guard
            .jobs
            .retain(|job| !job.retain_until.is_some_and(|until| until <= now));
        Ok((before - guard.jobs.len()) as u64)
    }
}
