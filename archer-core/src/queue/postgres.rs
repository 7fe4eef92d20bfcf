use std::time::Duration;

use archer_model::{TaskId, WorkerId};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use super::{Backoff, EnqueueRequest, FailOutcome, JobLease, JobQueue, JobState, new_lease_id};
use crate::error::{ArcherError, Result};

/// Durable queue stored in the `jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
    backoff: Backoff,
    /// Added to a job's timeout to get its lease length.
    lease_grace: Duration,
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl PostgresJobQueue {
    /// Connect the queue and verify the schema is migrated.
    pub async fn new(pool: PgPool, backoff: Backoff, lease_grace: Duration) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| ArcherError::Queue(format!("queue failed Postgres health check: {e}")))?;

        let index_exists = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT 1
            FROM pg_indexes
            WHERE schemaname = current_schema()
              AND indexname = $1
            LIMIT 1
            "#,
        )
        .bind("idx_jobs_ready_dequeue")
        .fetch_optional(&pool)
        .await?
        .is_some();

        if !index_exists {
            return Err(ArcherError::Queue(
                "required index idx_jobs_ready_dequeue is missing; run migrations".into(),
            ));
        }

        info!("job queue connected to Postgres");
        Ok(Self {
            pool,
            backoff,
            lease_grace,
        })
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, job_type, payload, max_retry, timeout_ms, retention_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(request.id.as_str())
        .bind(&request.queue)
        .bind(&request.job_type)
        .bind(&request.payload)
        .bind(i32::try_from(request.max_retry).unwrap_or(i32::MAX))
        .bind(millis(request.timeout))
        .bind(millis(request.retention))
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(ArcherError::Queue(format!(
                "job {} is already enqueued",
                request.id
            )));
        }
        debug!(
            job = %request.id,
            queue = %request.queue,
            job_type = %request.job_type,
            "enqueued job"
        );
        Ok(())
    }

    async fn dequeue(&self, queues: &[String], worker: &WorkerId) -> Result<Option<JobLease>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, queue, job_type, payload, attempts, max_retry, timeout_ms
            FROM jobs
            WHERE state = 'ready'
              AND queue = ANY($1)
              AND available_at <= NOW()
            ORDER BY available_at ASC, created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queues)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            drop(tx);
            return Ok(None);
        };

        let id: String = row.try_get("id")?;
        let timeout_ms: i64 = row.try_get("timeout_ms")?;
        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
        let lease_id = new_lease_id();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(timeout + self.lease_grace)
                .unwrap_or_else(|_| chrono::Duration::days(1));

        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'leased',
                lease_owner = $1,
                lease_id = $2,
                lease_expires_at = $3,
                updated_at = NOW()
            WHERE id = $4 AND state = 'ready'
            RETURNING id
            "#,
        )
        .bind(worker.as_str())
        .bind(&lease_id)
        .bind(expires_at)
        .bind(&id)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            drop(tx);
            return Ok(None);
        }

        let attempts: i32 = row.try_get("attempts")?;
        let max_retry: i32 = row.try_get("max_retry")?;
        let lease = JobLease {
            job_id: TaskId::from_raw(id),
            lease_id,
            queue: row.try_get("queue")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            retry: attempts.max(0) as u32,
            max_retry: max_retry.max(0) as u32,
            timeout,
            owner: worker.clone(),
            expires_at,
        };

        tx.commit().await?;
        Ok(Some(lease))
    }

    async fn complete(&self, lease: &JobLease, result: Vec<u8>) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                result = $2,
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                retain_until = NOW() + retention_ms * INTERVAL '1 millisecond',
                updated_at = NOW()
            WHERE lease_id = $1 AND state = 'leased'
            "#,
        )
        .bind(&lease.lease_id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            warn!(job = %lease.job_id, "completed a job whose lease was no longer held");
        }
        Ok(())
    }

    async fn fail(&self, lease: &JobLease, retryable: bool, error: &str) -> Result<FailOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT id, attempts, max_retry
            FROM jobs
            WHERE lease_id = $1 AND state = 'leased'
            FOR UPDATE
            "#,
        )
        .bind(&lease.lease_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            drop(tx);
            return Ok(FailOutcome::LeaseLost);
        };

        let id: String = row.try_get("id")?;
        let attempts: i32 = row.try_get("attempts")?;
        let max_retry: i32 = row.try_get("max_retry")?;

        if retryable && attempts < max_retry {
            let retry = (attempts + 1) as u32;
            let delay = self.backoff.delay(retry, &mut rand::rng());
            sqlx::query(
                r#"
                UPDATE jobs
                SET attempts = attempts + 1,
                    state = 'ready',
                    lease_owner = NULL,
                    lease_id = NULL,
                    lease_expires_at = NULL,
                    last_error = $2,
                    available_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(&id)
            .bind(error)
            .bind(millis(delay))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(FailOutcome::Retrying { retry, delay });
        }

        let (state, outcome) = if retryable {
            (JobState::Dead, FailOutcome::Exhausted)
        } else {
            (JobState::Failed, FailOutcome::Discarded)
        };
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2,
                lease_owner = NULL,
                lease_id = NULL,
                lease_expires_at = NULL,
                last_error = $3,
                retain_until = NOW() + retention_ms * INTERVAL '1 millisecond',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(&id)
        .bind(state.as_str())
        .bind(error)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        warn!(job = %id, state = state.as_str(), attempts, "job moved to terminal state");
        Ok(outcome)
    }

    async fn scan_expired_leases(&self) -> Result<u64> {
        let expired = sqlx::query(
            r#"
            SELECT id, attempts, max_retry
            FROM jobs
            WHERE state = 'leased'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut resurrected = 0u64;
        for row in expired {
            let id: String = row.try_get("id")?;
            let attempts: i32 = row.try_get("attempts")?;
            let max_retry: i32 = row.try_get("max_retry")?;

            if attempts < max_retry {
                let delay = self.backoff.delay((attempts + 1) as u32, &mut rand::rng());
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET attempts = attempts + 1,
                        state = 'ready',
                        lease_owner = NULL,
                        lease_id = NULL,
                        lease_expires_at = NULL,
                        available_at = NOW() + ($2::bigint) * INTERVAL '1 millisecond',
                        last_error = COALESCE(last_error, 'lease expired'),
                        updated_at = NOW()
                    WHERE id = $1 AND state = 'leased'
                    "#,
                )
                .bind(&id)
                .bind(millis(delay))
                .execute(&self.pool)
                .await?;
                resurrected += 1;
            } else {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET state = 'dead',
                        lease_owner = NULL,
                        lease_id = NULL,
                        lease_expires_at = NULL,
                        retain_until = NOW() + retention_ms * INTERVAL '1 millisecond',
                        last_error = COALESCE(last_error, 'lease expired (max attempts)'),
                        updated_at = NOW()
                    WHERE id = $1 AND state = 'leased'
                    "#,
                )
                .bind(&id)
                .execute(&self.pool)
                .await?;
                warn!(job = %id, "lease expired with no attempts left");
            }
        }

        Ok(resurrected)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE state IN ('completed', 'dead', 'failed')
              AND retain_until IS NOT NULL
              AND retain_until < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use super::*;
    use serde_json::json;

    fn backoff() -> Backoff {
        Backoff {
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
        }
    }

    fn request(id: &str, max_retry: u32) -> EnqueueRequest {
        EnqueueRequest {
            id: TaskId::from_raw(id),
            queue: "masscan".into(),
            job_type: "masscan".into(),
            payload: json!({"targets": ["10.0.0.1"]}),
            timeout: Duration::from_secs(60),
            retention: Duration::from_secs(60),
            max_retry,
        }
    }

    async fn seed_task(pool: &PgPool, id: &str) {
        sqlx::query(
            r#"
            INSERT INTO scans (id, modules, targets, ports)
            VALUES ('scan00000001', ARRAY['masscan'], ARRAY['10.0.0.1'], ARRAY[80])
            ON CONFLICT DO NOTHING
            "#,
        )
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tasks (id, scan_id, module) VALUES ($1, 'scan00000001', 'masscan')",
        )
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn job_result(pool: &PgPool, id: &TaskId) -> (String, Option<Vec<u8>>) {
        let row = sqlx::query("SELECT state, result FROM jobs WHERE id = $1")
            .bind(id.as_str())
            .fetch_one(pool)
            .await
            .unwrap();
        (row.get("state"), row.get("result"))
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn lease_complete_and_result(pool: PgPool) {
        seed_task(&pool, "job000000001").await;
        let queue = PostgresJobQueue::new(pool.clone(), backoff(), Duration::from_secs(1))
            .await
            .unwrap();
        queue.enqueue(request("job000000001", 3)).await.unwrap();
        assert!(queue.enqueue(request("job000000001", 3)).await.is_err());

        let worker = WorkerId::from_raw("w1");
        let lease = queue
            .dequeue(&["masscan".to_string()], &worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.job_id.as_str(), "job000000001");
        assert!(
            queue
                .dequeue(&["masscan".to_string()], &worker)
                .await
                .unwrap()
                .is_none()
        );

        queue.complete(&lease, b"3".to_vec()).await.unwrap();
        let (state, result) = job_result(&pool, &lease.job_id).await;
        assert_eq!(state, "completed");
        assert_eq!(result.as_deref(), Some(&b"3"[..]));
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn retries_until_exhausted(pool: PgPool) {
        seed_task(&pool, "job000000002").await;
        let queue = PostgresJobQueue::new(pool.clone(), backoff(), Duration::from_secs(1))
            .await
            .unwrap();
        queue.enqueue(request("job000000002", 1)).await.unwrap();
        let worker = WorkerId::from_raw("w1");
        let queues = vec!["masscan".to_string()];

        let lease = queue.dequeue(&queues, &worker).await.unwrap().unwrap();
        let outcome = queue.fail(&lease, true, "boom").await.unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { retry: 1, .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let lease = queue.dequeue(&queues, &worker).await.unwrap().unwrap();
        assert_eq!(lease.retry, 1);
        assert_eq!(queue.fail(&lease, true, "boom").await.unwrap(), FailOutcome::Exhausted);
        assert_eq!(queue.fail(&lease, true, "boom").await.unwrap(), FailOutcome::LeaseLost);
    }
}
