//! Worker liveness, used to size target shards.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use archer_model::WorkerId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ArcherError, Result};

const WORKERS_KEY: &str = "archer:workers";

fn worker_key(id: &WorkerId) -> String {
    format!("{WORKERS_KEY}:{id}")
}

/// What a worker process advertises while it is alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: WorkerId,
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub started_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Refresh `registration` for another `ttl`.
    async fn heartbeat(&self, registration: &WorkerRegistration, ttl: Duration) -> Result<()>;

    async fn deregister(&self, worker: &WorkerId) -> Result<()>;

    /// Total processing slots of live workers consuming `queue`.
    async fn active_workers(&self, queue: &str) -> Result<usize>;
}

mod scripts {
    use redis::Script;

    /// Store the registration and index it by expiry.
    pub fn heartbeat() -> Script {
        Script::new(
            r#"
            local index = KEYS[1]
            local key = KEYS[2]
            local now = tonumber(ARGV[1])
            local ttl = tonumber(ARGV[2])

            redis.call('SET', key, ARGV[3], 'EX', ttl)
            redis.call('ZADD', index, now + ttl, ARGV[4])
            redis.call('ZREMRANGEBYSCORE', index, '-inf', now)
            return 1
            "#,
        )
    }
}

/// Registry kept in Redis: one TTL'd key per worker plus a sorted set of
/// worker ids scored by expiry.
#[derive(Clone)]
pub struct RedisWorkerRegistry {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisWorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisWorkerRegistry")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisWorkerRegistry {
    pub async fn new(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis worker registry at {}", redis_url);
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl WorkerRegistry for RedisWorkerRegistry {
    async fn heartbeat(&self, registration: &WorkerRegistration, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(registration)?;
        scripts::heartbeat()
            .key(WORKERS_KEY)
            .key(worker_key(&registration.id))
            .arg(Utc::now().timestamp())
            .arg(ttl.as_secs().max(1))
            .arg(body)
            .arg(registration.id.as_str())
            .invoke_async::<i64>(&mut conn)
            .await?;
        debug!(worker = %registration.id, "heartbeat");
        Ok(())
    }

    async fn deregister(&self, worker: &WorkerId) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(worker_key(worker))
            .ignore()
            .cmd("ZREM")
            .arg(WORKERS_KEY)
            .arg(worker.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn active_workers(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(WORKERS_KEY)
            .arg(Utc::now().timestamp())
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| worker_key(&WorkerId::from_raw(id.as_str())))
            .collect();
        let bodies: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut slots = 0;
        for body in bodies.into_iter().flatten() {
            let registration: WorkerRegistration = serde_json::from_str(&body)
                .map_err(|e| ArcherError::Internal(format!("corrupt worker registration: {e}")))?;
            if registration.queues.iter().any(|q| q == queue) {
                slots += registration.concurrency;
            }
        }
        Ok(slots)
    }
}

/// Registry for a single process; expiry is tracked with wall-clock time.
#[derive(Debug, Default)]
pub struct InMemoryWorkerRegistry {
    workers: Mutex<HashMap<WorkerId, (WorkerRegistration, DateTime<Utc>)>>,
}

impl InMemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn heartbeat(&self, registration: &WorkerRegistration, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        self.workers
            .lock()
            .insert(registration.id.clone(), (registration.clone(), expires_at));
        Ok(())
    }

    async fn deregister(&self, worker: &WorkerId) -> Result<()> {
        self.workers.lock().remove(worker);
        Ok(())
    }

    async fn active_workers(&self, queue: &str) -> Result<usize> {
        let now = Utc::now();
        Ok(self
            .workers
            .lock()
            .values()
            .filter(|(registration, expires_at)| {
                *expires_at > now && registration.queues.iter().any(|q| q == queue)
            })
            .map(|(registration, _)| registration.concurrency)
            .sum())
    }
}
