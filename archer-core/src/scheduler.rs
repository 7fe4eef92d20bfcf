//! Creates tasks and their queue jobs, one per shard of live workers.

use std::fmt;
use std::sync::Arc;

use archer_config::QueueConfig;
use archer_model::{
    ModuleName, SCHEDULER_MODULE, SCHEDULER_QUEUE, ScanId, Task, TaskId, TaskStatus,
};
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::distribute::distribute;
use crate::error::Result;
use crate::modules::{HttpxPayload, MasscanPayload, NucleiPayload, SchedulePayload};
use crate::queue::{EnqueueRequest, JobQueue, WorkerRegistry};
use crate::store::ScanStore;

/// A pending task and the job that will run it, not yet persisted.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub task: Task,
    pub queue: String,
    pub job_type: String,
}

pub struct Scheduler {
    store: Arc<dyn ScanStore>,
    queue: Arc<dyn JobQueue>,
    registry: Arc<dyn WorkerRegistry>,
    policy: QueueConfig,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("store", &self.store)
            .field("queue", &self.queue)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ScanStore>,
        queue: Arc<dyn JobQueue>,
        registry: Arc<dyn WorkerRegistry>,
        policy: QueueConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            policy,
        }
    }

    /// Live processing slots on `module`'s queue, never less than one.
    async fn worker_count(&self, module: ModuleName) -> usize {
        match self.registry.active_workers(module.queue()).await {
            Ok(0) => 1,
            Ok(count) => count,
            Err(err) => {
                warn!(module = %module, error = %err, "could not count workers; assuming one");
                1
            }
        }
    }

    fn plan(
        scan: &ScanId,
        module: &str,
        queue: &str,
        job_type: &str,
        payload: Value,
    ) -> PlannedTask {
        let now = Utc::now();
        PlannedTask {
            task: Task {
                id: TaskId::generate(),
                scan_id: scan.clone(),
                module: module.to_string(),
                payload: Some(payload),
                results: None,
                status: TaskStatus::Pending,
                worker_id: None,
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            },
            queue: queue.to_string(),
            job_type: job_type.to_string(),
        }
    }

    /// Persist a pending task, then enqueue its job under the task's id.
    async fn create_task(
        &self,
        scan: &ScanId,
        module: &str,
        queue: &str,
        job_type: &str,
        payload: Value,
    ) -> Result<Task> {
        let planned = Self::plan(scan, module, queue, job_type, payload);
        self.store.insert_task(&planned.task).await?;
        self.dispatch(&planned).await?;
        Ok(planned.task)
    }

    /// Enqueue the job of an already persisted task.
    ///
    /// A task whose job cannot be queued would stay pending forever and hold
    /// its scan open, so it is failed and the scan given a chance to finish.
    pub async fn dispatch(&self, planned: &PlannedTask) -> Result<()> {
        let task = &planned.task;
        let payload = task.payload.clone().unwrap_or(Value::Null);
        let request = EnqueueRequest::new(
            task.id.clone(),
            planned.queue.as_str(),
            planned.job_type.as_str(),
            payload,
            &self.policy,
        );
        let Err(err) = self.queue.enqueue(request).await else {
            info!(
                scan = %task.scan_id,
                task = %task.id,
                queue = %planned.queue,
                job_type = %planned.job_type,
                "queued task"
            );
            return Ok(());
        };

        error!(scan = %task.scan_id, task = %task.id, error = %err, "could not queue task");
        if let Err(abandon) = self.store.abandon_task(&task.id).await {
            error!(task = %task.id, error = %abandon, "could not fail unqueued task");
            return Err(err);
        }
        match self.store.try_complete_scan(&task.scan_id).await {
            Ok(true) => info!(scan = %task.scan_id, "scan completed"),
            Ok(false) => {}
            Err(check) => {
                warn!(scan = %task.scan_id, error = %check, "scan completion check failed")
            }
        }
        Err(err)
    }

    pub async fn schedule_masscan(
        &self,
        scan: &ScanId,
        targets: &[String],
        ports: &[u16],
    ) -> Result<Vec<Task>> {
        let module = ModuleName::Masscan;
        let shards = distribute(targets, self.worker_count(module).await);
        let seed = rand::rng().random_range(0..i64::MAX);
        let total = shards.len();

        let mut tasks = Vec::with_capacity(total);
        for (index, shard) in shards.into_iter().enumerate() {
            let payload = serde_json::to_value(MasscanPayload {
                scan: scan.clone(),
                targets: shard,
                ports: ports.to_vec(),
                shard: format!("{}/{total}", index + 1),
                seed,
            })?;
            tasks.push(
                self.create_task(scan, module.as_str(), module.queue(), module.as_str(), payload)
                    .await?,
            );
        }
        Ok(tasks)
    }

    pub async fn schedule_httpx(&self, scan: &ScanId, targets: &[String]) -> Result<Vec<Task>> {
        let module = ModuleName::Httpx;
        let shards = distribute(targets, self.worker_count(module).await);

        let mut tasks = Vec::with_capacity(shards.len());
        for shard in shards {
            let payload = serde_json::to_value(HttpxPayload {
                scan: scan.clone(),
                targets: shard,
            })?;
            tasks.push(
                self.create_task(scan, module.as_str(), module.queue(), module.as_str(), payload)
                    .await?,
            );
        }
        Ok(tasks)
    }

    pub async fn schedule_nuclei(
        &self,
        scan: &ScanId,
        targets: &[String],
        template_types: &[String],
    ) -> Result<Vec<Task>> {
        let module = ModuleName::Nuclei;
        let shards = distribute(targets, self.worker_count(module).await);

        let mut tasks = Vec::with_capacity(shards.len());
        for shard in shards {
            let payload = serde_json::to_value(NucleiPayload {
                scan: scan.clone(),
                targets: shard,
                template_types: template_types.to_vec(),
            })?;
            tasks.push(
                self.create_task(scan, module.as_str(), module.queue(), module.as_str(), payload)
                    .await?,
            );
        }
        Ok(tasks)
    }

    /// Plan the job that later runs `module`'s fan-out over the results of
    /// `task`. The caller persists it together with `task`'s completion and
    /// then calls [`Scheduler::dispatch`].
    pub fn plan_internal(
        &self,
        module: ModuleName,
        scan: &ScanId,
        task: &TaskId,
        previous_module: ModuleName,
        template_types: &[String],
    ) -> Result<PlannedTask> {
        let payload = serde_json::to_value(SchedulePayload {
            scan: scan.clone(),
            task: task.clone(),
            previous_module,
            module,
            template_types: template_types.to_vec(),
        })?;
        Ok(Self::plan(
            scan,
            SCHEDULER_MODULE,
            SCHEDULER_QUEUE,
            &module.schedule_job_type(),
            payload,
        ))
    }
}
