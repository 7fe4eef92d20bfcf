//! Scan and task state machine driven by the coordinator.
//!
//! Tasks move pending -> active -> completed | failed. A completed module
//! task with results advances the pipeline: its scheduling tasks are stored
//! in the same transaction as the completion and queued afterwards. Every
//! other terminal transition attempts scan completion, which succeeds only
//! for the call that observes no pending or active task left.

use std::collections::HashSet;
use std::sync::Arc;

use archer_contracts::NewScanRequest;
use archer_model::{
    ModuleName, SCHEDULER_MODULE, Scan, ScanId, ScanStatus, Task, TaskId, WorkerId,
    requested_next_stages,
};
use chrono::Utc;
use tracing::{info, warn};

use crate::error::{ArcherError, FieldError, Result};
use crate::scheduler::{PlannedTask, Scheduler};
use crate::store::ScanStore;

#[derive(Debug, Clone)]
pub struct ScanService {
    store: Arc<dyn ScanStore>,
    scheduler: Arc<Scheduler>,
}

fn duplicates<T: std::hash::Hash + Eq>(values: &[T]) -> bool {
    let mut seen = HashSet::with_capacity(values.len());
    !values.iter().all(|value| seen.insert(value))
}

/// Check a scan request and resolve its module names.
pub fn validate_new_scan(request: &NewScanRequest) -> Result<Vec<ModuleName>> {
    let mut errors = Vec::new();

    if request.targets.is_empty() {
        errors.push(FieldError::new("targets", "targets is required"));
    } else if request.targets.iter().any(|t| t.trim().is_empty()) {
        errors.push(FieldError::new("targets", "targets must not contain blank values"));
    } else if duplicates(&request.targets) {
        errors.push(FieldError::new("targets", "targets must contain unique values"));
    }

    if request.ports.is_empty() {
        errors.push(FieldError::new("ports", "ports is required"));
    } else if request.ports.contains(&0) {
        errors.push(FieldError::new("ports", "ports must be between 1 and 65535"));
    } else if duplicates(&request.ports) {
        errors.push(FieldError::new("ports", "ports must contain unique values"));
    }

    let mut modules = Vec::with_capacity(request.modules.len());
    if request.modules.is_empty() {
        errors.push(FieldError::new("modules", "modules is required"));
    } else if duplicates(&request.modules) {
        errors.push(FieldError::new("modules", "modules must contain unique values"));
    } else {
        for name in &request.modules {
            match name.parse::<ModuleName>() {
                Ok(module) => modules.push(module),
                Err(_) => errors.push(FieldError::new(
                    "modules",
                    format!("Value '{name}' is not a valid module"),
                )),
            }
        }
    }

    if let Some(types) = &request.nuclei_types
        && duplicates(types)
    {
        errors.push(FieldError::new(
            "nuclei_types",
            "nuclei_types must contain unique values",
        ));
    }

    if errors.is_empty() {
        Ok(modules)
    } else {
        Err(ArcherError::Validation(errors))
    }
}

impl ScanService {
    pub fn new(store: Arc<dyn ScanStore>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    pub fn store(&self) -> &Arc<dyn ScanStore> {
        &self.store
    }

    /// Persist a new scan and schedule its first stage.
    pub async fn create_scan(&self, request: NewScanRequest) -> Result<Scan> {
        let modules = validate_new_scan(&request)?;
        let now = Utc::now();
        let scan = Scan {
            id: ScanId::generate(),
            modules,
            targets: request.targets,
            ports: request.ports,
            nuclei_types: request.nuclei_types.unwrap_or_default(),
            arguments: request.arguments.filter(|args| !args.trim().is_empty()),
            status: ScanStatus::Pending,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_scan(&scan).await?;

        let stage = scan.first_stage();
        let tasks = match stage {
            ModuleName::Masscan => {
                self.scheduler
                    .schedule_masscan(&scan.id, &scan.targets, &scan.ports)
                    .await?
            }
            ModuleName::Httpx => {
                self.scheduler
                    .schedule_httpx(&scan.id, &scan.service_targets())
                    .await?
            }
            ModuleName::Nuclei => {
                self.scheduler
                    .schedule_nuclei(&scan.id, &scan.service_targets(), &scan.nuclei_types)
                    .await?
            }
        };
        info!(scan = %scan.id, first_stage = %stage, tasks = tasks.len(), "created scan");
        Ok(scan)
    }

    pub async fn scans(&self) -> Result<Vec<Scan>> {
        self.store.scans().await
    }

    pub async fn scan(&self, id: &ScanId) -> Result<Scan> {
        self.store.scan(id).await
    }

    pub async fn scan_tasks(&self, id: &ScanId) -> Result<Vec<Task>> {
        self.store.scan(id).await?;
        self.store.tasks(id).await
    }

    pub async fn task(&self, id: &TaskId) -> Result<Task> {
        self.store.task(id).await
    }

    /// Replays of the start signal are accepted.
    pub async fn task_started(&self, id: &TaskId, worker: &WorkerId) -> Result<Task> {
        let task = self.store.start_task(id, worker).await?;
        info!(task = %id, scan = %task.scan_id, worker = %worker, "task started");
        Ok(task)
    }

    pub async fn task_completed(
        &self,
        id: &TaskId,
        worker: &WorkerId,
        results: i64,
    ) -> Result<Task> {
        if results < 0 {
            return Err(ArcherError::validation(
                "results",
                "results must not be negative",
            ));
        }
        let follow_ups = if results > 0 {
            self.plan_follow_ups(id).await?
        } else {
            Vec::new()
        };
        let rows: Vec<Task> = follow_ups.iter().map(|planned| planned.task.clone()).collect();
        let task = self.store.complete_task(id, worker, results, &rows).await?;
        info!(task = %id, scan = %task.scan_id, worker = %worker, results, "task completed");

        if follow_ups.is_empty() {
            self.complete_scan(&task.scan_id).await?;
        }
        for planned in &follow_ups {
            // A failed dispatch fails the follow-up, so the completion stands.
            if let Err(err) = self.scheduler.dispatch(planned).await {
                warn!(
                    scan = %task.scan_id,
                    task = %id,
                    error = %err,
                    "could not advance pipeline"
                );
                continue;
            }
            info!(
                scan = %task.scan_id,
                from = %task.module,
                to = %planned.job_type,
                "advancing pipeline"
            );
        }
        Ok(task)
    }

    /// A failed task never fans out.
    pub async fn task_failed(&self, id: &TaskId, worker: &WorkerId) -> Result<Task> {
        let task = self.store.fail_task(id, worker).await?;
        warn!(task = %id, scan = %task.scan_id, worker = %worker, "task failed");
        self.complete_scan(&task.scan_id).await?;
        Ok(task)
    }

    /// One scheduling task per requested module that follows the task's
    /// module. Scheduling tasks themselves never fan out.
    async fn plan_follow_ups(&self, id: &TaskId) -> Result<Vec<PlannedTask>> {
        let task = self.store.task(id).await?;
        if task.status.is_terminal() {
            return Err(ArcherError::AlreadyTerminal {
                task: task.id,
                status: task.status,
            });
        }
        if task.module == SCHEDULER_MODULE {
            return Ok(Vec::new());
        }
        let previous = task.module.parse::<ModuleName>()?;
        let scan = self.store.scan(&task.scan_id).await?;
        requested_next_stages(previous, &scan.modules)
            .into_iter()
            .map(|module| {
                self.scheduler
                    .plan_internal(module, &scan.id, &task.id, previous, &scan.nuclei_types)
            })
            .collect()
    }

    async fn complete_scan(&self, scan: &ScanId) -> Result<()> {
        if self.store.try_complete_scan(scan).await? {
            info!(scan = %scan, "scan completed");
        }
        Ok(())
    }
}
