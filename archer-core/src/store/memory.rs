use std::collections::HashMap;

use archer_model::{Scan, ScanId, ScanStatus, Task, TaskId, TaskStatus, WorkerId};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::ScanStore;
use crate::error::{ArcherError, Result};

#[derive(Debug, Default)]
struct State {
    scans: HashMap<ScanId, Scan>,
    tasks: HashMap<TaskId, Task>,
    /// Insertion order of tasks, for stable listing.
    task_order: Vec<TaskId>,
}

impl State {
    fn live_task(&mut self, id: &TaskId) -> Result<&mut Task> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| ArcherError::not_found("task", id))?;
        if task.status.is_terminal() {
            return Err(ArcherError::AlreadyTerminal {
                task: task.id.clone(),
                status: task.status,
            });
        }
        Ok(task)
    }
}

/// Scan store guarded by one lock, which serializes every transition.
#[derive(Debug, Default)]
pub struct InMemoryScanStore {
    state: Mutex<State>,
}

impl InMemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanStore for InMemoryScanStore {
    async fn insert_scan(&self, scan: &Scan) -> Result<()> {
        let mut state = self.state.lock();
        if state.scans.contains_key(&scan.id) {
            return Err(ArcherError::Internal(format!("scan {} already exists", scan.id)));
        }
        state.scans.insert(scan.id.clone(), scan.clone());
        Ok(())
    }

    async fn scan(&self, id: &ScanId) -> Result<Scan> {
        self.state
            .lock()
            .scans
            .get(id)
            .cloned()
            .ok_or_else(|| ArcherError::not_found("scan", id))
    }

    async fn scans(&self) -> Result<Vec<Scan>> {
        let mut scans: Vec<Scan> = self.state.lock().scans.values().cloned().collect();
        scans.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(scans)
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.lock();
        if !state.scans.contains_key(&task.scan_id) {
            return Err(ArcherError::not_found("scan", &task.scan_id));
        }
        if state.tasks.contains_key(&task.id) {
            return Err(ArcherError::Internal(format!("task {} already exists", task.id)));
        }
        state.task_order.push(task.id.clone());
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn task(&self, id: &TaskId) -> Result<Task> {
        self.state
            .lock()
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| ArcherError::not_found("task", id))
    }

    async fn tasks(&self, scan: &ScanId) -> Result<Vec<Task>> {
        let state = self.state.lock();
        Ok(state
            .task_order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|task| &task.scan_id == scan)
            .cloned()
            .collect())
    }

    async fn start_task(&self, id: &TaskId, worker: &WorkerId) -> Result<Task> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let task = state.live_task(id)?;
        task.status = TaskStatus::Active;
        task.worker_id = Some(worker.clone());
        task.started_at.get_or_insert(now);
        task.updated_at = now;
        let task = task.clone();

        if let Some(scan) = state
            .scans
            .get_mut(&task.scan_id)
            .filter(|scan| scan.status == ScanStatus::Pending)
        {
            scan.status = ScanStatus::Active;
            scan.started_at.get_or_insert(now);
            scan.updated_at = now;
        }
        Ok(task)
    }

    async fn complete_task(
        &self,
        id: &TaskId,
        worker: &WorkerId,
        results: i64,
        follow_ups: &[Task],
    ) -> Result<Task> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let scan_id = state.live_task(id)?.scan_id.clone();
        for follow_up in follow_ups {
            if follow_up.scan_id != scan_id {
                return Err(ArcherError::Internal(format!(
                    "follow-up {} belongs to scan {}, not {scan_id}",
                    follow_up.id, follow_up.scan_id
                )));
            }
            if state.tasks.contains_key(&follow_up.id) {
                return Err(ArcherError::Internal(format!(
                    "task {} already exists",
                    follow_up.id
                )));
            }
        }

        let task = state.live_task(id)?;
        task.status = TaskStatus::Completed;
        task.results = Some(results);
        task.worker_id.get_or_insert_with(|| worker.clone());
        task.completed_at = Some(now);
        task.updated_at = now;
        let task = task.clone();

        for follow_up in follow_ups {
            state.task_order.push(follow_up.id.clone());
            state.tasks.insert(follow_up.id.clone(), follow_up.clone());
        }
        Ok(task)
    }

    async fn abandon_task(&self, id: &TaskId) -> Result<Task> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let task = state.live_task(id)?;
        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn fail_task(&self, id: &TaskId, worker: &WorkerId) -> Result<Task> {
        let now = Utc::now();
        let mut state = self.state.lock();
        if let Some(task) = state
            .tasks
            .get(id)
            .filter(|task| task.status == TaskStatus::Failed)
        {
            return Ok(task.clone());
        }
        let task = state.live_task(id)?;
        task.status = TaskStatus::Failed;
        task.worker_id.get_or_insert_with(|| worker.clone());
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn try_complete_scan(&self, id: &ScanId) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let outstanding = state
            .tasks
            .values()
            .any(|task| &task.scan_id == id && !task.status.is_terminal());
        let scan = state
            .scans
            .get_mut(id)
            .ok_or_else(|| ArcherError::not_found("scan", id))?;
        if outstanding || scan.status == ScanStatus::Completed {
            return Ok(false);
        }
        scan.status = ScanStatus::Completed;
        scan.completed_at = Some(now);
        scan.updated_at = now;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(id: &str) -> Scan {
        let now = Utc::now();
        Scan {
            id: ScanId::from_raw(id),
            modules: vec![archer_model::ModuleName::Masscan],
            targets: vec!["10.0.0.1".into()],
            ports: vec![80],
            nuclei_types: Vec::new(),
            arguments: None,
            status: ScanStatus::Pending,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn task(id: &str, scan: &ScanId) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::from_raw(id),
            scan_id: scan.clone(),
            module: "masscan".into(),
            payload: None,
            results: None,
            status: TaskStatus::Pending,
            worker_id: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn rejected_follow_up_leaves_the_task_live() {
        let store = InMemoryScanStore::new();
        let ours = scan("scan00000001");
        let theirs = scan("scan00000002");
        store.insert_scan(&ours).await.unwrap();
        store.insert_scan(&theirs).await.unwrap();
        let live = task("task00000001", &ours.id);
        store.insert_task(&live).await.unwrap();
        let worker = WorkerId::from_raw("w1");

        let foreign = task("task00000002", &theirs.id);
        let err = store
            .complete_task(&live.id, &worker, 3, &[foreign])
            .await
            .unwrap_err();
        assert!(matches!(err, ArcherError::Internal(_)));
        assert_eq!(store.task(&live.id).await.unwrap().status, TaskStatus::Pending);
        assert!(store.tasks(&theirs.id).await.unwrap().is_empty());

        let follow_up = task("task00000003", &ours.id);
        store
            .complete_task(&live.id, &worker, 3, &[follow_up.clone()])
            .await
            .unwrap();
        assert!(!store.try_complete_scan(&ours.id).await.unwrap());

        store.abandon_task(&follow_up.id).await.unwrap();
        assert!(store.try_complete_scan(&ours.id).await.unwrap());
    }
}
