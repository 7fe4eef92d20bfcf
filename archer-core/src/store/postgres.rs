use archer_model::{
    ModuleName, Scan, ScanId, ScanStatus, Task, TaskId, TaskStatus, WorkerId,
};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use super::ScanStore;
use crate::error::{ArcherError, Result};

const SCAN_COLUMNS: &str = "id, modules, targets, ports, nuclei_types, arguments, status, \
     started_at, completed_at, created_at, updated_at";
const TASK_COLUMNS: &str = "id, scan_id, module, payload, results, status, worker_id, \
     started_at, completed_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresScanStore {
    pool: PgPool,
}

impl PostgresScanStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock the task row and reject terminal tasks.
    async fn lock_live_task(
        tx: &mut Transaction<'_, Postgres>,
        id: &TaskId,
    ) -> Result<Task> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| ArcherError::not_found("task", id))?;
        let task = task_from_row(&row)?;
        if task.status.is_terminal() {
            return Err(ArcherError::AlreadyTerminal {
                task: task.id,
                status: task.status,
            });
        }
        Ok(task)
    }

    async fn insert_task_row<'e, E>(executor: E, task: &Task) -> Result<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, scan_id, module, payload, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(task.id.as_str())
        .bind(task.scan_id.as_str())
        .bind(&task.module)
        .bind(&task.payload)
        .bind(task.status.as_str())
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }
}

fn scan_from_row(row: &PgRow) -> Result<Scan> {
    let modules: Vec<String> = row.try_get("modules")?;
    let ports: Vec<i32> = row.try_get("ports")?;
    let status: String = row.try_get("status")?;
    Ok(Scan {
        id: ScanId::from_raw(row.try_get::<String, _>("id")?),
        modules: modules
            .iter()
            .map(|m| m.parse::<ModuleName>())
            .collect::<std::result::Result<_, _>>()?,
        targets: row.try_get("targets")?,
        ports: ports
            .into_iter()
            .map(|p| {
                u16::try_from(p)
                    .map_err(|_| ArcherError::Internal(format!("stored port {p} out of range")))
            })
            .collect::<Result<_>>()?,
        nuclei_types: row.try_get("nuclei_types")?,
        arguments: row.try_get("arguments")?,
        status: status.parse::<ScanStatus>()?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    let worker: Option<String> = row.try_get("worker_id")?;
    Ok(Task {
        id: TaskId::from_raw(row.try_get::<String, _>("id")?),
        scan_id: ScanId::from_raw(row.try_get::<String, _>("scan_id")?),
        module: row.try_get("module")?,
        payload: row.try_get("payload")?,
        results: row.try_get("results")?,
        status: status.parse::<TaskStatus>()?,
        worker_id: worker.map(WorkerId::from_raw),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ScanStore for PostgresScanStore {
    async fn insert_scan(&self, scan: &Scan) -> Result<()> {
        let modules: Vec<&str> = scan.modules.iter().map(ModuleName::as_str).collect();
        let ports: Vec<i32> = scan.ports.iter().map(|p| i32::from(*p)).collect();
        sqlx::query(
            r#"
            INSERT INTO scans (id, modules, targets, ports, nuclei_types, arguments, status,
                               created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(scan.id.as_str())
        .bind(&modules)
        .bind(&scan.targets)
        .bind(&ports)
        .bind(&scan.nuclei_types)
        .bind(&scan.arguments)
        .bind(scan.status.as_str())
        .bind(scan.created_at)
        .bind(scan.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn scan(&self, id: &ScanId) -> Result<Scan> {
        let row = sqlx::query(&format!("SELECT {SCAN_COLUMNS} FROM scans WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ArcherError::not_found("scan", id))?;
        scan_from_row(&row)
    }

    async fn scans(&self) -> Result<Vec<Scan>> {
        sqlx::query(&format!(
            "SELECT {SCAN_COLUMNS} FROM scans ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(scan_from_row)
        .collect()
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        Self::insert_task_row(&self.pool, task).await
    }

    async fn task(&self, id: &TaskId) -> Result<Task> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ArcherError::not_found("task", id))?;
        task_from_row(&row)
    }

    async fn tasks(&self, scan: &ScanId) -> Result<Vec<Task>> {
        sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE scan_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(scan.as_str())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(task_from_row)
        .collect()
    }

    async fn start_task(&self, id: &TaskId, worker: &WorkerId) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        let task = Self::lock_live_task(&mut tx, id).await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET status = 'active',
                worker_id = $2,
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .bind(worker.as_str())
        .fetch_one(&mut *tx)
        .await?;

        let promoted = sqlx::query(
            r#"
            UPDATE scans
            SET status = 'active',
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(task.scan_id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        if promoted.rows_affected() > 0 {
            info!(scan = %task.scan_id, "scan is active");
        }
        task_from_row(&row)
    }

    async fn complete_task(
        &self,
        id: &TaskId,
        worker: &WorkerId,
        results: i64,
        follow_ups: &[Task],
    ) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        let task = Self::lock_live_task(&mut tx, id).await?;
        // Held until commit so try_complete_scan sees the follow-ups.
        sqlx::query("SELECT id FROM scans WHERE id = $1 FOR UPDATE")
            .bind(task.scan_id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET status = 'completed',
                results = $2,
                worker_id = COALESCE(worker_id, $3),
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .bind(results)
        .bind(worker.as_str())
        .fetch_one(&mut *tx)
        .await?;

        for follow_up in follow_ups {
            if follow_up.scan_id != task.scan_id {
                return Err(ArcherError::Internal(format!(
                    "follow-up {} belongs to scan {}, not {}",
                    follow_up.id, follow_up.scan_id, task.scan_id
                )));
            }
            Self::insert_task_row(&mut *tx, follow_up).await?;
        }

        tx.commit().await?;
        task_from_row(&row)
    }

    async fn abandon_task(&self, id: &TaskId) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        Self::lock_live_task(&mut tx, id).await?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET status = 'failed',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        task_from_row(&row)
    }

    async fn fail_task(&self, id: &TaskId, worker: &WorkerId) -> Result<Task> {
        let mut tx = self.pool.begin().await?;
        match Self::lock_live_task(&mut tx, id).await {
            Ok(_) => {}
            Err(ArcherError::AlreadyTerminal {
                status: TaskStatus::Failed,
                ..
            }) => {
                drop(tx);
                return self.task(id).await;
            }
            Err(err) => return Err(err),
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks
            SET status = 'failed',
                worker_id = COALESCE(worker_id, $2),
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(id.as_str())
        .bind(worker.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        task_from_row(&row)
    }

    async fn try_complete_scan(&self, id: &ScanId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let status: String =
            sqlx::query_scalar("SELECT status FROM scans WHERE id = $1 FOR UPDATE")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| ArcherError::not_found("scan", id))?;
        if status == ScanStatus::Completed.as_str() {
            return Ok(false);
        }

        let open: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM tasks
                WHERE scan_id = $1 AND status IN ('pending', 'active')
            )
            "#,
        )
        .bind(id.as_str())
        .fetch_one(&mut *tx)
        .await?;
        if open {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE scans
            SET status = 'completed',
                completed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scan(id: &str) -> Scan {
        let now = Utc::now();
        Scan {
            id: ScanId::from_raw(id),
            modules: vec![ModuleName::Masscan, ModuleName::Httpx],
            targets: vec!["10.0.0.0/30".into()],
            ports: vec![80, 443],
            nuclei_types: vec!["http".into()],
            arguments: None,
            status: ScanStatus::Pending,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn task(id: &str, scan: &Scan) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::from_raw(id),
            scan_id: scan.id.clone(),
            module: "masscan".into(),
            payload: Some(serde_json::json!({"targets": ["10.0.0.1"]})),
            results: None,
            status: TaskStatus::Pending,
            worker_id: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn scans_round_trip_through_rows(pool: PgPool) {
        let store = PostgresScanStore::new(pool);
        let scan = scan("scan00000001");
        store.insert_scan(&scan).await.unwrap();

        let fetched = store.scan(&scan.id).await.unwrap();
        assert_eq!(fetched.modules, scan.modules);
        assert_eq!(fetched.ports, vec![80, 443]);
        assert_eq!(fetched.nuclei_types, vec!["http"]);
        assert_eq!(fetched.status, ScanStatus::Pending);
        assert_eq!(store.scans().await.unwrap().len(), 1);

        let missing = store.scan(&ScanId::from_raw("nope00000000")).await;
        assert!(matches!(missing, Err(ArcherError::NotFound { .. })));
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn task_transitions_drive_the_scan(pool: PgPool) {
        let store = PostgresScanStore::new(pool);
        let scan = scan("scan00000002");
        store.insert_scan(&scan).await.unwrap();
        let task = task("task00000001", &scan);
        store.insert_task(&task).await.unwrap();
        let worker = WorkerId::from_raw("w1");

        let started = store.start_task(&task.id, &worker).await.unwrap();
        assert_eq!(started.status, TaskStatus::Active);
        assert_eq!(
            store.scan(&scan.id).await.unwrap().status,
            ScanStatus::Active
        );
        assert!(!store.try_complete_scan(&scan.id).await.unwrap());

        let done = store.complete_task(&task.id, &worker, 7, &[]).await.unwrap();
        assert_eq!(done.results, Some(7));
        assert!(matches!(
            store.complete_task(&task.id, &worker, 1, &[]).await,
            Err(ArcherError::AlreadyTerminal {
                status: TaskStatus::Completed,
                ..
            })
        ));

        assert!(store.try_complete_scan(&scan.id).await.unwrap());
        assert!(!store.try_complete_scan(&scan.id).await.unwrap());
        let finished = store.scan(&scan.id).await.unwrap();
        assert_eq!(finished.status, ScanStatus::Completed);
        assert!(finished.completed_at.is_some());
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn follow_ups_keep_the_scan_open(pool: PgPool) {
        let store = PostgresScanStore::new(pool);
        let scan = scan("scan00000004");
        store.insert_scan(&scan).await.unwrap();
        let first = task("task00000003", &scan);
        let second = task("task00000004", &scan);
        store.insert_task(&first).await.unwrap();
        store.insert_task(&second).await.unwrap();
        let worker = WorkerId::from_raw("w1");
        store.start_task(&first.id, &worker).await.unwrap();
        store.start_task(&second.id, &worker).await.unwrap();

        let mut follow_up = task("task00000005", &scan);
        follow_up.module = "scheduler".into();
        store
            .complete_task(&first.id, &worker, 5, &[follow_up.clone()])
            .await
            .unwrap();
        store.complete_task(&second.id, &worker, 0, &[]).await.unwrap();

        assert!(!store.try_complete_scan(&scan.id).await.unwrap());
        assert_eq!(
            store.task(&follow_up.id).await.unwrap().status,
            TaskStatus::Pending
        );

        let abandoned = store.abandon_task(&follow_up.id).await.unwrap();
        assert_eq!(abandoned.status, TaskStatus::Failed);
        assert!(abandoned.worker_id.is_none());
        assert!(store.try_complete_scan(&scan.id).await.unwrap());
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn failing_twice_is_idempotent(pool: PgPool) {
        let store = PostgresScanStore::new(pool);
        let scan = scan("scan00000003");
        store.insert_scan(&scan).await.unwrap();
        let task = task("task00000002", &scan);
        store.insert_task(&task).await.unwrap();
        let worker = WorkerId::from_raw("w1");

        assert_eq!(
            store.fail_task(&task.id, &worker).await.unwrap().status,
            TaskStatus::Failed
        );
        assert_eq!(
            store.fail_task(&task.id, &worker).await.unwrap().status,
            TaskStatus::Failed
        );
        let tasks = store.tasks(&scan.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].worker_id.as_ref().map(|w| w.as_str()), Some("w1"));
    }
}
