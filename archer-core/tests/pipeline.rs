//! masscan results flow through the scheduler into an httpx task, and the
//! scan only completes once the last stage reports.

use std::sync::Arc;
use std::time::Duration;

use archer_config::{BulkConfig, HttpxConfig, MasscanConfig, QueueConfig};
use archer_contracts::NewScanRequest;
use archer_core::queue::{InMemoryJobQueue, InMemoryWorkerRegistry, JobQueue};
use archer_core::search::{BulkIndexer, InMemorySearchIndex, document_id};
use archer_core::store::{InMemoryScanStore, ScanStore};
use archer_core::{
    HttpxModule, InProcessNotifier, MasscanModule, Mux, ScanModule, ScanService, Scheduler,
    TaskContext, TaskHandler,
};
use archer_model::{ScanStatus, TaskStatus, WorkerId};
use tokio_util::sync::CancellationToken;

struct Pipeline {
    store: Arc<InMemoryScanStore>,
    queue: Arc<InMemoryJobQueue>,
    index: Arc<InMemorySearchIndex>,
    scheduler: Arc<Scheduler>,
    service: Arc<ScanService>,
}

fn pipeline() -> Pipeline {
    let store = Arc::new(InMemoryScanStore::new());
    let queue = Arc::new(InMemoryJobQueue::new());
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        queue.clone(),
        Arc::new(InMemoryWorkerRegistry::new()),
        QueueConfig::default(),
    ));
    let service = Arc::new(ScanService::new(store.clone(), scheduler.clone()));
    Pipeline {
        store,
        queue,
        index: Arc::new(InMemorySearchIndex::new()),
        scheduler,
        service,
    }
}

fn bulk() -> BulkConfig {
    BulkConfig {
        flush_interval: Duration::from_millis(20),
        ..BulkConfig::default()
    }
}

#[tokio::test]
async fn masscan_findings_feed_httpx() {
    let p = pipeline();
    let scan = p
        .service
        .create_scan(NewScanRequest {
            targets: vec!["10.0.0.0/30".into()],
            ports: vec![80, 443],
            modules: vec!["masscan".into(), "httpx".into()],
            ..NewScanRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(scan.status, ScanStatus::Pending);

    // A masscan worker picks up the first stage and reports two open ports.
    let scanner = WorkerId::from_raw("masscan-1");
    let lease = p
        .queue
        .dequeue(&["masscan".to_string()], &scanner)
        .await
        .unwrap()
        .expect("masscan job queued");
    p.service.task_started(&lease.job_id, &scanner).await.unwrap();

    let masscan = MasscanModule::new(MasscanConfig::default());
    let ctx = TaskContext::new(
        scanner.clone(),
        lease.job_type.as_str(),
        "masscan",
        scan.id.clone(),
        lease.job_id.clone(),
        lease.queue.as_str(),
        lease.retry,
        lease.max_retry,
        CancellationToken::new(),
    );
    let indexer = BulkIndexer::new(p.index.clone(), &bulk());
    for line in [
        "Discovered open port 80/tcp on 10.0.0.1",
        "Discovered open port 443/tcp on 10.0.0.2",
    ] {
        let item = masscan.process_stdout(&ctx, line).expect("line parses");
        indexer.add(item).await.unwrap();
    }
    let summary = indexer.close().await.unwrap();
    assert_eq!(summary.indexed, 2);
    assert!(p.index.document(&document_id("10.0.0.1", &scan.id)).is_some());

    p.service
        .task_completed(&lease.job_id, &scanner, 2)
        .await
        .unwrap();
    p.queue.complete(&lease, b"2".to_vec()).await.unwrap();
    assert_eq!(p.service.scan(&scan.id).await.unwrap().status, ScanStatus::Active);

    // The scheduler process turns the findings into an httpx task.
    let planner = WorkerId::from_raw("scheduler-1");
    let mux: Mux = Mux::new();
    mux.register(
        "httpx",
        Arc::new(HttpxModule::new(HttpxConfig::default(), p.index.clone())),
    )
    .unwrap();
    let handler = TaskHandler::new(
        planner.clone(),
        Arc::new(mux),
        Arc::new(InProcessNotifier::new(p.service.clone(), planner.clone())),
        p.index.clone(),
        bulk(),
    )
    .with_scheduler(p.scheduler.clone());

    let lease = p
        .queue
        .dequeue(&["scheduler".to_string()], &planner)
        .await
        .unwrap()
        .expect("schedule job queued");
    assert_eq!(lease.job_type, "httpx:schedule");
    let result = handler.handle(&lease, CancellationToken::new()).await.unwrap();
    assert_eq!(result, b"1");
    p.queue.complete(&lease, result).await.unwrap();

    let scheduling = p.store.task(&lease.job_id).await.unwrap();
    assert_eq!(scheduling.status, TaskStatus::Completed);
    assert_eq!(scheduling.results, Some(1));
    assert_eq!(p.service.scan(&scan.id).await.unwrap().status, ScanStatus::Active);

    let prober = WorkerId::from_raw("httpx-1");
    let lease = p
        .queue
        .dequeue(&["httpx".to_string()], &prober)
        .await
        .unwrap()
        .expect("httpx job queued");
    let mut targets: Vec<String> = lease.payload["targets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|target| target.as_str().unwrap().to_string())
        .collect();
    targets.sort();
    assert_eq!(targets, vec!["10.0.0.1:80", "10.0.0.2:443"]);

    p.service.task_started(&lease.job_id, &prober).await.unwrap();
    p.service
        .task_completed(&lease.job_id, &prober, 2)
        .await
        .unwrap();

    let finished = p.service.scan(&scan.id).await.unwrap();
    assert_eq!(finished.status, ScanStatus::Completed);
    assert!(finished.completed_at.is_some());

    let tasks = p.service.scan_tasks(&scan.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|task| task.status == TaskStatus::Completed));
}

#[tokio::test]
async fn failed_first_stage_still_completes_the_scan() {
    let p = pipeline();
    let scan = p
        .service
        .create_scan(NewScanRequest {
            targets: vec!["10.0.0.1".into()],
            ports: vec![22],
            modules: vec!["masscan".into(), "httpx".into()],
            ..NewScanRequest::default()
        })
        .await
        .unwrap();

    let worker = WorkerId::from_raw("masscan-1");
    let lease = p
        .queue
        .dequeue(&["masscan".to_string()], &worker)
        .await
        .unwrap()
        .unwrap();
    p.service.task_started(&lease.job_id, &worker).await.unwrap();
    let failed = p.service.task_failed(&lease.job_id, &worker).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);

    assert_eq!(
        p.service.scan(&scan.id).await.unwrap().status,
        ScanStatus::Completed
    );
    let idle = p
        .queue
        .dequeue(&["scheduler".to_string()], &worker)
        .await
        .unwrap();
    assert!(idle.is_none());
}
