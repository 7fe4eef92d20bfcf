//! Runs one leased job end to end.

use std::fmt;
use std::sync::Arc;

use archer_config::BulkConfig;
use archer_model::{ScanId, WorkerId};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, warn};

use crate::context::TaskContext;
use crate::coordinator::LifecycleNotifier;
use crate::error::{ArcherError, Result};
use crate::modules::{ScanModule, SchedulePayload};
use crate::mux::Mux;
use crate::queue::JobLease;
use crate::scheduler::Scheduler;
use crate::search::{BulkIndexer, SearchIndex};

/// Suffix of internal job types that advance the pipeline.
const SCHEDULE_SUFFIX: &str = ":schedule";

pub struct TaskHandler {
    worker: WorkerId,
    mux: Arc<Mux>,
    notifier: Arc<dyn LifecycleNotifier>,
    index: Arc<dyn SearchIndex>,
    bulk: BulkConfig,
    scheduler: Option<Arc<Scheduler>>,
}

impl fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandler")
            .field("worker", &self.worker)
            .field("mux", &self.mux)
            .field("schedules", &self.scheduler.is_some())
            .finish_non_exhaustive()
    }
}

fn scan_of(payload: &Value) -> Result<ScanId> {
    payload
        .get("scan")
        .and_then(Value::as_str)
        .filter(|scan| !scan.trim().is_empty())
        .map(ScanId::from_raw)
        .ok_or_else(|| ArcherError::validation("scan", "payload carries no scan id"))
}

impl TaskHandler {
    pub fn new(
        worker: WorkerId,
        mux: Arc<Mux>,
        notifier: Arc<dyn LifecycleNotifier>,
        index: Arc<dyn SearchIndex>,
        bulk: BulkConfig,
    ) -> Self {
        Self {
            worker,
            mux,
            notifier,
            index,
            bulk,
            scheduler: None,
        }
    }

    /// Let this handler run internal scheduling jobs.
    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn notifier(&self) -> &Arc<dyn LifecycleNotifier> {
        &self.notifier
    }

    /// Run `lease` and return the job result: the decimal result count.
    pub async fn handle(&self, lease: &JobLease, cancel: CancellationToken) -> Result<Vec<u8>> {
        let (module, pattern) = self.mux.resolve(&lease.job_type)?;
        let ctx = TaskContext::new(
            self.worker.clone(),
            lease.job_type.as_str(),
            module.name(),
            scan_of(&lease.payload)?,
            lease.job_id.clone(),
            lease.queue.as_str(),
            lease.retry,
            lease.max_retry,
            cancel,
        );
        let span = ctx.span.clone();

        async move {
            info!(pattern = %pattern, "processing task");
            let count = if lease.job_type.ends_with(SCHEDULE_SUFFIX) {
                self.schedule(module.as_ref(), &ctx, &lease.payload).await?
            } else {
                self.process(module.as_ref(), &ctx, &lease.payload).await?
            };
            info!(results = count, "task finished");
            Ok(count.to_string().into_bytes())
        }
        .instrument(span)
        .await
    }

    async fn schedule(
        &self,
        module: &dyn ScanModule,
        ctx: &TaskContext,
        raw: &Value,
    ) -> Result<u64> {
        let Some(scheduler) = &self.scheduler else {
            return Err(ArcherError::Internal(format!(
                "{} jobs need a scheduler process",
                ctx.job_type
            )));
        };
        let request: SchedulePayload = serde_json::from_value(raw.clone()).map_err(|err| {
            ArcherError::validation("payload", format!("invalid schedule payload: {err}"))
        })?;

        self.notifier.started(&ctx.task_id).await?;
        let created = module.schedule(ctx, &request, scheduler).await?;
        self.notifier
            .completed(&ctx.task_id, to_results(created))
            .await?;
        Ok(created)
    }

    async fn process(
        &self,
        module: &dyn ScanModule,
        ctx: &TaskContext,
        raw: &Value,
    ) -> Result<u64> {
        let payload = module.new_payload(raw)?;
        self.notifier.started(&ctx.task_id).await?;

        let indexer = BulkIndexer::new(Arc::clone(&self.index), &self.bulk);
        let outcome = module.process_task(ctx, &payload, &indexer).await;
        // Partial results are flushed even when the run failed.
        let summary = indexer.close().await?;
        let returned = outcome?;

        if returned != summary.indexed {
            warn!(
                returned,
                indexed = summary.indexed,
                failed = summary.failed,
                "indexed count mismatch"
            );
            return Err(ArcherError::Consistency {
                returned,
                indexed: summary.indexed,
            });
        }
        self.notifier
            .completed(&ctx.task_id, to_results(returned))
            .await?;
        Ok(returned)
    }
}

fn to_results(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::modules::{HttpxPayload, Invocation, ModulePayload};
    use crate::mux::Named;
    use crate::search::{BulkItem, MergeScript};
    use archer_model::{ModuleName, TaskId};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// One call a notifier received.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Notice {
        Started(TaskId),
        Completed(TaskId, i64),
        Failed(TaskId),
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingNotifier {
        pub notices: Mutex<Vec<Notice>>,
    }

    #[async_trait]
    impl LifecycleNotifier for RecordingNotifier {
        async fn started(&self, task: &TaskId) -> Result<()> {
            self.notices.lock().push(Notice::Started(task.clone()));
            Ok(())
        }

        async fn completed(&self, task: &TaskId, results: i64) -> Result<()> {
            self.notices
                .lock()
                .push(Notice::Completed(task.clone(), results));
            Ok(())
        }

        async fn failed(&self, task: &TaskId) -> Result<()> {
            self.notices.lock().push(Notice::Failed(task.clone()));
            Ok(())
        }
    }

    /// Httpx stand-in that indexes `documents` items and reports `reported`,
    /// or fails with a search error when `failure` is set.
    #[derive(Debug, Default)]
    pub(crate) struct StubModule {
        pub documents: u64,
        pub reported: u64,
        pub failure: Option<&'static str>,
    }

    impl Named for StubModule {
        fn name(&self) -> &str {
            "httpx"
        }
    }

    #[async_trait]
    impl ScanModule for StubModule {
        fn module(&self) -> ModuleName {
            ModuleName::Httpx
        }

        fn new_payload(&self, raw: &Value) -> Result<ModulePayload> {
            Ok(ModulePayload::Httpx(serde_json::from_value::<HttpxPayload>(
                raw.clone(),
            )?))
        }

        fn build_invocation(&self, _task: &TaskId, _payload: &ModulePayload) -> Result<Invocation> {
            Ok(Invocation::new("true"))
        }

        async fn process_task(
            &self,
            ctx: &TaskContext,
            _payload: &ModulePayload,
            indexer: &BulkIndexer,
        ) -> Result<u64> {
            if let Some(message) = self.failure {
                return Err(ArcherError::Search(message.to_string()));
            }
            for i in 0..self.documents {
                indexer
                    .add(BulkItem {
                        id: format!("{}-{i}", ctx.task_id),
                        script: MergeScript::Ports,
                        params: json!({
                            "ip": format!("10.0.0.{i}"),
                            "port": {
                                "port": 80,
                                "metadata": {"module": "httpx", "task": ctx.task_id.as_str()},
                            },
                            "scan": ctx.scan_id.as_str(),
                            "timestamp": "2024-01-01T00:00:00.000Z",
                        }),
                    })
                    .await?;
            }
            Ok(self.reported)
        }

        fn process_stdout(&self, _ctx: &TaskContext, _line: &str) -> Option<BulkItem> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Notice, RecordingNotifier, StubModule};
    use super::*;
    use crate::search::InMemorySearchIndex;
    use archer_model::TaskId;
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    fn lease(job_type: &str, payload: Value) -> JobLease {
        JobLease {
            job_id: TaskId::from_raw("task00000001"),
            lease_id: "lease".into(),
            queue: "httpx".into(),
            job_type: job_type.into(),
            payload,
            retry: 0,
            max_retry: 25,
            timeout: Duration::from_secs(60),
            owner: WorkerId::from_raw("w1"),
            expires_at: Utc::now(),
        }
    }

    fn handler(module: StubModule) -> (TaskHandler, Arc<RecordingNotifier>, InMemorySearchIndex) {
        let mux: Mux = Mux::new();
        mux.register("httpx", Arc::new(module)).unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let index = InMemorySearchIndex::new();
        let handler = TaskHandler::new(
            WorkerId::from_raw("w1"),
            Arc::new(mux),
            notifier.clone(),
            Arc::new(index.clone()),
            BulkConfig {
                flush_interval: Duration::from_millis(20),
                ..BulkConfig::default()
            },
        );
        (handler, notifier, index)
    }

    fn payload() -> Value {
        json!({"scan": "scan00000001", "targets": ["10.0.0.1:80"]})
    }

    #[tokio::test]
    async fn completed_count_is_the_job_result() {
        let (handler, notifier, index) = handler(StubModule {
            documents: 3,
            reported: 3,
            ..StubModule::default()
        });
        let result = handler
            .handle(&lease("httpx", payload()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, b"3");
        assert_eq!(index.len(), 3);
        let task = TaskId::from_raw("task00000001");
        assert_eq!(
            *notifier.notices.lock(),
            vec![Notice::Started(task.clone()), Notice::Completed(task, 3)]
        );
    }

    #[tokio::test]
    async fn count_mismatch_is_a_consistency_error() {
        let (handler, notifier, _index) = handler(StubModule {
            documents: 2,
            reported: 3,
            ..StubModule::default()
        });
        let err = handler
            .handle(&lease("httpx", payload()), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ArcherError::Consistency { returned: 3, indexed: 2 }));
        assert!(!err.is_retryable());
        assert_eq!(notifier.notices.lock().len(), 1);
    }

    #[tokio::test]
    async fn unknown_job_types_are_rejected_before_notifying() {
        let (handler, notifier, _index) = handler(StubModule {
            documents: 0,
            reported: 0,
            ..StubModule::default()
        });
        let err = handler
            .handle(&lease("zmap", payload()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArcherError::NoHandlerFound(_)));
        assert!(notifier.notices.lock().is_empty());
    }

    #[tokio::test]
    async fn schedule_jobs_need_a_scheduler() {
        let (handler, notifier, _index) = handler(StubModule {
            documents: 0,
            reported: 0,
            ..StubModule::default()
        });
        let err = handler
            .handle(
                &lease("httpx:schedule", payload()),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArcherError::Internal(_)));
        assert!(notifier.notices.lock().is_empty());
    }

    #[tokio::test]
    async fn payload_without_scan_is_invalid() {
        let (handler, _notifier, _index) = handler(StubModule {
            documents: 0,
            reported: 0,
            ..StubModule::default()
        });
        let err = handler
            .handle(
                &lease("httpx", json!({"targets": []})),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ArcherError::Validation(_)));
    }
}
