//! Worker-side view of the coordinator: the HTTP client workers use to
//! report task transitions, and the notifier seam the task handler calls.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use archer_contracts::{
    CompletedTaskRequest, ErrorResponse, NewScanRequest, USER_AGENT_PREFIX, WORKER_ID_HEADER,
    routes,
};
use archer_model::{Scan, ScanId, Task, TaskId, WorkerId};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{ArcherError, Result};
use crate::lifecycle::ScanService;

/// Reports task transitions on behalf of one worker.
#[async_trait]
pub trait LifecycleNotifier: Send + Sync {
    async fn started(&self, task: &TaskId) -> Result<()>;

    async fn completed(&self, task: &TaskId, results: i64) -> Result<()>;

    async fn failed(&self, task: &TaskId) -> Result<()>;
}

/// HTTP client for the coordinator API.
#[derive(Clone)]
pub struct CoordinatorClient {
    client: Client,
    base_url: String,
    worker: Option<WorkerId>,
}

impl fmt::Debug for CoordinatorClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorClient")
            .field("base_url", &self.base_url)
            .field("worker", &self.worker)
            .finish()
    }
}

/// Add a scheme when missing and drop trailing slashes.
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

impl CoordinatorClient {
    /// Build a client. With a `worker`, every request carries its id.
    pub fn new(base_url: &str, timeout: Duration, worker: Option<WorkerId>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(worker) = &worker {
            let value = HeaderValue::from_str(worker.as_str()).map_err(|err| {
                ArcherError::Internal(format!("worker id '{worker}' is not a valid header: {err}"))
            })?;
            headers.insert(WORKER_ID_HEADER, value);
        }
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("{USER_AGENT_PREFIX}/{}", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            worker,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        let mut request = self.client.request(method.clone(), self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        debug!(%method, path, status = status.as_u16(), "coordinator responded");
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .ok()
            .and_then(|body| body.first_message().map(str::to_string))
            .unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("unexpected response")
                    .to_string()
            });
        Err(ArcherError::Coordinator {
            status: status.as_u16(),
            message,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send::<()>(Method::GET, path, None).await?;
        Ok(response.json().await?)
    }

    pub async fn health(&self) -> Result<()> {
        self.send::<()>(Method::GET, routes::HEALTH, None).await?;
        Ok(())
    }

    pub async fn create_scan(&self, request: &NewScanRequest) -> Result<Scan> {
        let response = self
            .send(Method::POST, routes::SCANS, Some(request))
            .await?;
        Ok(response.json().await?)
    }

    pub async fn scans(&self) -> Result<Vec<Scan>> {
        self.get(routes::SCANS).await
    }

    pub async fn scan(&self, id: &ScanId) -> Result<Scan> {
        self.get(&routes::with_id(routes::SCAN, id.as_str())).await
    }

    pub async fn scan_tasks(&self, id: &ScanId) -> Result<Vec<Task>> {
        self.get(&routes::with_id(routes::SCAN_TASKS, id.as_str()))
            .await
    }

    pub async fn task(&self, id: &TaskId) -> Result<Task> {
        self.get(&routes::with_id(routes::TASK, id.as_str())).await
    }
}

#[async_trait]
impl LifecycleNotifier for CoordinatorClient {
    async fn started(&self, task: &TaskId) -> Result<()> {
        let path = routes::with_id(routes::TASK_STARTED, task.as_str());
        self.send::<()>(Method::POST, &path, None).await?;
        Ok(())
    }

    async fn completed(&self, task: &TaskId, results: i64) -> Result<()> {
        let path = routes::with_id(routes::TASK_COMPLETED, task.as_str());
        self.send(Method::POST, &path, Some(&CompletedTaskRequest { results }))
            .await?;
        Ok(())
    }

    async fn failed(&self, task: &TaskId) -> Result<()> {
        let path = routes::with_id(routes::TASK_FAILED, task.as_str());
        self.send::<()>(Method::POST, &path, None).await?;
        Ok(())
    }
}

/// Notifier that drives the lifecycle directly, for processes that embed
/// the coordinator's state machine.
#[derive(Debug, Clone)]
pub struct InProcessNotifier {
    service: Arc<ScanService>,
    worker: WorkerId,
}

impl InProcessNotifier {
    pub fn new(service: Arc<ScanService>, worker: WorkerId) -> Self {
        Self { service, worker }
    }
}

#[async_trait]
impl LifecycleNotifier for InProcessNotifier {
    async fn started(&self, task: &TaskId) -> Result<()> {
        self.service.task_started(task, &self.worker).await?;
        Ok(())
    }

    async fn completed(&self, task: &TaskId, results: i64) -> Result<()> {
        self.service
            .task_completed(task, &self.worker, results)
            .await?;
        Ok(())
    }

    async fn failed(&self, task: &TaskId) -> Result<()> {
        match self.service.task_failed(task, &self.worker).await {
            Err(ArcherError::AlreadyTerminal { status, .. }) => {
                warn!(task = %task, %status, "task already finished; failure not recorded");
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}
