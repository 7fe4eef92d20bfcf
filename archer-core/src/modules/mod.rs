//! Pluggable scan modules.
//!
//! A module wraps one external tool. Process-driven work goes through
//! [`engine::execute`], which runs the tool and streams its findings into
//! the bulk indexer; stage fan-out goes through [`ScanModule::schedule`].

pub mod engine;
pub mod fanout;
pub mod httpx;
pub mod masscan;
pub mod nuclei;

use archer_model::{ModuleName, ScanId, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::context::TaskContext;
use crate::error::{ArcherError, Result};
use crate::mux::Named;
use crate::scheduler::Scheduler;
use crate::search::{BulkIndexer, BulkItem};

pub use engine::{Artifact, Invocation};
pub use httpx::HttpxModule;
pub use masscan::MasscanModule;
pub use nuclei::NucleiModule;

/// Work item of one masscan task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasscanPayload {
    pub scan: ScanId,
    pub targets: Vec<String>,
    pub ports: Vec<u16>,
    /// `index/total`, so every shard of a scan partitions the same way.
    pub shard: String,
    /// Shared by all shards of a scan.
    pub seed: i64,
}

/// Work item of one httpx task; targets are `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpxPayload {
    pub scan: ScanId,
    pub targets: Vec<String>,
}

/// Work item of one nuclei task; targets are `ip:port` or URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NucleiPayload {
    pub scan: ScanId,
    pub targets: Vec<String>,
    #[serde(default)]
    pub template_types: Vec<String>,
}

/// Payload of the internal job that fans out the next stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulePayload {
    pub scan: ScanId,
    /// Task whose results seed the next stage.
    pub task: TaskId,
    pub previous_module: ModuleName,
    pub module: ModuleName,
    #[serde(default)]
    pub template_types: Vec<String>,
}

/// A decoded module payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModulePayload {
    Masscan(MasscanPayload),
    Httpx(HttpxPayload),
    Nuclei(NucleiPayload),
}

impl ModulePayload {
    pub fn scan(&self) -> &ScanId {
        match self {
            ModulePayload::Masscan(p) => &p.scan,
            ModulePayload::Httpx(p) => &p.scan,
            ModulePayload::Nuclei(p) => &p.scan,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(match self {
            ModulePayload::Masscan(p) => serde_json::to_value(p)?,
            ModulePayload::Httpx(p) => serde_json::to_value(p)?,
            ModulePayload::Nuclei(p) => serde_json::to_value(p)?,
        })
    }
}

/// Capabilities every module provides.
#[async_trait]
pub trait ScanModule: Named {
    fn module(&self) -> ModuleName;

    /// Decode a job payload into this module's payload type.
    fn new_payload(&self, raw: &Value) -> Result<ModulePayload>;

    /// The command line and files needed to run `payload` as `task`.
    fn build_invocation(&self, task: &TaskId, payload: &ModulePayload) -> Result<Invocation>;

    /// Run the tool for one task and index its findings. Returns the number
    /// of documents handed to `indexer`.
    async fn process_task(
        &self,
        ctx: &TaskContext,
        payload: &ModulePayload,
        indexer: &BulkIndexer,
    ) -> Result<u64> {
        let invocation = self.build_invocation(&ctx.task_id, payload)?;
        engine::execute(self, ctx, invocation, indexer).await
    }

    /// Turn one stdout line into a document, or `None` to skip it.
    fn process_stdout(&self, ctx: &TaskContext, line: &str) -> Option<BulkItem>;

    fn process_stderr(&self, ctx: &TaskContext, line: &str) {
        let _entered = ctx.span.enter();
        warn!(module = %self.module(), "{line}");
    }

    /// Create the follow-on tasks for `request`. Returns the number of tasks
    /// created.
    async fn schedule(
        &self,
        ctx: &TaskContext,
        request: &SchedulePayload,
        scheduler: &Scheduler,
    ) -> Result<u64> {
        let _ = (ctx, request, scheduler);
        Err(ArcherError::SchedulingUnsupported(self.module().to_string()))
    }
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(module: ModuleName, raw: &Value) -> Result<T> {
    serde_json::from_value(raw.clone()).map_err(|err| {
        ArcherError::validation("payload", format!("invalid {module} payload: {err}"))
    })
}

pub(crate) fn mismatched(module: ModuleName, payload: &ModulePayload) -> ArcherError {
    ArcherError::Internal(format!("{module} cannot run payload {payload:?}"))
}
