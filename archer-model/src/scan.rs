use chrono::{DateTime, Utc};

use crate::ids::{ScanId, TaskId, WorkerId};
use crate::module::ModuleName;
use crate::status::{ScanStatus, TaskStatus};

/// A user-requested unit of work spanning modules, targets and ports.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Scan {
    pub id: ScanId,
    pub modules: Vec<ModuleName>,
    pub targets: Vec<String>,
    pub ports: Vec<u16>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub nuclei_types: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub arguments: Option<String>,
    pub status: ScanStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scan {
    pub fn requests(&self, module: ModuleName) -> bool {
        self.modules.contains(&module)
    }

    /// The module that runs first: masscan, unless exactly one module
    /// was requested.
    pub fn first_stage(&self) -> ModuleName {
        match self.modules.as_slice() {
            [only] => *only,
            _ => ModuleName::Masscan,
        }
    }

    /// `target:port` pairs for modules that probe services directly.
    pub fn service_targets(&self) -> Vec<String> {
        self.targets
            .iter()
            .flat_map(|target| {
                self.ports.iter().map(move |port| format!("{target}:{port}"))
            })
            .collect()
    }
}

/// One unit of queued, worker-executed work belonging to a scan.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Task {
    pub id: TaskId,
    pub scan_id: ScanId,
    /// A module name or the scheduler pseudo-module.
    pub module: String,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub payload: Option<serde_json::Value>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub results: Option<i64>,
    pub status: TaskStatus,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub worker_id: Option<WorkerId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
