//! Core data model definitions shared across Archer crates.
#![allow(missing_docs)]

pub use ::chrono;

pub mod error;
pub mod ids;
pub mod module;
pub mod scan;
pub mod status;

pub use error::{ModelError, Result as ModelResult};
pub use ids::{ScanId, TaskId, WorkerId};
pub use module::{
    ALL_MODULES, ModuleName, SCHEDULER_MODULE, SCHEDULER_QUEUE, next_stages,
    requested_next_stages,
};
pub use scan::{Scan, Task};
pub use status::{ScanStatus, TaskStatus};
