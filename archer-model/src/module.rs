//! Module names and the static stage graph that links them.

use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Pseudo-module recorded on tasks that advance the pipeline.
pub const SCHEDULER_MODULE: &str = "scheduler";

/// Queue consumed by scheduler processes.
pub const SCHEDULER_QUEUE: &str = "scheduler";

/// Pluggable scan capabilities, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ModuleName {
    Masscan,
    Httpx,
    Nuclei,
}

pub const ALL_MODULES: [ModuleName; 3] =
    [ModuleName::Masscan, ModuleName::Httpx, ModuleName::Nuclei];

impl ModuleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleName::Masscan => "masscan",
            ModuleName::Httpx => "httpx",
            ModuleName::Nuclei => "nuclei",
        }
    }

    /// Queue this module's scan tasks are published on.
    pub fn queue(&self) -> &'static str {
        self.as_str()
    }

    /// Job type of the internal job that fans out work for this module.
    pub fn schedule_job_type(&self) -> String {
        format!("{}:schedule", self.as_str())
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleName {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "masscan" => Ok(ModuleName::Masscan),
            "httpx" => Ok(ModuleName::Httpx),
            "nuclei" => Ok(ModuleName::Nuclei),
            other => Err(ModelError::UnknownModule(other.to_string())),
        }
    }
}

/// Modules that may follow `module` in the pipeline.
pub fn next_stages(module: ModuleName) -> &'static [ModuleName] {
    match module {
        ModuleName::Masscan => &[ModuleName::Httpx, ModuleName::Nuclei],
        ModuleName::Httpx => &[ModuleName::Nuclei],
        ModuleName::Nuclei => &[],
    }
}

/// Follow-on modules of `module`, restricted to those the scan requested.
pub fn requested_next_stages(
    module: ModuleName,
    requested: &[ModuleName],
) -> Vec<ModuleName> {
    next_stages(module)
        .iter()
        .copied()
        .filter(|next| requested.contains(next))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_graph_is_filtered_by_request() {
        let requested = [ModuleName::Masscan, ModuleName::Nuclei];
        assert_eq!(
            requested_next_stages(ModuleName::Masscan, &requested),
            vec![ModuleName::Nuclei]
        );
        assert!(
            requested_next_stages(ModuleName::Masscan, &[ModuleName::Masscan])
                .is_empty()
        );
        assert!(next_stages(ModuleName::Nuclei).is_empty());
    }

    #[test]
    fn scheduler_is_not_a_module() {
        assert!(SCHEDULER_MODULE.parse::<ModuleName>().is_err());
        assert_eq!(ModuleName::Httpx.schedule_job_type(), "httpx:schedule");
    }
}
