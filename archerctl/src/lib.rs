//! Building blocks for the `archerctl` binary: argument types, scan request
//! assembly and plain-text rendering.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use archer_contracts::NewScanRequest;
use archer_model::{ALL_MODULES, Scan, Task};
use clap::Args;

/// Value of `--module` that selects every module.
pub const ALL: &str = "all";

/// Arguments of `archerctl new`.
#[derive(Args, Debug, Clone, Default)]
pub struct NewArgs {
    /// Module to run: masscan, httpx, nuclei or all
    #[arg(short, long = "module", value_name = "NAME", required = true)]
    pub modules: Vec<String>,

    /// Target IP address or range
    #[arg(short, long = "target", value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Port to scan
    #[arg(short, long = "port", value_name = "PORT")]
    pub ports: Vec<u16>,

    /// File with one target per line
    #[arg(short, long)]
    pub list: Option<PathBuf>,

    /// Nuclei template type filter
    #[arg(long = "nuclei-type", value_name = "TYPE")]
    pub nuclei_types: Vec<String>,

    /// Extra arguments recorded with the scan
    #[arg(long)]
    pub arguments: Option<String>,
}

/// Replace `all` with every module name.
pub fn expand_modules(values: &[String]) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    for value in values {
        if value.eq_ignore_ascii_case(ALL) {
            for module in ALL_MODULES {
                push_unique(&mut modules, module.as_str().to_string());
            }
        } else {
            push_unique(&mut modules, value.trim().to_string());
        }
    }
    modules
}

/// Non-blank lines of `path`, trimmed.
pub fn read_target_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read target list {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Assemble the scan request from flags and the optional list file.
pub fn build_request(args: &NewArgs) -> anyhow::Result<NewScanRequest> {
    let mut targets = Vec::new();
    for target in &args.targets {
        push_unique(&mut targets, target.trim().to_string());
    }
    if let Some(list) = &args.list {
        for target in read_target_list(list)? {
            push_unique(&mut targets, target);
        }
    }

    Ok(NewScanRequest {
        targets,
        ports: args.ports.clone(),
        modules: expand_modules(&args.modules),
        nuclei_types: (!args.nuclei_types.is_empty()).then(|| args.nuclei_types.clone()),
        arguments: args.arguments.clone(),
    })
}

fn push_unique(values: &mut Vec<String>, value: String) {
    if !value.is_empty() && !values.contains(&value) {
        values.push(value);
    }
}

/// Human-readable summary of a scan and its tasks.
pub fn render_scan(scan: &Scan, tasks: &[Task]) -> String {
    let mut out = String::new();
    let modules: Vec<&str> = scan.modules.iter().map(|m| m.as_str()).collect();
    let _ = writeln!(out, "scan      {}", scan.id);
    let _ = writeln!(out, "status    {}", scan.status);
    let _ = writeln!(out, "modules   {}", modules.join(","));
    let _ = writeln!(
        out,
        "targets   {} ({} ports)",
        scan.targets.len(),
        scan.ports.len()
    );
    let _ = writeln!(out, "created   {}", scan.created_at.to_rfc3339());
    if let Some(completed) = scan.completed_at {
        let _ = writeln!(out, "completed {}", completed.to_rfc3339());
    }

    if tasks.is_empty() {
        return out;
    }
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "{:<14} {:<10} {:<10} {:>8}  WORKER",
        "TASK", "MODULE", "STATUS", "RESULTS"
    );
    for task in tasks {
        let results = task
            .results
            .map(|count| count.to_string())
            .unwrap_or_else(|| "-".into());
        let worker = task
            .worker_id
            .as_ref()
            .map(|worker| worker.as_str())
            .unwrap_or("-");
        let _ = writeln!(
            out,
            "{:<14} {:<10} {:<10} {:>8}  {}",
            task.id.as_str(),
            task.module,
            task.status.as_str(),
            results,
            worker
        );
    }
    out
}

/// One line per scan, newest first as returned by the coordinator.
pub fn render_scans(scans: &[Scan]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<14} {:<10} {:<22} {:>7}  CREATED",
        "SCAN", "STATUS", "MODULES", "TARGETS"
    );
    for scan in scans {
        let modules: Vec<&str> = scan.modules.iter().map(|m| m.as_str()).collect();
        let _ = writeln!(
            out,
            "{:<14} {:<10} {:<22} {:>7}  {}",
            scan.id.as_str(),
            scan.status.as_str(),
            modules.join(","),
            scan.targets.len(),
            scan.created_at.to_rfc3339()
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use archer_model::{ModuleName, ScanId, ScanStatus, TaskId, TaskStatus, WorkerId};
    use chrono::Utc;
    use std::io::Write;

    #[test]
    fn all_expands_to_every_module_once() {
        let modules = expand_modules(&["httpx".into(), "all".into()]);
        assert_eq!(modules, vec!["httpx", "masscan", "nuclei"]);
    }

    #[test]
    fn list_files_add_non_blank_targets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.2\n\n  10.0.0.3  \n10.0.0.1").unwrap();

        let request = build_request(&NewArgs {
            modules: vec!["masscan".into()],
            targets: vec!["10.0.0.1".into()],
            ports: vec![80],
            list: Some(file.path().to_path_buf()),
            ..NewArgs::default()
        })
        .unwrap();

        assert_eq!(request.targets, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(request.ports, vec![80]);
        assert!(request.nuclei_types.is_none());
    }

    #[test]
    fn missing_list_file_is_an_error() {
        let err = build_request(&NewArgs {
            modules: vec!["masscan".into()],
            list: Some(PathBuf::from("/nonexistent/archer-targets.txt")),
            ..NewArgs::default()
        })
        .unwrap_err();
        assert!(err.to_string().contains("failed to read target list"));
    }

    #[test]
    fn rendering_lists_tasks() {
        let now = Utc::now();
        let scan = Scan {
            id: ScanId::from_raw("abcdef123456"),
            modules: vec![ModuleName::Masscan, ModuleName::Httpx],
            targets: vec!["10.0.0.1".into()],
            ports: vec![80, 443],
            nuclei_types: Vec::new(),
            arguments: None,
            status: ScanStatus::Active,
            started_at: Some(now),
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        let task = Task {
            id: TaskId::from_raw("task00000001"),
            scan_id: scan.id.clone(),
            module: "masscan".into(),
            payload: None,
            results: Some(4),
            status: TaskStatus::Completed,
            worker_id: Some(WorkerId::from_raw("w1")),
            started_at: Some(now),
            completed_at: Some(now),
            created_at: now,
            updated_at: now,
        };

        let listing = render_scans(std::slice::from_ref(&scan));
        assert!(listing.lines().nth(1).is_some_and(|line| {
            line.starts_with("abcdef123456")
                && line.contains("active")
                && line.contains("masscan,httpx")
        }));

        let text = render_scan(&scan, &[task]);
        assert!(text.contains("modules   masscan,httpx"));
        assert!(text.contains("targets   1 (2 ports)"));
        assert!(text.lines().any(|line| line.starts_with("task00000001")
            && line.contains("completed")
            && line.ends_with("w1")));
    }
}
