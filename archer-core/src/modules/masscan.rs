//! Port discovery with masscan.

use std::fmt::Write as _;

use archer_config::MasscanConfig;
use archer_model::{ModuleName, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{Invocation, ModulePayload, ScanModule, decode, mismatched};
use crate::context::TaskContext;
use crate::error::Result;
use crate::mux::Named;
use crate::search::{BulkItem, MergeScript, document_id};

static OPEN_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Discovered\sopen\sport\s(\d+)/(tcp|udp)\son\s([\w.]+)")
        .expect("open port pattern compiles")
});

const BASE_CONFIG: &str = "randomize-hosts = true\ninteractive = true\nexclude = 255.255.255.255\n";

#[derive(Debug, Clone, Serialize)]
struct PortMetadata<'a> {
    module: &'static str,
    task: &'a str,
    timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
struct OpenPort<'a> {
    port: u16,
    metadata: PortMetadata<'a>,
}

/// A parsed `Discovered open port` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub ip: String,
    pub port: u16,
    pub protocol: String,
}

/// Parse one line of masscan's interactive output.
pub fn parse_line(line: &str) -> Option<Discovery> {
    let caps = OPEN_PORT.captures(line)?;
    let port = caps.get(1)?.as_str().parse::<u16>().ok()?;
    Some(Discovery {
        ip: caps.get(3)?.as_str().to_string(),
        port,
        protocol: caps.get(2)?.as_str().to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct MasscanModule {
    config: MasscanConfig,
}

impl MasscanModule {
    pub fn new(config: MasscanConfig) -> Self {
        Self { config }
    }

    /// Render the masscan configuration file for one shard.
    pub fn render_config(
        &self,
        targets: &[String],
        ports: &[u16],
        shard: &str,
        seed: i64,
    ) -> String {
        let mut config = BASE_CONFIG.to_string();
        let mut line = |key: &str, value: &str| {
            let _ = writeln!(config, "{key} = {value}");
        };
        if let Some(rate) = self.config.rate.filter(|rate| *rate > 0) {
            line("rate", &rate.to_string());
        }
        if let Some(port) = self.config.adapter_port.filter(|port| *port > 0) {
            line("adapter-port", &port.to_string());
        }
        line("range", &targets.join(","));
        line("shard", shard);
        line("seed", &seed.to_string());
        let ports: Vec<String> = ports.iter().map(u16::to_string).collect();
        line("ports", &ports.join(","));
        config
    }

    fn document(&self, ctx: &TaskContext, found: &Discovery, now: DateTime<Utc>) -> BulkItem {
        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let port = OpenPort {
            port: found.port,
            metadata: PortMetadata {
                module: ModuleName::Masscan.as_str(),
                task: ctx.task_id.as_str(),
                timestamp: timestamp.clone(),
            },
        };
        BulkItem {
            id: document_id(&found.ip, &ctx.scan_id),
            script: MergeScript::Ports,
            params: serde_json::json!({
                "ip": found.ip,
                "port": port,
                "scan": ctx.scan_id.as_str(),
                "timestamp": timestamp,
            }),
        }
    }
}

impl Named for MasscanModule {
    fn name(&self) -> &str {
        ModuleName::Masscan.as_str()
    }
}

#[async_trait]
impl ScanModule for MasscanModule {
    fn module(&self) -> ModuleName {
        ModuleName::Masscan
    }

    fn new_payload(&self, raw: &Value) -> Result<ModulePayload> {
        decode(ModuleName::Masscan, raw).map(ModulePayload::Masscan)
    }

    fn build_invocation(&self, task: &TaskId, payload: &ModulePayload) -> Result<Invocation> {
        let ModulePayload::Masscan(payload) = payload else {
            return Err(mismatched(ModuleName::Masscan, payload));
        };
        let path = self.config.config_dir.join(format!("masscan_{task}.conf"));
        let contents = self.render_config(
            &payload.targets,
            &payload.ports,
            &payload.shard,
            payload.seed,
        );

        let config_arg = path.to_string_lossy().into_owned();

        let mut invocation = Invocation::new(&self.config.binary)
            .arg("-c")
            .arg(config_arg)
            .artifact(path, contents)
            .persist(self.config.persist_config);
        if let Some(exclude) = &self.config.exclude_file {
            invocation = invocation
                .arg("--excludefile")
                .arg(exclude.to_string_lossy());
        }
        Ok(invocation)
    }

    fn process_stdout(&self, ctx: &TaskContext, line: &str) -> Option<BulkItem> {
        let _entered = ctx.span.enter();
        let Some(found) = parse_line(line) else {
            debug!(line, "skipping unrecognized masscan output");
            return None;
        };
        info!(ip = %found.ip, port = found.port, protocol = %found.protocol, "found open port");
        Some(self.document(ctx, &found, Utc::now()))
    }

    fn process_stderr(&self, ctx: &TaskContext, line: &str) {
        let _entered = ctx.span.enter();
        // masscan reports progress on stderr
        info!(module = "masscan", "{line}");
    }
}
