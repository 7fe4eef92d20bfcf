//! Template matching with nuclei.

use std::sync::Arc;

use archer_config::NucleiConfig;
use archer_model::{ModuleName, TaskId};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::fanout::{self, MAX_BATCH};
use super::{Invocation, ModulePayload, SchedulePayload, ScanModule, decode, mismatched};
use crate::context::TaskContext;
use crate::error::{ArcherError, Result};
use crate::mux::Named;
use crate::scheduler::Scheduler;
use crate::search::{BulkItem, MergeScript, SearchIndex, document_id};

static MATCHED_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([\d.]+):(\d+)").expect("matched host pattern compiles"));

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TemplateInfo {
    name: String,
    description: String,
    severity: String,
    tags: Vec<String>,
}

/// One JSON line of nuclei output.
#[derive(Debug, Deserialize)]
struct MatchOutput {
    #[serde(rename = "template-id")]
    template_id: String,
    #[serde(default, rename = "matched-at")]
    matched_at: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default, rename = "extracted-results")]
    extracted_results: Vec<String>,
    #[serde(default, rename = "matcher-name")]
    matcher_name: String,
    #[serde(default)]
    info: TemplateInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionMetadata {
    pub module: &'static str,
    pub task: String,
    pub timestamp: String,
}

/// The `detections` entry merged into a target's document.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub port: u16,
    pub template_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extracted_results: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub matcher_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub matched_at: String,
    pub name: String,
    pub description: String,
    pub severity: String,
    pub tags: Vec<String>,
    pub metadata: DetectionMetadata,
}

/// Parse one line of nuclei JSON output into the matched ip and detection.
pub fn parse_line(line: &str, task: &TaskId, timestamp: &str) -> Result<(String, Detection)> {
    let output: MatchOutput = serde_json::from_str(line)?;

    let host = MATCHED_HOST
        .captures(&output.matched_at)
        .and_then(|caps| Some((caps.get(1)?.as_str(), caps.get(2)?.as_str())));
    let Some((ip, port)) = host else {
        return Err(ArcherError::validation(
            "matched-at",
            format!("cannot take a host out of '{}'", output.matched_at),
        ));
    };
    let port = port.parse::<u16>().map_err(|err| {
        ArcherError::validation("matched-at", format!("invalid port '{port}': {err}"))
    })?;
    let ip = ip.to_string();

    Ok((
        ip,
        Detection {
            port,
            template_id: output.template_id,
            kind: output.kind,
            extracted_results: output.extracted_results,
            matcher_name: output.matcher_name,
            matched_at: output.matched_at,
            name: output.info.name,
            description: output.info.description,
            severity: output.info.severity,
            tags: output.info.tags,
            metadata: DetectionMetadata {
                module: ModuleName::Nuclei.as_str(),
                task: task.to_string(),
                timestamp: timestamp.to_string(),
            },
        },
    ))
}

#[derive(Debug, Clone)]
pub struct NucleiModule {
    config: NucleiConfig,
    index: Arc<dyn SearchIndex>,
}

impl NucleiModule {
    pub fn new(config: NucleiConfig, index: Arc<dyn SearchIndex>) -> Self {
        Self { config, index }
    }
}

impl Named for NucleiModule {
    fn name(&self) -> &str {
        ModuleName::Nuclei.as_str()
    }
}

#[async_trait]
impl ScanModule for NucleiModule {
    fn module(&self) -> ModuleName {
        ModuleName::Nuclei
    }

    fn new_payload(&self, raw: &Value) -> Result<ModulePayload> {
        decode(ModuleName::Nuclei, raw).map(ModulePayload::Nuclei)
    }

    fn build_invocation(&self, task: &TaskId, payload: &ModulePayload) -> Result<Invocation> {
        let ModulePayload::Nuclei(payload) = payload else {
            return Err(mismatched(ModuleName::Nuclei, payload));
        };
        let path = self
            .config
            .config_dir
            .join(format!("nuclei_{task}_targets.txt"));
        let config = &self.config;

        let mut invocation = Invocation::new(&config.binary)
            .arg("-l")
            .arg(path.to_string_lossy().into_owned())
            .arg("-timeout")
            .arg(config.timeout.to_string())
            .arg("-retries")
            .arg(config.retries.to_string())
            .arg("-rl")
            .arg(config.rate_limit.to_string())
            .arg("-bs")
            .arg(config.bulk_size.to_string())
            .arg("-c")
            .arg(config.concurrency.to_string())
            .arg("-stats")
            .arg("-json");
        for kind in &payload.template_types {
            invocation = invocation.arg("-type").arg(kind);
        }
        for proxy in &config.proxies {
            invocation = invocation.arg("-proxy").arg(proxy);
        }

        Ok(invocation
            .artifact(path, payload.targets.join("\n"))
            .persist(config.persist_config))
    }

    fn process_stdout(&self, ctx: &TaskContext, line: &str) -> Option<BulkItem> {
        let _entered = ctx.span.enter();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let (ip, detection) = match parse_line(line, &ctx.task_id, &timestamp) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "skipping nuclei output");
                return None;
            }
        };
        info!(
            template = %detection.template_id,
            severity = %detection.severity,
            matched_at = %detection.matched_at,
            "found detection"
        );

        let detection = match serde_json::to_value(&detection) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to encode detection");
                return None;
            }
        };
        Some(BulkItem {
            id: document_id(&ip, &ctx.scan_id),
            script: MergeScript::Detections,
            params: serde_json::json!({
                "ip": ip,
                "detection": detection,
                "scan": ctx.scan_id.as_str(),
                "timestamp": timestamp,
            }),
        })
    }

    async fn schedule(
        &self,
        ctx: &TaskContext,
        request: &SchedulePayload,
        scheduler: &Scheduler,
    ) -> Result<u64> {
        let submit = |batch: Vec<String>| async move {
            let tasks = scheduler
                .schedule_nuclei(&request.scan, &batch, &request.template_types)
                .await?;
            Ok::<_, ArcherError>(tasks.len() as u64)
        };

        match request.previous_module {
            ModuleName::Masscan => {
                let query = fanout::open_ports_query(&request.scan, &request.task);
                fanout::fan_out(
                    self.index.as_ref(),
                    &query,
                    &ctx.cancel,
                    MAX_BATCH,
                    fanout::open_port_targets,
                    submit,
                )
                .await
            }
            ModuleName::Httpx => {
                let query = fanout::http_services_query(&request.scan, &request.task);
                fanout::fan_out(
                    self.index.as_ref(),
                    &query,
                    &ctx.cancel,
                    MAX_BATCH,
                    |hit| fanout::http_service_targets(hit, &request.task),
                    submit,
                )
                .await
            }
            ModuleName::Nuclei => Err(ArcherError::validation(
                "previous_module",
                "nuclei cannot follow itself",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::modules::NucleiPayload;
    use crate::search::InMemorySearchIndex;
    use archer_model::ScanId;
    use std::path::PathBuf;

    const LINE: &str = r#"{"template-id":"git-config","info":{"name":"Git Config Disclosure","severity":"medium","tags":["config","git"]},"type":"http","host":"http://10.0.0.3:8080","matched-at":"http://10.0.0.3:8080/.git/config","matcher-name":"status","extracted-results":["[core]"],"timestamp":"2024-03-01T10:00:00Z"}"#;

    #[test]
    fn host_pattern_finds_ip_and_port_inside_urls() {
        let caps = MATCHED_HOST
            .captures("https://10.1.2.3:8443/admin")
            .unwrap();
        assert_eq!(&caps[1], "10.1.2.3");
        assert_eq!(&caps[2], "8443");
        assert!(!MATCHED_HOST.is_match("example.test"));
    }

    #[test]
    fn parses_detection_and_host() {
        let (ip, detection) = parse_line(LINE, &TaskId::from_raw("t1"), "now").unwrap();
        assert_eq!(ip, "10.0.0.3");
        assert_eq!(detection.port, 8080);
        assert_eq!(detection.template_id, "git-config");
        assert_eq!(detection.severity, "medium");
        assert_eq!(detection.tags, vec!["config", "git"]);
        assert_eq!(detection.extracted_results, vec!["[core]"]);
    }

    #[test]
    fn skips_matches_without_a_host_port() {
        let line = r#"{"template-id":"dns-caa","matched-at":"example.test","info":{}}"#;
        assert!(parse_line(line, &TaskId::from_raw("t1"), "now").is_err());
    }

    #[test]
    fn invocation_carries_limits_types_and_proxies() {
        let module = NucleiModule::new(
            NucleiConfig {
                config_dir: PathBuf::from("/tmp/archer"),
                proxies: vec!["socks5://127.0.0.1:9050".into()],
                ..NucleiConfig::default()
            },
            Arc::new(InMemorySearchIndex::new()),
        );
        let payload = ModulePayload::Nuclei(NucleiPayload {
            scan: ScanId::from_raw("scan00000001"),
            targets: vec!["http://10.0.0.3:8080".into()],
            template_types: vec!["http".into(), "network".into()],
        });
        let invocation = module
            .build_invocation(&TaskId::from_raw("t4"), &payload)
            .unwrap();
        assert_eq!(
            invocation.args,
            vec![
                "-l",
                "/tmp/archer/nuclei_t4_targets.txt",
                "-timeout",
                "5",
                "-retries",
                "1",
                "-rl",
                "150",
                "-bs",
                "200",
                "-c",
                "500",
                "-stats",
                "-json",
                "-type",
                "http",
                "-type",
                "network",
                "-proxy",
                "socks5://127.0.0.1:9050",
            ]
        );
    }

    #[test]
    fn documents_use_the_detection_merge_script() {
        let ctx = test_context("nuclei");
        let module =
            NucleiModule::new(NucleiConfig::default(), Arc::new(InMemorySearchIndex::new()));
        let item = module.process_stdout(&ctx, LINE).unwrap();
        assert_eq!(item.id, document_id("10.0.0.3", &ctx.scan_id));
        assert_eq!(item.script, MergeScript::Detections);
        assert_eq!(item.params["detection"]["template_id"], "git-config");
        assert_eq!(item.params["detection"]["type"], "http");
    }
}
