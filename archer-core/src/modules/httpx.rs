//! HTTP probing with httpx.

use std::collections::BTreeMap;
use std::sync::Arc;

use archer_config::HttpxConfig;
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

static HEADER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\w-]+):\s(.+)$").expect("header pattern compiles"));

const FIXED_ARGS: [&str; 11] = [
    "-follow-redirects",
    "-random-agent",
    "-status-code",
    "-server",
    "-tech-detect",
    "-tls-grab",
    "-title",
    "-no-fallback",
    "-include-chain",
    "-include-response",
    "-json",
];

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CspOutput {
    domains: Vec<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Hashes {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body_mmh3: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body_sha256: String,
    pub header_mmh3: String,
    pub header_sha256: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Tls {
    pub cipher: String,
    pub tls_version: String,
    pub extension_name: String,
    pub dns_names: Vec<String>,
    pub common_names: Vec<String>,
    pub organization: Vec<String>,
    pub issuer_common_name: Vec<String>,
    #[serde(alias = "issue_organization")]
    pub issuer_organization: Vec<String>,
    pub fingerprint_sha256: String,
    pub fingerprint_sha256_openssl: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChainOutput {
    request: String,
    response: String,
    status_code: u16,
    location: String,
    #[serde(rename = "request-url")]
    request_url: String,
}

/// One JSON line of httpx output.
#[derive(Debug, Deserialize)]
struct ProbeOutput {
    input: String,
    port: String,
    scheme: String,
    #[serde(default)]
    status_code: u16,
    #[serde(default)]
    title: String,
    #[serde(default)]
    tech: Vec<String>,
    #[serde(default)]
    raw_header: String,
    #[serde(default)]
    body: String,
    #[serde(default, rename = "final-url")]
    final_url: String,
    #[serde(default)]
    chain: Vec<ChainOutput>,
    #[serde(default)]
    hash: Hashes,
    #[serde(default)]
    tls: Option<Tls>,
    #[serde(default)]
    csp: Option<CspOutput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RedirectHop {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response: String,
    pub status_code: u16,
    pub location: String,
    pub request_url: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Redirects {
    pub chains: Vec<RedirectHop>,
    pub final_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub module: &'static str,
    pub task: String,
    pub timestamp: String,
}

/// The `http` entry merged into a target's document.
#[derive(Debug, Clone, Serialize)]
pub struct HttpService {
    pub port: u16,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub csp: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<Tls>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub body: String,
    pub headers: BTreeMap<String, String>,
    pub hashes: Hashes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirects: Option<Redirects>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub technologies: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    pub scheme: String,
    pub status_code: u16,
    pub metadata: Metadata,
}

/// Split a raw response header block into a lower-cased header map.
pub fn parse_headers(raw: &str) -> BTreeMap<String, String> {
    raw.split("\r\n")
        .filter_map(|line| HEADER_LINE.captures(line))
        .filter_map(|caps| {
            Some((
                caps.get(1)?.as_str().to_ascii_lowercase(),
                caps.get(2)?.as_str().to_string(),
            ))
        })
        .collect()
}

/// Parse one line of httpx JSON output into the probed ip and its entry.
pub fn parse_line(line: &str, task: &TaskId, timestamp: &str) -> Result<(String, HttpService)> {
    let output: ProbeOutput = serde_json::from_str(line)?;

    let ip = match output.input.split_once(':') {
        Some((ip, port)) if !ip.is_empty() && !port.is_empty() && !port.contains(':') => ip,
        _ => {
            return Err(ArcherError::validation(
                "input",
                format!("cannot take an ip out of '{}'", output.input),
            ));
        }
    };
    let port = output.port.parse::<u16>().map_err(|err| {
        ArcherError::validation("port", format!("invalid port '{}': {err}", output.port))
    })?;

    let redirects = (!output.final_url.is_empty() || !output.chain.is_empty()).then(|| Redirects {
        chains: output
            .chain
            .into_iter()
            .map(|hop| RedirectHop {
                request: hop.request,
                response: hop.response,
                status_code: hop.status_code,
                location: hop.location,
                request_url: hop.request_url,
            })
            .collect(),
        final_url: output.final_url,
    });

    let service = HttpService {
        port,
        csp: output.csp.map(|csp| csp.domains).unwrap_or_default(),
        tls: output.tls.filter(|tls| !tls.tls_version.is_empty()),
        body: output.body,
        headers: parse_headers(&output.raw_header),
        hashes: output.hash,
        redirects,
        technologies: output.tech,
        title: output.title,
        scheme: output.scheme,
        status_code: output.status_code,
        metadata: Metadata {
            module: ModuleName::Httpx.as_str(),
            task: task.to_string(),
            timestamp: timestamp.to_string(),
        },
    };
    Ok((ip.to_string(), service))
}

#[derive(Debug, Clone)]
pub struct HttpxModule {
    config: HttpxConfig,
    index: Arc<dyn SearchIndex>,
}

impl HttpxModule {
    pub fn new(config: HttpxConfig, index: Arc<dyn SearchIndex>) -> Self {
        Self { config, index }
    }
}

impl Named for HttpxModule {
    fn name(&self) -> &str {
        ModuleName::Httpx.as_str()
    }
}

#[async_trait]
impl ScanModule for HttpxModule {
    fn module(&self) -> ModuleName {
        ModuleName::Httpx
    }

    fn new_payload(&self, raw: &Value) -> Result<ModulePayload> {
        decode(ModuleName::Httpx, raw).map(ModulePayload::Httpx)
    }

    fn build_invocation(&self, task: &TaskId, payload: &ModulePayload) -> Result<Invocation> {
        let ModulePayload::Httpx(payload) = payload else {
            return Err(mismatched(ModuleName::Httpx, payload));
        };
        let path = self
            .config
            .config_dir
            .join(format!("httpx_{task}_targets.txt"));

        let mut invocation =
            Invocation::new(&self.config.binary).arg(format!("-l={}", path.display()));
        for arg in FIXED_ARGS {
            invocation = invocation.arg(arg);
        }
        if let Some(proxy) = &self.config.http_proxy {
            invocation = invocation.arg(format!("-http-proxy={proxy}"));
        } else if let Some(proxy) = &self.config.socks_proxy {
            invocation = invocation.arg(format!("-socks-proxy={proxy}"));
        }
        if let Some(threads) = self.config.threads {
            invocation = invocation.arg("-threads").arg(threads.to_string());
        }
        if let Some(rate) = self.config.rate_limit {
            invocation = invocation.arg("-rl").arg(rate.to_string());
        }

        Ok(invocation
            .artifact(path, payload.targets.join("\n"))
            .persist(self.config.persist_config))
    }

    fn process_stdout(&self, ctx: &TaskContext, line: &str) -> Option<BulkItem> {
        let _entered = ctx.span.enter();
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let (ip, service) = match parse_line(line, &ctx.task_id, &timestamp) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "skipping httpx output");
                return None;
            }
        };
        info!(
            scheme = %service.scheme.to_ascii_uppercase(),
            status = service.status_code,
            ip = %ip,
            port = service.port,
            "found http service"
        );

        let output = match serde_json::to_value(&service) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to encode http service");
                return None;
            }
        };
        Some(BulkItem {
            id: document_id(&ip, &ctx.scan_id),
            script: MergeScript::Http,
            params: serde_json::json!({
                "ip": ip,
                "output": output,
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
        if request.previous_module != ModuleName::Masscan {
            return Err(ArcherError::validation(
                "previous_module",
                format!("httpx cannot follow {}", request.previous_module),
            ));
        }
        let query = fanout::open_ports_query(&request.scan, &request.task);
        fanout::fan_out(
            self.index.as_ref(),
            &query,
            &ctx.cancel,
            MAX_BATCH,
            fanout::open_port_targets,
            |batch| async move {
                let tasks = scheduler.schedule_httpx(&request.scan, &batch).await?;
                Ok::<_, ArcherError>(tasks.len() as u64)
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::modules::HttpxPayload;
    use crate::search::InMemorySearchIndex;
    use archer_model::ScanId;
    use std::path::PathBuf;

    const LINE: &str = r#"{"timestamp":"2024-03-01T10:00:00Z","hash":{"body_mmh3":"-1","header_mmh3":"12","header_sha256":"ab"},"port":"443","input":"10.0.0.7:443","title":"Login","scheme":"https","final-url":"https://10.0.0.7/login","raw_header":"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nX-Frame-Options: DENY\r\n","tech":["nginx"],"chain":[{"status_code":302,"location":"/login","request-url":"https://10.0.0.7:443"}],"status_code":200,"tls":{"tls_version":"tls13","cipher":"TLS_AES_128_GCM_SHA256","dns_names":["example.test"]},"csp":{"domains":["cdn.example.test"]}}"#;

    fn module(config: HttpxConfig) -> HttpxModule {
        HttpxModule::new(config, Arc::new(InMemorySearchIndex::new()))
    }

    #[test]
    fn header_pattern_splits_name_and_value() {
        let caps = HEADER_LINE.captures("Set-Cookie: id=1; Path=/").unwrap();
        assert_eq!(&caps[1], "Set-Cookie");
        assert_eq!(&caps[2], "id=1; Path=/");
        assert!(!HEADER_LINE.is_match("HTTP/1.1 200 OK"));
        assert!(parse_headers("HTTP/1.1 204 No Content\r\n").is_empty());
    }

    #[test]
    fn parses_probe_output() {
        let (ip, service) = parse_line(LINE, &TaskId::from_raw("t1"), "now").unwrap();
        assert_eq!(ip, "10.0.0.7");
        assert_eq!(service.port, 443);
        assert_eq!(service.scheme, "https");
        assert_eq!(service.headers["content-type"], "text/html");
        assert_eq!(service.headers["x-frame-options"], "DENY");
        assert_eq!(service.csp, vec!["cdn.example.test"]);
        assert_eq!(service.tls.as_ref().unwrap().tls_version, "tls13");
        let redirects = service.redirects.unwrap();
        assert_eq!(redirects.final_url, "https://10.0.0.7/login");
        assert_eq!(redirects.chains[0].status_code, 302);
    }

    #[test]
    fn rejects_garbled_host_and_port() {
        let task = TaskId::from_raw("t1");
        let no_port = r#"{"input":"10.0.0.7","port":"80","scheme":"http"}"#;
        let bad_port = r#"{"input":"10.0.0.7:80","port":"http","scheme":"http"}"#;
        assert!(parse_line(no_port, &task, "now").is_err());
        assert!(parse_line(bad_port, &task, "now").is_err());
        assert!(parse_line("not json", &task, "now").is_err());
    }

    #[test]
    fn proxies_and_limits_become_flags() {
        let module = module(HttpxConfig {
            config_dir: PathBuf::from("/tmp/archer"),
            http_proxy: Some("http://127.0.0.1:8080".into()),
            threads: Some(25),
            rate_limit: Some(100),
            ..HttpxConfig::default()
        });
        let payload = ModulePayload::Httpx(HttpxPayload {
            scan: ScanId::from_raw("scan00000001"),
            targets: vec!["10.0.0.1:80".into(), "10.0.0.1:443".into()],
        });
        let invocation = module
            .build_invocation(&TaskId::from_raw("t9"), &payload)
            .unwrap();
        assert_eq!(invocation.args[0], "-l=/tmp/archer/httpx_t9_targets.txt");
        assert!(invocation.args.contains(&"-http-proxy=http://127.0.0.1:8080".to_string()));
        assert!(invocation.args.ends_with(&[
            "-threads".to_string(),
            "25".to_string(),
            "-rl".to_string(),
            "100".to_string()
        ]));
        assert_eq!(invocation.artifacts[0].contents, "10.0.0.1:80\n10.0.0.1:443");
    }

    #[test]
    fn documents_use_the_http_merge_script() {
        let ctx = test_context("httpx");
        let item = module(HttpxConfig::default())
            .process_stdout(&ctx, LINE)
            .unwrap();
        assert_eq!(item.id, document_id("10.0.0.7", &ctx.scan_id));
        assert_eq!(item.script, MergeScript::Http);
        assert_eq!(item.params["output"]["metadata"]["task"], ctx.task_id.as_str());
        assert!(module(HttpxConfig::default()).process_stdout(&ctx, "{}").is_none());
    }
}
