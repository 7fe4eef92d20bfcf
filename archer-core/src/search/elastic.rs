//! Elasticsearch REST client covering the endpoints the pipeline needs.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use archer_config::SearchConfig;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use url::Url;

use super::{BulkItem, BulkOutcome, SearchAfterRequest, SearchHit, SearchIndex, SearchPage};
use crate::error::{ArcherError, Result};

const MAX_ATTEMPTS: u32 = 5;
const RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
];

pub struct ElasticsearchClient {
    http: Client,
    hosts: Vec<Url>,
    next_host: AtomicUsize,
    index: String,
    pipeline: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl fmt::Debug for ElasticsearchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticsearchClient")
            .field("hosts", &self.hosts)
            .field("index", &self.index)
            .field("pipeline", &self.pipeline)
            .field("authenticated", &self.username.is_some())
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkResponseItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<BulkResponseError>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseError {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    pit_id: Option<String>,
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

impl ElasticsearchClient {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let hosts = config
            .hosts
            .iter()
            .map(|host| {
                Url::parse(host).map_err(|err| {
                    ArcherError::Search(format!("invalid search host '{host}': {err}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if hosts.is_empty() {
            return Err(ArcherError::Search("no search hosts configured".into()));
        }

        let http = Client::builder().build()?;
        Ok(Self {
            http,
            hosts,
            next_host: AtomicUsize::new(0),
            index: config.index.clone(),
            pipeline: config.bulk.pipeline.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Fail unless the results index exists.
    pub async fn ensure_index(&self) -> Result<()> {
        let path = format!("/{}", self.index);
        let response = self.send(&path, &[], |http, url| http.head(url)).await?;
        match response.status() {
            status if status.is_success() => {
                info!(index = %self.index, "search index is reachable");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(ArcherError::Search(format!(
                "index {} does not exist",
                self.index
            ))),
            status => Err(ArcherError::Search(format!(
                "index check for {} returned {status}",
                self.index
            ))),
        }
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let slot = self.next_host.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        let mut url = self.hosts[slot]
            .join(path)
            .map_err(|err| ArcherError::Search(format!("invalid search path {path}: {err}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Send a request, rotating hosts and retrying overload responses.
    async fn send<F>(&self, path: &str, query: &[(&str, String)], build: F) -> Result<Response>
    where
        F: Fn(&Client, Url) -> RequestBuilder,
    {
        let mut attempt = 1;
        loop {
            let mut request = build(&self.http, self.url(path, query)?);
            if let Some(username) = &self.username {
                request = request.basic_auth(username, self.password.as_deref());
            }

            let retry_after = match request.send().await {
                Ok(response) if RETRY_STATUSES.contains(&response.status()) => {
                    if attempt >= MAX_ATTEMPTS {
                        return Ok(response);
                    }
                    format!("status {}", response.status())
                }
                Ok(response) => return Ok(response),
                Err(err) if (err.is_connect() || err.is_timeout()) && attempt < MAX_ATTEMPTS => {
                    err.to_string()
                }
                Err(err) => return Err(err.into()),
            };

            let delay = Duration::from_millis(100 * 2u64.pow(attempt - 1));
            warn!(path, attempt, reason = %retry_after, "retrying search request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn checked(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ArcherError::Search(format!("{status}: {body}")))
    }

    fn bulk_body(items: &[BulkItem]) -> Result<String> {
        let mut body = String::new();
        for item in items {
            let action = json!({ "update": { "_id": item.id } });
            let update = json!({
                "scripted_upsert": true,
                "script": {
                    "source": item.script.source(),
                    "lang": "painless",
                    "params": item.params,
                },
                "upsert": {},
            });
            body.push_str(&serde_json::to_string(&action)?);
            body.push('\n');
            body.push_str(&serde_json::to_string(&update)?);
            body.push('\n');
        }
        Ok(body)
    }
}

#[async_trait]
impl SearchIndex for ElasticsearchClient {
    async fn bulk(&self, items: &[BulkItem]) -> Result<Vec<BulkOutcome>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let body = Self::bulk_body(items)?;
        let path = format!("/{}/_bulk", self.index);
        let query: Vec<(&str, String)> = self
            .pipeline
            .iter()
            .map(|pipeline| ("pipeline", pipeline.clone()))
            .collect();
        let response = self
            .send(&path, &query, |http, url| {
                http.post(url)
                    .header(CONTENT_TYPE, "application/x-ndjson")
                    .body(body.clone())
            })
            .await?;
        let parsed: BulkResponse = Self::checked(response).await?.json().await?;

        let outcomes = items
            .iter()
            .zip(parsed.items)
            .map(|(item, mut actions)| {
                let Some(result) = actions.remove("update") else {
                    return BulkOutcome {
                        id: item.id.clone(),
                        error: Some("missing update action in bulk response".into()),
                    };
                };
                let error = match (result.status, result.error) {
                    (_, Some(err)) => Some(match err.reason {
                        Some(reason) => format!("{}: {reason}", err.kind),
                        None => err.kind,
                    }),
                    (status, None) if status > 299 => Some(format!("status {status}")),
                    _ => None,
                };
                BulkOutcome {
                    id: result.id.unwrap_or_else(|| item.id.clone()),
                    error,
                }
            })
            .collect::<Vec<_>>();
        debug!(documents = outcomes.len(), "bulk request answered");
        Ok(outcomes)
    }

    async fn open_point_in_time(&self, keep_alive: &str) -> Result<String> {
        let path = format!("/{}/_pit", self.index);
        let response = self
            .send(&path, &[("keep_alive", keep_alive.to_string())], |http, url| {
                http.post(url)
            })
            .await?;
        let pit: PitResponse = Self::checked(response).await?.json().await?;
        Ok(pit.id)
    }

    async fn search_after(&self, request: &SearchAfterRequest) -> Result<SearchPage> {
        let mut query = vec![
            ("q", request.query.clone()),
            ("sort", request.sort.clone()),
            ("size", request.size.to_string()),
        ];
        if !request.source.is_empty() {
            query.push(("_source", request.source.join(",")));
        }

        let mut body = json!({
            "pit": { "id": request.pit_id, "keep_alive": request.keep_alive },
        });
        if let Some(after) = &request.search_after {
            body["search_after"] = Value::Array(after.clone());
        }

        let response = self
            .send("/_search", &query, |http, url| http.post(url).json(&body))
            .await?;
        let parsed: SearchResponse = Self::checked(response).await?.json().await?;
        Ok(SearchPage {
            pit_id: parsed.pit_id,
            hits: parsed.hits.hits,
        })
    }

    async fn close_point_in_time(&self, pit_id: &str) -> Result<()> {
        let body = json!({ "id": pit_id });
        let response = self
            .send("/_pit", &[], |http, url| http.delete(url).json(&body))
            .await?;
        Self::checked(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::MergeScript;
    use archer_config::BulkConfig;

    fn config(hosts: Vec<&str>) -> SearchConfig {
        SearchConfig {
            hosts: hosts.into_iter().map(String::from).collect(),
            username: None,
            password: None,
            index: "archer".into(),
            bulk: BulkConfig::default(),
        }
    }

    #[test]
    fn bulk_body_is_ndjson_update_pairs() {
        let body = ElasticsearchClient::bulk_body(&[BulkItem {
            id: "abc".into(),
            script: MergeScript::Ports,
            params: json!({"ip": "10.0.0.1"}),
        }])
        .unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["update"]["_id"], "abc");
        assert_eq!(lines[1]["scripted_upsert"], true);
        assert_eq!(lines[1]["script"]["lang"], "painless");
        assert_eq!(lines[1]["script"]["params"]["ip"], "10.0.0.1");
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn hosts_rotate() {
        let client =
            ElasticsearchClient::new(&config(vec!["http://a:9200", "http://b:9200"])).unwrap();
        let first = client.url("/_search", &[]).unwrap();
        let second = client.url("/_search", &[]).unwrap();
        assert_ne!(first.host_str(), second.host_str());
        assert_eq!(first.path(), "/_search");
    }

    #[test]
    fn rejects_bad_hosts() {
        assert!(ElasticsearchClient::new(&config(vec![])).is_err());
        assert!(ElasticsearchClient::new(&config(vec!["not a url"])).is_err());
    }
}
