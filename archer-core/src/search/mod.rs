//! Search-index abstraction: scripted bulk upserts and point-in-time
//! pagination over the results index.

pub mod elastic;
pub mod indexer;
pub mod memory;
pub mod scripts;

use std::fmt;

use archer_model::ScanId;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ArcherError, Result};

pub use elastic::ElasticsearchClient;
pub use indexer::{BulkIndexer, IndexerSummary};
pub use memory::InMemorySearchIndex;
pub use scripts::MergeScript;

/// One scripted upsert destined for the bulk endpoint.
#[derive(Debug, Clone)]
pub struct BulkItem {
    pub id: String,
    pub script: MergeScript,
    pub params: Value,
}

impl BulkItem {
    /// Rough NDJSON size, used for flush thresholds.
    pub fn estimated_size(&self) -> usize {
        self.id.len()
            + self.script.source().len()
            + serde_json::to_vec(&self.params)
                .map(|bytes| bytes.len())
                .unwrap_or_default()
            + 96
    }
}

/// Per-document result of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOutcome {
    pub id: String,
    pub error: Option<String>,
}

impl BulkOutcome {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One page request against an open point in time.
#[derive(Debug, Clone)]
pub struct SearchAfterRequest {
    pub pit_id: String,
    pub keep_alive: String,
    /// Lucene query string.
    pub query: String,
    pub size: usize,
    pub source: Vec<String>,
    /// `field:direction`; must be strictly ordered for pagination to end.
    pub sort: String,
    pub search_after: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source", default)]
    pub source: Value,
    #[serde(default)]
    pub sort: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    /// Refreshed point-in-time id, when the server returned one.
    pub pit_id: Option<String>,
    pub hits: Vec<SearchHit>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync + fmt::Debug {
    async fn bulk(&self, items: &[BulkItem]) -> Result<Vec<BulkOutcome>>;

    async fn open_point_in_time(&self, keep_alive: &str) -> Result<String>;

    async fn search_after(&self, request: &SearchAfterRequest) -> Result<SearchPage>;

    async fn close_point_in_time(&self, pit_id: &str) -> Result<()>;
}

/// Identity of a full-index scan.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub source: Vec<String>,
    pub sort: String,
    pub page_size: usize,
    pub keep_alive: String,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, source: &[&str]) -> Self {
        Self {
            query: query.into(),
            source: source.iter().map(|field| field.to_string()).collect(),
            sort: "timestamp:desc".into(),
            page_size: 100,
            keep_alive: "1m".into(),
        }
    }
}

/// Stable document id for a target within a scan.
pub fn document_id(ip: &str, scan: &ScanId) -> String {
    let mut hasher = Sha1::new();
    hasher.update(ip.as_bytes());
    hasher.update(scan.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Page through every hit of `query` and push each onto `tx`.
///
/// The point in time is always closed, including on error. Returns the
/// number of hits sent.
pub async fn stream_hits(
    index: &dyn SearchIndex,
    query: &SearchQuery,
    tx: mpsc::Sender<SearchHit>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut pit_id = index.open_point_in_time(&query.keep_alive).await?;
    let outcome = page_through(index, query, &tx, cancel, &mut pit_id).await;
    if let Err(err) = index.close_point_in_time(&pit_id).await {
        warn!(error = %err, "failed to close point in time");
    }
    outcome
}

async fn page_through(
    index: &dyn SearchIndex,
    query: &SearchQuery,
    tx: &mpsc::Sender<SearchHit>,
    cancel: &CancellationToken,
    pit_id: &mut String,
) -> Result<u64> {
    let mut sent = 0u64;
    let mut search_after: Option<Vec<Value>> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(ArcherError::Cancelled);
        }

        let request = SearchAfterRequest {
            pit_id: pit_id.clone(),
            keep_alive: query.keep_alive.clone(),
            query: query.query.clone(),
            size: query.page_size,
            source: query.source.clone(),
            sort: query.sort.clone(),
            search_after: search_after.take(),
        };
        let page = index.search_after(&request).await?;
        if let Some(refreshed) = page.pit_id {
            *pit_id = refreshed;
        }
        let Some(last) = page.hits.last() else {
            break;
        };
        if last.sort.is_empty() {
            warn!(query = %query.query, "hit without sort values; stopping pagination");
            search_after = None;
        } else {
            search_after = Some(last.sort.clone());
        }
        debug!(hits = page.hits.len(), "fetched search page");

        let terminal = search_after.is_none();
        for hit in page.hits {
            tx.send(hit).await.map_err(|_| ArcherError::Cancelled)?;
            sent += 1;
        }
        if terminal {
            break;
        }
    }

    Ok(sent)
}
