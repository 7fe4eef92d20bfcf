//! Stage fan-out: page through indexed results and hand batches of targets
//! to the scheduler.

use std::future::Future;

use archer_model::{ScanId, TaskId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ArcherError, Result};
use crate::search::{SearchHit, SearchIndex, SearchQuery, stream_hits};

/// Largest number of targets handed to the scheduler at once.
pub const MAX_BATCH: usize = 50_000;

const HIT_BUFFER: usize = 256;

/// Documents holding the ports one masscan task discovered.
pub fn open_ports_query(scan: &ScanId, task: &TaskId) -> SearchQuery {
    SearchQuery::new(
        format!("scan:{scan} AND ports.metadata.task:{task}"),
        &["ip", "ports.port", "timestamp"],
    )
}

/// Documents holding the services one httpx task probed.
pub fn http_services_query(scan: &ScanId, task: &TaskId) -> SearchQuery {
    SearchQuery::new(
        format!("scan:{scan} AND http.metadata.task:{task}"),
        &["ip", "http.port", "http.scheme", "http.metadata.task", "timestamp"],
    )
}

/// `ip:port` for every port recorded on the document.
pub fn open_port_targets(hit: &SearchHit) -> Vec<String> {
    let Some(ip) = hit.source.get("ip").and_then(Value::as_str) else {
        return Vec::new();
    };
    hit.source
        .get("ports")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("port").and_then(Value::as_u64))
        .map(|port| format!("{ip}:{port}"))
        .collect()
}

/// `scheme://ip:port` for every service `task` probed on the document.
pub fn http_service_targets(hit: &SearchHit, task: &TaskId) -> Vec<String> {
    let Some(ip) = hit.source.get("ip").and_then(Value::as_str) else {
        return Vec::new();
    };
    hit.source
        .get("http")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|entry| {
            entry
                .pointer("/metadata/task")
                .and_then(Value::as_str)
                .is_some_and(|owner| owner == task.as_str())
        })
        .filter_map(|entry| {
            let port = entry.get("port").and_then(Value::as_u64)?;
            let scheme = entry.get("scheme").and_then(Value::as_str)?;
            Some(format!("{}://{ip}:{port}", scheme.to_ascii_lowercase()))
        })
        .collect()
}

/// Stream every hit of `query`, turn each into targets with `extract`, and
/// call `submit` for every full batch plus the final partial one.
///
/// Returns the sum of what `submit` returned. Zero hits submit nothing.
pub async fn fan_out<E, S, Fut>(
    index: &dyn SearchIndex,
    query: &SearchQuery,
    cancel: &CancellationToken,
    batch_size: usize,
    extract: E,
    submit: S,
) -> Result<u64>
where
    E: Fn(&SearchHit) -> Vec<String>,
    S: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let scope = cancel.child_token();
    let (tx, rx) = mpsc::channel(HIT_BUFFER);

    let producer = async {
        let outcome = stream_hits(index, query, tx, &scope).await;
        if outcome.is_err() {
            scope.cancel();
        }
        outcome
    };
    let consumer = async {
        let batch_size = batch_size.clamp(1, MAX_BATCH);
        let outcome = batch_targets(rx, &scope, batch_size, extract, submit).await;
        if outcome.is_err() {
            scope.cancel();
        }
        outcome
    };

    let (hits, batched) = tokio::join!(producer, consumer);
    let (hits, (targets, scheduled)) = match (hits, batched) {
        (Ok(hits), Ok(batched)) => (hits, batched),
        // Either side failing cancels the other; report the root cause.
        (_, Err(err)) if !matches!(err, ArcherError::Cancelled) => return Err(err),
        (Err(err), _) | (Ok(_), Err(err)) => return Err(err),
    };
    info!(hits, targets, scheduled, query = %query.query, "fan-out finished");
    Ok(scheduled)
}

async fn batch_targets<E, S, Fut>(
    mut rx: mpsc::Receiver<SearchHit>,
    scope: &CancellationToken,
    batch_size: usize,
    extract: E,
    mut submit: S,
) -> Result<(u64, u64)>
where
    E: Fn(&SearchHit) -> Vec<String>,
    S: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let mut batch = Vec::new();
    let mut targets = 0u64;
    let mut scheduled = 0u64;

    while let Some(hit) = rx.recv().await {
        if scope.is_cancelled() {
            return Err(ArcherError::Cancelled);
        }
        for target in extract(&hit) {
            batch.push(target);
            targets += 1;
            if batch.len() == batch_size {
                debug!(size = batch.len(), "submitting full batch");
                scheduled += submit(std::mem::take(&mut batch)).await?;
            }
        }
    }

    // The producer closes the channel on failure too.
    if scope.is_cancelled() {
        return Err(ArcherError::Cancelled);
    }
    if !batch.is_empty() {
        debug!(size = batch.len(), "submitting final batch");
        scheduled += submit(batch).await?;
    }
    Ok((targets, scheduled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{BulkItem, InMemorySearchIndex, MergeScript};
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    async fn seeded(docs: usize) -> InMemorySearchIndex {
        let index = InMemorySearchIndex::new();
        let items: Vec<BulkItem> = (0..docs)
            .map(|i| BulkItem {
                id: format!("doc{i}"),
                script: MergeScript::Ports,
                params: json!({
                    "ip": format!("10.0.0.{i}"),
                    "port": {"port": 80, "metadata": {"module": "masscan", "task": "t1"}},
                    "scan": "s1",
                    "timestamp": format!("2024-01-01T00:00:{i:02}.000Z"),
                }),
            })
            .collect();
        index.bulk(&items).await.unwrap();
        index
    }

    fn ips(hit: &SearchHit) -> Vec<String> {
        hit.source
            .get("ip")
            .and_then(Value::as_str)
            .map(|ip| vec![ip.to_string()])
            .unwrap_or_default()
    }

    #[test]
    fn targets_from_documents() {
        let hit = SearchHit {
            id: "d".into(),
            source: json!({
                "ip": "10.0.0.5",
                "ports": [{"port": 80}, {"port": 8443}],
                "http": [
                    {"port": 80, "scheme": "HTTP", "metadata": {"task": "t2"}},
                    {"port": 8443, "scheme": "https", "metadata": {"task": "other"}},
                ],
            }),
            sort: Vec::new(),
        };
        assert_eq!(open_port_targets(&hit), vec!["10.0.0.5:80", "10.0.0.5:8443"]);
        assert_eq!(
            http_service_targets(&hit, &TaskId::from_raw("t2")),
            vec!["http://10.0.0.5:80"]
        );
    }

    #[tokio::test]
    async fn flushes_full_and_partial_batches() {
        let index = seeded(7).await;
        let batches = Mutex::new(Vec::new());
        let scheduled = fan_out(
            &index,
            &SearchQuery::new("scan:s1", &["ip"]),
            &CancellationToken::new(),
            3,
            ips,
            |batch| {
                batches.lock().push(batch.len());
                async { Ok(1) }
            },
        )
        .await
        .unwrap();

        assert_eq!(scheduled, 3);
        assert_eq!(*batches.lock(), vec![3, 3, 1]);
        assert_eq!(index.open_pits(), 0);
    }

    #[tokio::test]
    async fn no_hits_schedules_nothing() {
        let index = seeded(2).await;
        let scheduled = fan_out(
            &index,
            &SearchQuery::new("scan:other", &["ip"]),
            &CancellationToken::new(),
            MAX_BATCH,
            ips,
            |_| async { Ok(1) },
        )
        .await
        .unwrap();
        assert_eq!(scheduled, 0);
    }

    #[tokio::test]
    async fn submit_failure_closes_the_pit() {
        let index = seeded(5).await;
        let err = fan_out(
            &index,
            &SearchQuery::new("scan:s1", &["ip"]),
            &CancellationToken::new(),
            2,
            ips,
            |_| async { Err(ArcherError::Queue("queue unavailable".into())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ArcherError::Queue(_)));
        assert_eq!(index.open_pits(), 0);
    }
}
