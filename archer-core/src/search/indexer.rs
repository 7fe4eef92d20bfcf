use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use archer_config::BulkConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, warn};

use super::{BulkItem, SearchIndex};
use crate::error::{ArcherError, Result};

/// Documents buffered per flushing task before `add` starts waiting.
const CHANNEL_DEPTH: usize = 1024;

#[derive(Debug, Default)]
struct IndexerStats {
    added: AtomicU64,
    indexed: AtomicU64,
    failed: AtomicU64,
}

/// Final counters of a closed indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexerSummary {
    pub added: u64,
    pub indexed: u64,
    pub failed: u64,
}

/// Batches scripted upserts in front of a [`SearchIndex`].
///
/// `add` waits when the flushing tasks fall behind. Every document ends up
/// in exactly one of the `indexed` or `failed` counters once the indexer is
/// closed; failures are logged per document.
pub struct BulkIndexer {
    senders: Vec<mpsc::Sender<BulkItem>>,
    next: AtomicUsize,
    flushers: Vec<JoinHandle<()>>,
    stats: Arc<IndexerStats>,
}

impl fmt::Debug for BulkIndexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkIndexer")
            .field("flushers", &self.flushers.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl BulkIndexer {
    pub fn new(index: Arc<dyn SearchIndex>, config: &BulkConfig) -> Self {
        let stats = Arc::new(IndexerStats::default());
        let workers = config.workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut flushers = Vec::with_capacity(workers);

        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
            senders.push(tx);
            flushers.push(tokio::spawn(run_flusher(
                Arc::clone(&index),
                rx,
                config.flush_bytes.max(1),
                config.flush_interval,
                Arc::clone(&stats),
            )));
        }

        Self {
            senders,
            next: AtomicUsize::new(0),
            flushers,
            stats,
        }
    }

    pub async fn add(&self, item: BulkItem) -> Result<()> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[slot]
            .send(item)
            .await
            .map_err(|_| ArcherError::Search("bulk indexer is closed".into()))?;
        self.stats.added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn indexed(&self) -> u64 {
        self.stats.indexed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Flush whatever is pending and wait for the flushing tasks to exit.
    pub async fn close(self) -> Result<IndexerSummary> {
        drop(self.senders);
        for flusher in self.flushers {
            flusher
                .await
                .map_err(|err| ArcherError::Internal(format!("bulk flusher panicked: {err}")))?;
        }
        Ok(IndexerSummary {
            added: self.stats.added.load(Ordering::Relaxed),
            indexed: self.stats.indexed.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        })
    }
}

async fn run_flusher(
    index: Arc<dyn SearchIndex>,
    mut rx: mpsc::Receiver<BulkItem>,
    flush_bytes: usize,
    flush_interval: Duration,
    stats: Arc<IndexerStats>,
) {
    let mut pending: Vec<BulkItem> = Vec::new();
    let mut pending_bytes = 0usize;
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    pending_bytes += item.estimated_size();
                    pending.push(item);
                    if pending_bytes >= flush_bytes {
                        flush(index.as_ref(), mem::take(&mut pending), &stats).await;
                        pending_bytes = 0;
                    }
                }
                None => {
                    flush(index.as_ref(), mem::take(&mut pending), &stats).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    flush(index.as_ref(), mem::take(&mut pending), &stats).await;
                    pending_bytes = 0;
                }
            }
        }
    }
}

async fn flush(index: &dyn SearchIndex, batch: Vec<BulkItem>, stats: &IndexerStats) {
    if batch.is_empty() {
        return;
    }

    match index.bulk(&batch).await {
        Ok(outcomes) => {
            let mut indexed = 0u64;
            let mut failed = 0u64;
            for outcome in &outcomes {
                match &outcome.error {
                    None => indexed += 1,
                    Some(reason) => {
                        failed += 1;
                        warn!(document = %outcome.id, %reason, "failed to index document");
                    }
                }
            }
            // Documents the server did not answer for count as failed.
            let missing = batch.len().saturating_sub(outcomes.len()) as u64;
            if missing > 0 {
                warn!(missing, "bulk response is missing items");
            }
            stats.indexed.fetch_add(indexed, Ordering::Relaxed);
            stats.failed.fetch_add(failed + missing, Ordering::Relaxed);
            debug!(indexed, failed = failed + missing, "flushed bulk batch");
        }
        Err(err) => {
            error!(error = %err, documents = batch.len(), "bulk request failed");
            stats
                .failed
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{InMemorySearchIndex, MergeScript};
    use serde_json::json;

    fn item(ip: &str, port: u16) -> BulkItem {
        BulkItem {
            id: ip.to_string(),
            script: MergeScript::Ports,
            params: json!({"ip": ip, "scan": "s", "timestamp": "t", "port": {"port": port}}),
        }
    }

    fn config(workers: usize) -> BulkConfig {
        BulkConfig {
            flush_bytes: 512,
            flush_interval: Duration::from_millis(50),
            pipeline: None,
            workers,
        }
    }

    #[tokio::test]
    async fn close_flushes_every_document() {
        let index = InMemorySearchIndex::new();
        let indexer = BulkIndexer::new(Arc::new(index.clone()), &config(2));
        for i in 0..40u16 {
            indexer.add(item(&format!("10.0.0.{i}"), 80)).await.unwrap();
        }
        let summary = indexer.close().await.unwrap();
        assert_eq!(
            summary,
            IndexerSummary {
                added: 40,
                indexed: 40,
                failed: 0
            }
        );
        assert_eq!(index.len(), 40);
    }

    #[tokio::test]
    async fn interval_flushes_a_partial_batch() {
        let index = InMemorySearchIndex::new();
        let mut config = config(1);
        config.flush_bytes = usize::MAX;
        let indexer = BulkIndexer::new(Arc::new(index.clone()), &config);
        indexer.add(item("10.0.0.1", 22)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(indexer.indexed(), 1);
        indexer.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_documents_are_counted_as_failed() {
        let index = InMemorySearchIndex::new();
        index.reject_bulk(true);
        let indexer = BulkIndexer::new(Arc::new(index.clone()), &config(1));
        indexer.add(item("10.0.0.1", 22)).await.unwrap();
        indexer.add(item("10.0.0.2", 22)).await.unwrap();
        let summary = indexer.close().await.unwrap();
        assert_eq!(summary.indexed, 0);
        assert_eq!(summary.failed, 2);
    }
}
