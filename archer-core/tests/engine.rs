use std::sync::Arc;
use std::time::Duration;

use archer_config::{BulkConfig, HttpxConfig, MasscanConfig, NucleiConfig};
use archer_core::modules::{Invocation, engine};
use archer_core::search::{BulkIndexer, InMemorySearchIndex, document_id};
use archer_core::{ArcherError, HttpxModule, MasscanModule, NucleiModule, TaskContext};
use archer_model::{ScanId, TaskId, WorkerId};
use tokio_util::sync::CancellationToken;

const OUTPUT: &str = "Discovered open port 80/tcp on 10.0.0.1\n\
Discovered open port 443/tcp on 10.0.0.1\n\
rate:  0.00-kpps, waiting 0-secs\n\
Discovered open port 22/tcp on 10.0.0.2\n";

fn context(cancel: CancellationToken) -> TaskContext {
    context_for("masscan", cancel)
}

fn context_for(module: &str, cancel: CancellationToken) -> TaskContext {
    TaskContext::new(
        WorkerId::from_raw("engine-test"),
        module,
        module,
        ScanId::from_raw("scan00000001"),
        TaskId::from_raw("task00000001"),
        module,
        0,
        25,
        cancel,
    )
}

fn indexer(index: &Arc<InMemorySearchIndex>) -> BulkIndexer {
    BulkIndexer::new(
        index.clone(),
        &BulkConfig {
            flush_interval: Duration::from_millis(20),
            ..BulkConfig::default()
        },
    )
}

fn printing(script: &str) -> Invocation {
    Invocation::new("sh").arg("-c").arg(script)
}

/// A tool that writes `output` verbatim to stdout.
fn emitting(dir: &tempfile::TempDir, output: &[u8]) -> Invocation {
    let path = dir.path().join("stdout.bin");
    std::fs::write(&path, output).unwrap();
    Invocation::new("cat").arg(path.display().to_string())
}

#[tokio::test]
async fn parses_every_valid_line_and_skips_noise() {
    let index = Arc::new(InMemorySearchIndex::new());
    let bulk = indexer(&index);
    let module = MasscanModule::new(MasscanConfig::default());
    let ctx = context(CancellationToken::new());

    let script = format!("printf '{}'", OUTPUT.replace('\n', "\\n"));
    let processed = engine::execute(&module, &ctx, printing(&script), &bulk)
        .await
        .unwrap();
    let summary = bulk.close().await.unwrap();

    assert_eq!(processed, 3);
    assert_eq!(summary.indexed, 3);
    assert_eq!(summary.failed, 0);

    let first = index
        .document(&document_id("10.0.0.1", &ctx.scan_id))
        .expect("10.0.0.1 indexed");
    assert_eq!(first["ports"].as_array().unwrap().len(), 2);
    assert!(index.document(&document_id("10.0.0.2", &ctx.scan_id)).is_some());
}

#[tokio::test]
async fn artifacts_are_removed_unless_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let module = MasscanModule::new(MasscanConfig::default());
    let ctx = context(CancellationToken::new());
    let index = Arc::new(InMemorySearchIndex::new());

    let scratch = dir.path().join("scratch.conf");
    let invocation = printing(&format!("test -f {}", scratch.display()))
        .artifact(scratch.clone(), "range = 10.0.0.1\n");
    let bulk = indexer(&index);
    engine::execute(&module, &ctx, invocation, &bulk)
        .await
        .unwrap();
    bulk.close().await.unwrap();
    assert!(!scratch.exists());

    let kept = dir.path().join("kept.conf");
    let invocation = printing("true")
        .artifact(kept.clone(), "range = 10.0.0.1\n")
        .persist(true);
    let bulk = indexer(&index);
    engine::execute(&module, &ctx, invocation, &bulk)
        .await
        .unwrap();
    bulk.close().await.unwrap();
    assert!(kept.exists());
}

#[tokio::test]
async fn non_zero_exit_aborts_with_the_processed_count() {
    let index = Arc::new(InMemorySearchIndex::new());
    let bulk = indexer(&index);
    let module = MasscanModule::new(MasscanConfig::default());
    let ctx = context(CancellationToken::new());

    let err = engine::execute(
        &module,
        &ctx,
        printing(
            "printf 'Discovered open port 80/tcp on 10.0.0.1\\n'; \
             printf 'Discovered open port 22/tcp on 10.0.0.2\\n'; sleep 0.5; exit 3",
        ),
        &bulk,
    )
    .await
    .unwrap_err();
    bulk.close().await.unwrap();

    match err {
        ArcherError::TaskAborted { processed, source } => {
            assert_eq!(processed, 2);
            assert!(matches!(*source, ArcherError::ModuleExecution(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_binary_is_a_module_error() {
    let index = Arc::new(InMemorySearchIndex::new());
    let bulk = indexer(&index);
    let module = MasscanModule::new(MasscanConfig::default());
    let ctx = context(CancellationToken::new());

    let err = engine::execute(
        &module,
        &ctx,
        Invocation::new("archer-no-such-tool"),
        &bulk,
    )
    .await
    .unwrap_err();
    bulk.close().await.unwrap();

    assert_eq!(err.processed(), Some(0));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn cancellation_stops_a_long_running_tool() {
    let index = Arc::new(InMemorySearchIndex::new());
    let bulk = indexer(&index);
    let module = MasscanModule::new(MasscanConfig::default());
    let cancel = CancellationToken::new();
    let ctx = context(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        engine::execute(&module, &ctx, printing("sleep 30"), &bulk),
    )
    .await
    .expect("cancellation ends the run")
    .unwrap_err();
    bulk.close().await.unwrap();

    assert!(matches!(
        err,
        ArcherError::TaskAborted { ref source, .. } if matches!(**source, ArcherError::Cancelled)
    ));
}

#[tokio::test]
async fn undecodable_line_is_skipped_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(InMemorySearchIndex::new());
    let bulk = indexer(&index);
    let module = MasscanModule::new(MasscanConfig::default());
    let ctx = context(CancellationToken::new());

    let mut output = Vec::new();
    output.extend_from_slice(b"Discovered open port 80/tcp on 10.0.0.1\n");
    output.extend_from_slice(b"\xff\xfe garbled banner\n");
    output.extend_from_slice(b"Discovered open port 443/tcp on 10.0.0.1\r\n");
    output.extend_from_slice(b"Discovered open port 22/tcp on 10.0.0.2");

    let processed = engine::execute(&module, &ctx, emitting(&dir, &output), &bulk)
        .await
        .unwrap();
    let summary = bulk.close().await.unwrap();

    assert_eq!(processed, 3);
    assert_eq!(summary.indexed, 3);
    let first = index
        .document(&document_id("10.0.0.1", &ctx.scan_id))
        .expect("10.0.0.1 indexed");
    assert_eq!(first["ports"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn undecodable_stderr_does_not_stop_the_tool() {
    let index = Arc::new(InMemorySearchIndex::new());
    let bulk = indexer(&index);
    let module = MasscanModule::new(MasscanConfig::default());
    let ctx = context(CancellationToken::new());

    let script = "printf '\\377 bad\\n' >&2; \
                  printf 'Discovered open port 80/tcp on 10.0.0.1\\n'";
    let processed = engine::execute(&module, &ctx, printing(script), &bulk)
        .await
        .unwrap();
    bulk.close().await.unwrap();
    assert_eq!(processed, 1);
}

#[tokio::test]
async fn httpx_json_lines_are_indexed_as_http_services() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(InMemorySearchIndex::new());
    let bulk = indexer(&index);
    let module = HttpxModule::new(HttpxConfig::default(), index.clone());
    let ctx = context_for("httpx", CancellationToken::new());

    let output = [
        r#"{"input":"10.0.0.1:80","port":"80","scheme":"http","status_code":200,"title":"One"}"#,
        r#"{"input":"10.0.0.1:443","port":"443","scheme":"https","status_code":301}"#,
        r#"{"input":"10.0.0.2:8080","port":"8080","scheme":"http""#,
        r#"{"input":"10.0.0.3:8080","port":"8080","scheme":"http","status_code":404}"#,
    ]
    .join("\n");

    let processed = engine::execute(&module, &ctx, emitting(&dir, output.as_bytes()), &bulk)
        .await
        .unwrap();
    let summary = bulk.close().await.unwrap();

    assert_eq!(processed, 3);
    assert_eq!(summary.indexed, 3);
    assert_eq!(summary.failed, 0);
    let first = index
        .document(&document_id("10.0.0.1", &ctx.scan_id))
        .expect("10.0.0.1 indexed");
    let services = first["http"].as_array().unwrap();
    assert_eq!(services.len(), 2);
    assert_eq!(services[0]["title"], "One");
    assert!(index.document(&document_id("10.0.0.2", &ctx.scan_id)).is_none());
    assert!(index.document(&document_id("10.0.0.3", &ctx.scan_id)).is_some());
}

#[tokio::test]
async fn nuclei_json_lines_are_indexed_as_detections() {
    let dir = tempfile::tempdir().unwrap();
    let index = Arc::new(InMemorySearchIndex::new());
    let bulk = indexer(&index);
    let module = NucleiModule::new(NucleiConfig::default(), index.clone());
    let ctx = context_for("nuclei", CancellationToken::new());

    let output = [
        r#"{"template-id":"git-config","matched-at":"http://10.0.0.3:8080/.git/config"}"#,
        r#"{"template-id":"dns-caa","matched-at":"example.test","info":{}}"#,
        r#"{"template-id":"tech-detect","matched-at":"https://10.0.0.3:443/"}"#,
        r#"{"template-id":"open-redirect","matched-at":"http://10.0.0.4:80/r"}"#,
    ]
    .join("\n");

    let processed = engine::execute(&module, &ctx, emitting(&dir, output.as_bytes()), &bulk)
        .await
        .unwrap();
    let summary = bulk.close().await.unwrap();

    assert_eq!(processed, 3);
    assert_eq!(summary.indexed, 3);
    let doc = index
        .document(&document_id("10.0.0.3", &ctx.scan_id))
        .expect("10.0.0.3 indexed");
    let detections = doc["detections"].as_array().unwrap();
    assert_eq!(detections.len(), 2);
    assert_eq!(detections[0]["template_id"], "git-config");
    assert_eq!(detections[0]["port"], 8080);
}
