//! Runs an external tool for one task and streams its output into the
//! bulk indexer.
//!
//! Four activities share one cancellation scope: stdout parsing, stderr
//! relay, indexing, and waiting for the child to exit. The first failure
//! cancels the rest; the count of documents already forwarded survives in
//! the returned [`ArcherError::TaskAborted`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use super::ScanModule;
use crate::context::TaskContext;
use crate::error::{ArcherError, Result};
use crate::search::{BulkIndexer, BulkItem};

/// Depth of the channel between the stdout parser and the indexer.
const RESULT_BUFFER: usize = 64;

/// A file the tool reads, written before launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub contents: String,
}

/// Everything needed to launch a module's tool for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub artifacts: Vec<Artifact>,
    /// Leave artifacts on disk after the run.
    pub persist_artifacts: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            artifacts: Vec::new(),
            persist_artifacts: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn artifact(mut self, path: PathBuf, contents: impl Into<String>) -> Self {
        self.artifacts.push(Artifact {
            path,
            contents: contents.into(),
        });
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist_artifacts = persist;
        self
    }
}

/// Launch `invocation` and index everything `module` parses from stdout.
///
/// Returns the number of documents handed to `indexer`. On failure the
/// error is wrapped in [`ArcherError::TaskAborted`] with that count.
pub async fn execute<M: ScanModule + ?Sized>(
    module: &M,
    ctx: &TaskContext,
    invocation: Invocation,
    indexer: &BulkIndexer,
) -> Result<u64> {
    let span = ctx.span.clone();
    async {
        for artifact in &invocation.artifacts {
            tokio::fs::write(&artifact.path, &artifact.contents).await?;
            info!(path = %artifact.path.display(), "wrote invocation artifact");
        }

        let forwarded = AtomicU64::new(0);
        let outcome = run(module, ctx, &invocation, indexer, &forwarded).await;

        if !invocation.persist_artifacts {
            for artifact in &invocation.artifacts {
                if let Err(err) = tokio::fs::remove_file(&artifact.path).await {
                    warn!(
                        path = %artifact.path.display(),
                        error = %err,
                        "failed to remove artifact"
                    );
                }
            }
        }

        let processed = forwarded.load(Ordering::SeqCst);
        match outcome {
            Ok(()) => {
                info!(results = processed, "tool finished");
                Ok(processed)
            }
            Err(err) => Err(ArcherError::TaskAborted {
                processed,
                source: Box::new(err),
            }),
        }
    }
    .instrument(span)
    .await
}

async fn run<M: ScanModule + ?Sized>(
    module: &M,
    ctx: &TaskContext,
    invocation: &Invocation,
    indexer: &BulkIndexer,
    forwarded: &AtomicU64,
) -> Result<()> {
    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            ArcherError::ModuleExecution(format!(
                "failed to start {}: {err}",
                invocation.program
            ))
        })?;
    info!(program = %invocation.program, args = ?invocation.args, "started tool");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ArcherError::ModuleExecution("tool stdout was not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ArcherError::ModuleExecution("tool stderr was not captured".into()))?;

    let scope = ctx.child_token();
    let (tx, rx) = mpsc::channel::<BulkItem>(RESULT_BUFFER);

    let result = tokio::try_join!(
        guard(&scope, read_stdout(module, ctx, stdout, tx.clone(), &scope)),
        guard(&scope, relay_stderr(module, ctx, stderr, &scope)),
        guard(&scope, index_results(rx, indexer, forwarded, &scope)),
        guard(&scope, wait_for_exit(&invocation.program, child, tx, &scope)),
    );
    scope.cancel();
    result.map(|_| ())
}

/// Cancel the shared scope as soon as `activity` fails.
async fn guard<T>(
    scope: &CancellationToken,
    activity: impl Future<Output = Result<T>>,
) -> Result<T> {
    let outcome = activity.await;
    if outcome.is_err() {
        scope.cancel();
    }
    outcome
}

/// Read the next line into `buf` without its terminator. Returns `false`
/// at end of stream.
async fn read_raw_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<bool> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    Ok(true)
}

async fn read_stdout<M: ScanModule + ?Sized>(
    module: &M,
    ctx: &TaskContext,
    stdout: ChildStdout,
    tx: mpsc::Sender<BulkItem>,
    scope: &CancellationToken,
) -> Result<()> {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        let more = tokio::select! {
            _ = scope.cancelled() => return Err(ArcherError::Cancelled),
            read = read_raw_line(&mut reader, &mut buf) => read?,
        };
        if !more {
            return Ok(());
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, bytes = buf.len(), "skipping tool output that is not UTF-8");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Some(item) = module.process_stdout(ctx, line) {
            tokio::select! {
                _ = scope.cancelled() => return Err(ArcherError::Cancelled),
                sent = tx.send(item) => sent.map_err(|_| ArcherError::Cancelled)?,
            }
        }
    }
}

async fn relay_stderr<M: ScanModule + ?Sized>(
    module: &M,
    ctx: &TaskContext,
    stderr: ChildStderr,
    scope: &CancellationToken,
) -> Result<()> {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        let read = tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            read = read_raw_line(&mut reader, &mut buf) => read,
        };
        match read {
            Ok(true) => {
                let line = String::from_utf8_lossy(&buf);
                if !line.trim().is_empty() {
                    module.process_stderr(ctx, &line);
                }
            }
            Ok(false) => return Ok(()),
            Err(err) => {
                warn!(error = %err, "stopped reading tool stderr");
                return Ok(());
            }
        }
    }
}

async fn index_results(
    mut rx: mpsc::Receiver<BulkItem>,
    indexer: &BulkIndexer,
    forwarded: &AtomicU64,
    scope: &CancellationToken,
) -> Result<()> {
    loop {
        let item = tokio::select! {
            _ = scope.cancelled() => return Err(ArcherError::Cancelled),
            item = rx.recv() => item,
        };
        let Some(item) = item else {
            return Ok(());
        };
        indexer.add(item).await?;
        forwarded.fetch_add(1, Ordering::SeqCst);
    }
}

/// Wait for the child, then drop the last sender so indexing can finish.
async fn wait_for_exit(
    program: &str,
    mut child: Child,
    tx: mpsc::Sender<BulkItem>,
    scope: &CancellationToken,
) -> Result<()> {
    let status = tokio::select! {
        _ = scope.cancelled() => {
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill tool");
            }
            return Err(ArcherError::Cancelled);
        }
        status = child.wait() => status?,
    };
    drop(tx);
    debug!(%status, "tool exited");

    if status.success() {
        Ok(())
    } else {
        Err(ArcherError::ModuleExecution(format!(
            "{program} exited with {status}"
        )))
    }
}
