//! Newline-delimited job host.
//!
//! Reads `{"id", "input": {"encrypted_input"}}` lines, runs each job on the
//! worker, and writes `{"id", "output": chunk}` lines followed by one
//! `{"id", "status"}` line per job. Output lines of concurrent jobs
//! interleave; each carries its job id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::shutdown::{ShutdownCoordinator, ShutdownResult};
use crate::worker::{ErrorKind, Job, JobState, OutputChunk, StreamItem, Worker};

/// A job pulls its next increment only after its previous line was taken
/// by the writer.
const OUTPUT_BUFFER: usize = 1;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub max_concurrency: usize,
    pub shutdown_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to read job input: {0}")]
    Read(std::io::Error),

    #[error("failed to write job output: {0}")]
    Write(std::io::Error),
}

/// Totals for one host session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostReport {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Completed,
    Failed,
}

#[derive(Serialize)]
struct OutputLine<'a> {
    id: &'a str,
    output: &'a OutputChunk,
}

#[derive(Serialize)]
struct StatusLine<'a> {
    id: &'a str,
    status: JobStatus,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Serve jobs from `reader` until EOF or `shutdown`, then drain.
pub async fn serve<R, W>(
    worker: Worker,
    reader: R,
    writer: W,
    config: &HostConfig,
    shutdown: CancellationToken,
) -> Result<HostReport, HostError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(OUTPUT_BUFFER);
    let writer_task = tokio::spawn(write_lines(writer, rx));

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let coordinator = ShutdownCoordinator::new();
    let counters = Arc::new(Counters::default());
    let mut jobs = JoinSet::new();
    let mut lines = reader.lines();

    info!(max_concurrency = config.max_concurrency, "host accepting jobs");
    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.map_err(HostError::Read)?,
        };
        let Some(line) = line else {
            debug!("job input closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let job = match serde_json::from_str::<Job>(line) {
            Ok(job) => job,
            Err(e) => {
                let id = uuid::Uuid::new_v4().to_string();
                warn!(job_id = %id, error = %e, "unreadable job line");
                let chunk = StreamItem::error(ErrorKind::BadRequest, format!("job is not valid JSON: {e}"))
                    .into_chunk();
                send_line(&tx, &OutputLine { id: &id, output: &chunk }).await;
                send_line(&tx, &StatusLine { id: &id, status: JobStatus::Failed }).await;
                counters.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => permit,
        };
        let (Ok(permit), Some(guard)) = (permit, coordinator.track()) else {
            break;
        };

        let worker = worker.clone();
        let tx = tx.clone();
        let counters = Arc::clone(&counters);
        jobs.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            run_job(&worker, job, &tx, &counters).await;
        });
    }

    info!(in_flight = coordinator.in_flight_count(), "host draining");
    if let ShutdownResult::Timeout { remaining } = coordinator.initiate(config.shutdown_timeout).await
    {
        warn!(remaining, "drain timed out, cancelling remaining jobs");
        worker.shutdown_token().cancel();
    }
    while jobs.join_next().await.is_some() {}

    drop(tx);
    match writer_task.await {
        Ok(result) => result.map_err(HostError::Write)?,
        Err(e) => return Err(HostError::Write(std::io::Error::other(e.to_string()))),
    }

    let report = HostReport {
        completed: counters.completed.load(Ordering::Relaxed),
        failed: counters.failed.load(Ordering::Relaxed),
    };
    info!(completed = report.completed, failed = report.failed, "host stopped");
    Ok(report)
}

async fn run_job(worker: &Worker, job: Job, tx: &mpsc::Sender<String>, counters: &Counters) {
    let mut run = worker.start(job);
    let id = run.job_id().to_string();
    while let Some(item) = run.next_item().await {
        let chunk = item.into_chunk();
        if !send_line(tx, &OutputLine { id: &id, output: &chunk }).await {
            // Output is gone; dropping the run cancels the engine work.
            return;
        }
    }
    let status = match run.state() {
        JobState::Completed => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
            JobStatus::Completed
        }
        _ => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            JobStatus::Failed
        }
    };
    send_line(tx, &StatusLine { id: &id, status }).await;
}

async fn send_line<T: Serialize>(tx: &mpsc::Sender<String>, line: &T) -> bool {
    match serde_json::to_string(line) {
        Ok(text) => tx.send(text).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode output line");
            false
        }
    }
}

async fn write_lines<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}
