use crate::config::PipelineConfig;
use crate::pipeline::Pipeline;
use crate::pools::{spawn_worker_pool, PoolStats, StatsSummary};
use crate::stage;
use crate::state::Ledger;
use crate::types::{Arrival, Job, Recovered};
use crate::watcher::{self, Dispatcher};
use anyhow::Result;
use async_channel::{bounded, Sender};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long idle workers get to notice the closed queue before they are
/// abandoned
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Main orchestration function. Runs until the shutdown signal fires.
pub async fn run(
    config: Arc<PipelineConfig>,
    ledger: Ledger,
    shutdown_rx: broadcast::Receiver<()>,
) -> Result<StatsSummary> {
    let pipeline = Arc::new(Pipeline::new(Arc::clone(&config), ledger.clone()));
    let stats = Arc::new(PoolStats::default());

    let (job_tx, job_rx) = bounded::<Job>(config.queue_capacity);

    info!(
        input = %config.input_dir.display(),
        concurrency = config.concurrency,
        max_attempts = config.max_attempts,
        timeout_ms = config.tool.timeout.as_millis() as u64,
        "Starting pipeline"
    );

    let handles = spawn_worker_pool(
        config.concurrency,
        job_rx,
        Arc::clone(&pipeline),
        Arc::clone(&stats),
    );

    let recovered = reconcile_processing(&config, &ledger).await?;
    let resuming: HashSet<String> = recovered.iter().map(|r| r.arrival.name.clone()).collect();
    if !recovered.is_empty() {
        info!(files = recovered.len(), "Resuming files left in processing");
    }
    queue_recovered(recovered, &job_tx);

    let dispatcher = Dispatcher::new(&config, job_tx.clone());
    let pending = catch_up(&config, &resuming, &dispatcher)?;
    if pending > 0 {
        info!(files = pending, "Queued files already waiting in input");
    }

    let watched = watcher::watch(Arc::clone(&config), dispatcher, shutdown_rx).await;

    // Close the queue so idle workers exit; in-flight files stay in
    // processing and are resumed on the next start
    job_tx.close();
    wait_for_workers(handles).await;

    let summary = stats.summary();
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        duplicates = summary.duplicates,
        aborted = summary.aborted,
        "Pipeline stopped"
    );

    watched.map(|_| summary)
}

/// Build a resumption job for every file left in the processing directory,
/// and drop ledger records whose file is gone.
pub async fn reconcile_processing(
    config: &PipelineConfig,
    ledger: &Ledger,
) -> Result<Vec<Recovered>> {
    let files = stage::list_files(&config.processing_dir)?;
    let present: HashSet<&str> = files.iter().map(|(name, _)| name.as_str()).collect();

    let stale = ledger.retain(|name| present.contains(name)).await;
    if stale > 0 {
        info!(records = stale, "Dropped ledger records with no file in processing");
    }

    let suffix = format!(".{}", config.tool.sidecar_extension);
    let mut recovered = Vec::new();
    for (name, _) in &files {
        // sidecars travel with their file
        if let Some(base) = name.strip_suffix(&suffix) {
            if present.contains(base) {
                debug!(file = %name, "Skipping sidecar");
                continue;
            }
        }

        let record = ledger.get(name).await;
        let attempts_used = record.as_ref().map(|r| r.attempts).unwrap_or(0);
        let source_path = record
            .map(|r| r.source_path)
            .unwrap_or_else(|| config.input_dir.join(name));

        recovered.push(Recovered {
            arrival: Arrival {
                name: name.clone(),
                source_path,
            },
            attempts_used,
        });
    }

    Ok(recovered)
}

fn queue_recovered(recovered: Vec<Recovered>, jobs: &Sender<Job>) {
    for recovered in recovered {
        let jobs = jobs.clone();
        tokio::spawn(async move {
            if jobs.send(Job::Resume(recovered)).await.is_err() {
                debug!("Job queue closed before resume was queued");
            }
        });
    }
}

/// Dispatch files that were already in the input directory at startup
fn catch_up(
    config: &PipelineConfig,
    resuming: &HashSet<String>,
    dispatcher: &Dispatcher,
) -> Result<usize> {
    let mut queued = 0;
    for (name, source_path) in stage::list_files(&config.input_dir)? {
        if resuming.contains(&name) {
            continue;
        }
        dispatcher.dispatch(Arrival { name, source_path });
        queued += 1;
    }
    Ok(queued)
}

async fn wait_for_workers(handles: Vec<JoinHandle<()>>) {
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;

    if joined.is_err() {
        // cancels each in-flight file and kills its tool's process tree
        warn!("Abandoning in-flight files, they will resume on next start");
        for abort in aborts {
            abort.abort();
        }
    }
}
