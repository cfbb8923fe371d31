use crate::config::PipelineConfig;
use crate::types::{Arrival, Job};
use anyhow::{Context, Result};
use async_channel::Sender;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, info, warn};

/// Watch the input directory until shutdown, dispatching one arrival per
/// file creation event.
pub async fn watch(
    config: Arc<PipelineConfig>,
    dispatcher: Dispatcher,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let (event_tx, event_rx) = async_channel::unbounded::<notify::Result<Event>>();
    let mut watcher = notify::recommended_watcher(move |event| {
        if event_tx.send_blocking(event).is_err() {
            debug!("watch event dropped because the watcher loop is gone");
        }
    })
    .context("Failed to create directory watcher")?;

    watcher
        .watch(&config.input_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", config.input_dir.display()))?;

    info!(dir = %config.input_dir.display(), "Watching");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Watcher stopping");
                break;
            }
            event = event_rx.recv() => match event {
                Ok(Ok(event)) => {
                    for path in arrival_paths(&event) {
                        if let Some(arrival) = arrival_for(&path, &config.input_dir) {
                            dispatcher.dispatch(arrival);
                        }
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "Watch error"),
                Err(_) => break,
            }
        }
    }

    drop(watcher);
    Ok(())
}

/// Hands arrivals to the job queue once they have settled.
///
/// At most `queue_capacity` files are probed at a time; further arrivals
/// wait for a permit in their own task, so the watcher loop never blocks.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    arrivals: Sender<Job>,
    probes: Arc<Semaphore>,
    attempts: u32,
    delay: Duration,
}

impl Dispatcher {
    pub fn new(config: &PipelineConfig, arrivals: Sender<Job>) -> Self {
        Self::with_limit(config, arrivals, config.queue_capacity)
    }

    fn with_limit(config: &PipelineConfig, arrivals: Sender<Job>, limit: usize) -> Self {
        Self {
            arrivals,
            probes: Arc::new(Semaphore::new(limit.max(1))),
            attempts: config.stabilize_attempts,
            delay: config.stabilize_delay,
        }
    }

    /// Wait for the file to settle in its own task, then queue it for a
    /// worker. The send blocks only that task when the queue is full.
    pub fn dispatch(&self, arrival: Arrival) {
        let arrivals = self.arrivals.clone();
        let probes = Arc::clone(&self.probes);
        let attempts = self.attempts;
        let delay = self.delay;

        tokio::spawn(async move {
            let settled = match probes.acquire_owned().await {
                Ok(_permit) => wait_until_stable(&arrival.source_path, attempts, delay).await,
                Err(_) => return,
            };
            if !settled {
                warn!(file = %arrival.name, "File did not settle, dispatching anyway");
            }
            debug!(file = %arrival.name, "Queueing arrival");
            if arrivals.send(Job::Arrive(arrival)).await.is_err() {
                debug!("Arrival queue closed");
            }
        });
    }
}

/// Paths a notify event reports as newly present. Last-write and other
/// modification events are dropped so a file is handled once.
///
/// A rename inside the watched directory arrives as `To` and again as
/// `Both`; only `To` is kept. Backends that cannot pair renames report
/// `Any` for both ends, so only the end that still exists counts.
pub fn arrival_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().filter(|p| p.is_file()).cloned().collect()
        }
        _ => Vec::new(),
    }
}

/// Build an arrival for a path directly inside the input directory
pub fn arrival_for(path: &Path, input_dir: &Path) -> Option<Arrival> {
    if path.parent() != Some(input_dir) {
        return None;
    }
    let name = path.file_name()?.to_str()?.to_string();
    Some(Arrival {
        name,
        source_path: path.to_path_buf(),
    })
}

/// Poll until the file can be opened for reading and has content.
///
/// Returns false if it never did within `attempts` probes; the caller
/// proceeds regardless.
pub async fn wait_until_stable(path: &Path, attempts: u32, delay: Duration) -> bool {
    for attempt in 1..=attempts.max(1) {
        match probe(path) {
            Ok(len) if len > 0 => return true,
            Ok(_) => debug!(path = %path.display(), attempt, "File still empty"),
            Err(e) => debug!(path = %path.display(), attempt, error = %e, "File not ready"),
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    false
}

fn probe(path: &Path) -> io::Result<u64> {
    let mut options = OpenOptions::new();
    options.read(true);
    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        // fails while the writer still has the file open
        options.share_mode(0);
    }
    let file = options.open(path)?;
    Ok(file.metadata()?.len())
}
