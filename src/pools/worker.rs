use crate::pipeline::Pipeline;
use crate::types::{Job, TaskOutcome};
use async_channel::Receiver;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

/// Outcome counters shared by the workers
#[derive(Debug, Default)]
pub struct PoolStats {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    duplicates: AtomicUsize,
    aborted: AtomicUsize,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub aborted: usize,
}

impl PoolStats {
    fn record(&self, outcome: &TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Succeeded { .. } => &self.succeeded,
            TaskOutcome::Failed { .. } => &self.failed,
            TaskOutcome::Duplicate => &self.duplicates,
            TaskOutcome::Aborted { .. } => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

/// Aborts the per-file task when the worker awaiting it is cancelled
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawn a pool of pipeline workers
pub fn spawn_worker_pool(
    concurrency: usize,
    rx: Receiver<Job>,
    pipeline: Arc<Pipeline>,
    stats: Arc<PoolStats>,
) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|worker_id| {
            let rx = rx.clone();
            let pipeline = Arc::clone(&pipeline);
            let stats = Arc::clone(&stats);

            tokio::spawn(async move {
                worker(worker_id, rx, pipeline, stats).await;
            })
        })
        .collect()
}

async fn worker(
    worker_id: usize,
    rx: Receiver<Job>,
    pipeline: Arc<Pipeline>,
    stats: Arc<PoolStats>,
) {
    while let Ok(job) = rx.recv().await {
        let file = job.name().to_string();
        info!(worker = worker_id, file = %file, "Starting task");

        // each file runs in its own task so a panic only loses that file
        let pipeline = Arc::clone(&pipeline);
        let task = tokio::spawn(async move {
            match job {
                Job::Arrive(arrival) => pipeline.handle(arrival).await,
                Job::Resume(recovered) => pipeline.resume(recovered).await,
            }
        });
        let _cancel = AbortOnDrop(task.abort_handle());
        let result = task.await;

        match result {
            Ok(outcome) => {
                stats.record(&outcome);
                match &outcome {
                    TaskOutcome::Succeeded { attempts } => {
                        info!(worker = worker_id, file = %file, attempts, "Task succeeded")
                    }
                    TaskOutcome::Failed { attempts, reason } => {
                        warn!(worker = worker_id, file = %file, attempts, reason = %reason, "Task failed")
                    }
                    TaskOutcome::Duplicate => {
                        info!(worker = worker_id, file = %file, "Task skipped as duplicate")
                    }
                    TaskOutcome::Aborted { reason } => {
                        warn!(worker = worker_id, file = %file, reason = %reason, "Task aborted")
                    }
                }
            }
            Err(e) => {
                stats.aborted.fetch_add(1, Ordering::Relaxed);
                error!(worker = worker_id, file = %file, error = %e, "Task panicked");
            }
        }
    }

    info!(worker = worker_id, "Worker shutting down");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::state::Ledger;
    use crate::test_support::{config_with_tool, file_names, process_alive, read_pid};
    use std::time::Duration;
    use crate::types::Arrival;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_pool_drains_queue() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let config = config_with_tool(&root, r#"case "$1" in *bad*) exit 1;; esac; exit 0"#);
        let pipeline = Arc::new(Pipeline::new(Arc::new(config.clone()), Ledger::disabled()));
        let stats = Arc::new(PoolStats::default());

        let (tx, rx) = async_channel::bounded(4);
        let handles = spawn_worker_pool(3, rx, pipeline, Arc::clone(&stats));

        for name in ["a.txt", "b.txt", "bad.txt", "c.txt", "d.txt"] {
            let source_path = config.input_dir.join(name);
            fs::write(&source_path, "payload").unwrap();
            tx.send(Job::Arrive(Arrival {
                name: name.to_string(),
                source_path,
            }))
            .await
            .unwrap();
        }
        drop(tx);
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            stats.summary(),
            StatsSummary {
                succeeded: 4,
                failed: 1,
                duplicates: 0,
                aborted: 0,
            }
        );
        assert_eq!(
            file_names(&config.output_dir),
            vec!["a.txt", "b.txt", "c.txt", "d.txt"]
        );
        assert_eq!(file_names(&config.error_dir), vec!["bad.txt", "bad.txt.log"]);
        assert!(file_names(&config.processing_dir).is_empty());
    }

    #[tokio::test]
    async fn test_aborted_worker_stops_tool_tree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let pid_file = root.join("grandchild.pid");
        let mut config = config_with_tool(
            &root,
            &format!("sleep 30 & echo $! > {}; wait", pid_file.display()),
        );
        config.tool.timeout = Duration::from_secs(60);
        let pipeline = Arc::new(Pipeline::new(Arc::new(config.clone()), Ledger::disabled()));

        let (tx, rx) = async_channel::bounded(1);
        let handles = spawn_worker_pool(1, rx, pipeline, Arc::new(PoolStats::default()));

        let source_path = config.input_dir.join("slow.txt");
        fs::write(&source_path, "payload").unwrap();
        tx.send(Job::Arrive(Arrival {
            name: "slow.txt".to_string(),
            source_path,
        }))
        .await
        .unwrap();

        let pid = read_pid(&pid_file).await;
        assert!(process_alive(pid));

        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        let mut alive = true;
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            alive = process_alive(pid);
            if !alive {
                break;
            }
        }
        assert!(!alive, "grandchild {} outlived its worker", pid);
        assert!(config.processing_dir.join("slow.txt").exists());
    }
}
