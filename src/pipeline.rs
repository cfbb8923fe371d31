use crate::config::{PipelineConfig, UnrecognizedPolicy};
use crate::error::{PipelineError, StageError};
use crate::process::{InvocationRequest, ToolBackend};
use crate::retry::run_with_retry;
use crate::stage::{self, ClaimOutcome};
use crate::state::Ledger;
use crate::types::{Arrival, FileTask, Recovered, TaskOutcome, TaskState};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Drives each file from arrival to a terminal stage directory.
///
/// Holds no per-file state between calls; the only thing shared with other
/// workers is the filesystem and the optional ledger.
#[derive(Debug, Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    backend: ToolBackend,
    ledger: Ledger,
}

impl Pipeline {
    pub fn new(config: Arc<PipelineConfig>, ledger: Ledger) -> Self {
        let backend = ToolBackend::from_config(&config.tool);
        Self {
            config,
            backend,
            ledger,
        }
    }

    /// Handle a new arrival. Errors are logged and reported as an outcome,
    /// never propagated.
    pub async fn handle(&self, arrival: Arrival) -> TaskOutcome {
        let name = arrival.name.clone();
        match self.drive(arrival).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(file = %name, error = %e, "Fatal error while handling file");
                TaskOutcome::Aborted {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Continue a file found in the processing directory at startup
    pub async fn resume(&self, recovered: Recovered) -> TaskOutcome {
        let name = recovered.arrival.name.clone();
        match self.drive_recovered(recovered).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(file = %name, error = %e, "Fatal error while resuming file");
                TaskOutcome::Aborted {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn new_task(&self, arrival: &Arrival) -> Result<FileTask, PipelineError> {
        if !is_plain_file_name(&arrival.name) {
            return Err(PipelineError::InvalidName(arrival.source_path.clone()));
        }
        Ok(FileTask {
            name: arrival.name.clone(),
            source_path: arrival.source_path.clone(),
            processing_path: self.config.processing_dir.join(&arrival.name),
            output_dir: self.config.output_dir.clone(),
            error_dir: self.config.error_dir.clone(),
            attempt: 0,
            max_attempts: self.config.max_attempts,
            state: TaskState::Arrived,
        })
    }

    async fn drive(&self, arrival: Arrival) -> Result<TaskOutcome, PipelineError> {
        let mut task = self.new_task(&arrival)?;

        match stage::claim(&task.source_path, &task.processing_path)? {
            ClaimOutcome::AlreadyClaimed => {
                info!(
                    file = %task.name,
                    path = %task.processing_path.display(),
                    "Already in processing, skipping"
                );
                return Ok(TaskOutcome::Duplicate);
            }
            ClaimOutcome::Claimed => {}
        }

        advance(&mut task, TaskState::Claimed)?;
        info!(file = %task.name, path = %task.processing_path.display(), "Copied to processing");
        self.ledger.record(&task).await;

        self.process_claimed(task).await
    }

    async fn drive_recovered(&self, recovered: Recovered) -> Result<TaskOutcome, PipelineError> {
        let mut task = self.new_task(&recovered.arrival)?;
        // the claim already exists on disk
        task.state = TaskState::Claimed;
        task.attempt = recovered.attempts_used.min(task.max_attempts);
        info!(
            file = %task.name,
            attempts_used = task.attempt,
            "Resuming file left in processing"
        );
        self.ledger.record(&task).await;
        self.process_claimed(task).await
    }

    async fn process_claimed(&self, mut task: FileTask) -> Result<TaskOutcome, PipelineError> {
        if !self.config.is_recognized(&task.name) {
            return match self.config.unrecognized {
                UnrecognizedPolicy::PassThrough => {
                    info!(file = %task.name, "Unrecognized file type, passing through");
                    self.finish(task, TaskState::Succeeded, None).await
                }
                UnrecognizedPolicy::Reject => {
                    warn!(file = %task.name, "Unrecognized file type, rejecting");
                    self.finish(
                        task,
                        TaskState::Failed,
                        Some("unrecognized file type".to_string()),
                    )
                    .await
                }
            };
        }

        if task.attempt >= task.max_attempts {
            let reason = format!("all {} attempts used before restart", task.max_attempts);
            return self.finish(task, TaskState::Failed, Some(reason)).await;
        }

        advance(&mut task, TaskState::Processing)?;
        self.ledger.record(&task).await;

        let used = task.attempt;
        let sidecar = self.config.sidecar_path(&task.processing_path);
        let request = InvocationRequest {
            input: &task.processing_path,
            sidecar: &sidecar,
            output_dir: &task.output_dir,
        };
        let backend = &self.backend;
        let ledger = &self.ledger;
        let name = task.name.as_str();
        let max_attempts = task.max_attempts;

        let result = run_with_retry(
            max_attempts - used,
            self.config.retry_delay,
            |attempt| {
                let request = &request;
                async move {
                    let overall = used + attempt;
                    info!(file = %name, attempt = overall, max_attempts, "Processing attempt");
                    ledger.set_attempts(name, overall).await;
                    backend.invoke(request).await.map_err(|e| {
                        warn!(file = %name, attempt = overall, kind = ?e.kind(), error = %e, "Error in processing");
                        e
                    })
                }
            },
        )
        .await;

        match result {
            Ok((invocation, attempt)) => {
                debug!(
                    file = %task.name,
                    command = %invocation.command,
                    args = ?invocation.args,
                    stdout_bytes = invocation.stdout.len(),
                    elapsed_ms = invocation.elapsed.as_millis() as u64,
                    "Tool accepted file"
                );
                task.attempt = used + attempt;
                self.finish(task, TaskState::Succeeded, None).await
            }
            Err(exhausted) => {
                task.attempt = used + exhausted.attempts;
                let reason = exhausted.last_error.to_string();
                self.finish(task, TaskState::Failed, Some(reason)).await
            }
        }
    }

    /// Route the processing copy to its terminal directory, then remove the
    /// original source. The source is only touched once the move succeeded.
    async fn finish(
        &self,
        mut task: FileTask,
        terminal: TaskState,
        reason: Option<String>,
    ) -> Result<TaskOutcome, PipelineError> {
        let dest_dir = match terminal {
            TaskState::Succeeded => task.output_dir.clone(),
            _ => task.error_dir.clone(),
        };

        let dest = match stage::move_into(&task.processing_path, &dest_dir) {
            Ok(dest) => dest,
            Err(e @ StageError::SourceMissing(_)) => {
                // nothing left to resume; the original stays in the input directory
                self.ledger.forget(&task.name).await;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let sidecar = self.config.sidecar_path(&task.processing_path);
        if sidecar.exists() {
            if let Err(e) = stage::move_into(&sidecar, &dest_dir) {
                warn!(file = %task.name, error = %e, "Failed to route sidecar file");
            }
        }

        match stage::remove_if_present(&task.source_path) {
            Ok(true) => {}
            Ok(false) => debug!(file = %task.name, "Source already gone"),
            Err(e) => warn!(file = %task.name, error = %e, "Failed to delete source file"),
        }

        advance(&mut task, terminal)?;
        self.ledger.forget(&task.name).await;

        match terminal {
            TaskState::Succeeded => {
                info!(file = %task.name, attempts = task.attempt, dest = %dest.display(), "File moved to output");
                Ok(TaskOutcome::Succeeded {
                    attempts: task.attempt,
                })
            }
            _ => {
                let reason = reason.unwrap_or_default();
                error!(file = %task.name, attempts = task.attempt, dest = %dest.display(), reason = %reason, "File moved to errors");
                if self.config.write_failure_log {
                    stage::append_failure_log(
                        &task.error_dir,
                        &task.name,
                        &format!(
                            "FAILED after {} attempt(s)\nSource: {}\n\n{}",
                            task.attempt,
                            task.source_path.display(),
                            reason
                        ),
                    );
                }
                Ok(TaskOutcome::Failed {
                    attempts: task.attempt,
                    reason,
                })
            }
        }
    }
}

fn advance(task: &mut FileTask, next: TaskState) -> Result<(), PipelineError> {
    if !task.state.can_advance_to(next) {
        return Err(PipelineError::Transition {
            from: task.state,
            to: next,
        });
    }
    debug!(file = %task.name, from = %task.state, to = %next, "State change");
    task.state = next;
    Ok(())
}

/// A bare file name with no directory components
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .file_name()
            .is_some_and(|base| base == name)
}
