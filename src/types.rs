use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Stage of a file in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Reported by the watcher, not yet claimed
    #[default]
    Arrived,
    /// Copied into the processing directory, source owned by this task
    Claimed,
    /// The external tool is being invoked
    Processing,
    /// Routed to the output directory
    Succeeded,
    /// Routed to the error directory
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_advance_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Arrived, Claimed)
                | (Claimed, Processing)
                | (Claimed, Succeeded)
                | (Claimed, Failed)
                | (Processing, Succeeded)
                | (Processing, Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Arrived => "arrived",
            Self::Claimed => "claimed",
            Self::Processing => "processing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Notification handed from the watcher to the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    /// Base file name
    pub name: String,
    /// Full path in the input directory
    pub source_path: PathBuf,
}

/// A file found in the processing directory at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub arrival: Arrival,
    /// Attempts already spent before the restart
    pub attempts_used: u32,
}

/// Work item consumed by the worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Arrive(Arrival),
    Resume(Recovered),
}

impl Job {
    pub fn name(&self) -> &str {
        match self {
            Self::Arrive(arrival) => &arrival.name,
            Self::Resume(recovered) => &recovered.arrival.name,
        }
    }
}

/// The unit of work for one arriving file, owned by the pipeline
#[derive(Debug, Clone)]
pub struct FileTask {
    pub name: String,
    pub source_path: PathBuf,
    pub processing_path: PathBuf,
    pub output_dir: PathBuf,
    pub error_dir: PathBuf,
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: TaskState,
}

/// Final result of one file's trip through the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Routed to the output directory
    Succeeded { attempts: u32 },
    /// Routed to the error directory
    Failed { attempts: u32, reason: String },
    /// Another task holds the claim for this name
    Duplicate,
    /// The file could not be claimed or routed; left where it was
    Aborted { reason: String },
}

/// One run of the external tool
#[derive(Debug, Clone)]
pub struct ProcessInvocation {
    pub command: String,
    pub args: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessInvocation {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}
