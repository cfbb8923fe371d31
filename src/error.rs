use crate::types::TaskState;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Broad classes of a failed attempt, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Tool ran and reported an error
    Transient,
    /// Tool exceeded its deadline and was killed
    Timeout,
    /// Missing input, missing resource or an I/O failure around the tool
    Filesystem,
}

/// Failure of a single tool invocation
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("tool resource not found: {}", .0.display())]
    MissingResource(PathBuf),

    #[error("input file not found: {}", .0.display())]
    MissingInput(PathBuf),

    #[error("working directory not found: {}", .0.display())]
    MissingWorkingDir(PathBuf),

    #[error("failed to create output directory {}: {source}", path.display())]
    OutputDir { path: PathBuf, source: io::Error },

    #[error("failed to start {command}: {source}")]
    Spawn { command: String, source: io::Error },

    #[error("failed waiting for tool: {0}")]
    Wait(#[source] io::Error),

    #[error("tool exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("tool did not exit within {} sec", .0.as_secs())]
    Timeout(Duration),
}

impl InvokeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Exit { .. } => FailureKind::Transient,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::MissingResource(_)
            | Self::MissingInput(_)
            | Self::MissingWorkingDir(_)
            | Self::OutputDir { .. }
            | Self::Spawn { .. }
            | Self::Wait(_) => FailureKind::Filesystem,
        }
    }
}

/// Failure of a stage-directory transition
#[derive(Debug, Error)]
pub enum StageError {
    #[error("source already gone: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("destination directory missing: {}", .0.display())]
    DestinationDirMissing(PathBuf),

    #[error("{op} failed for {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

impl StageError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Errors that abort a file's trip through the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("file name is not usable: {}", .0.display())]
    InvalidName(PathBuf),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("illegal state transition {from} -> {to}")]
    Transition { from: TaskState, to: TaskState },
}
