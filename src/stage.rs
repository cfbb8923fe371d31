//! Filesystem transitions between the stage directories.
//!
//! The stage directories are the only state shared between workers, so every
//! transition here is built on a single filesystem primitive: claims use
//! exclusive create, routing uses rename (with a copy fallback across
//! devices), and a missing source is never confused with a missing
//! destination directory.

use crate::error::StageError;
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Result of trying to claim a file name in the processing directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another task already holds the name
    AlreadyClaimed,
}

/// Copy `source` to `processing_path`, failing if the destination exists.
///
/// The destination is created with `create_new`, so the existence check and
/// the claim are one atomic call. The source is left untouched. A partially
/// written claim is removed before an error is returned.
pub fn claim(source: &Path, processing_path: &Path) -> Result<ClaimOutcome, StageError> {
    let mut claim_file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(processing_path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Ok(ClaimOutcome::AlreadyClaimed)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(StageError::DestinationDirMissing(parent_of(processing_path)))
        }
        Err(e) => return Err(StageError::io("claim", processing_path, e)),
    };

    let copied = File::open(source)
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StageError::SourceMissing(source.to_path_buf()),
            _ => StageError::io("open source", source, e),
        })
        .and_then(|mut src| {
            io::copy(&mut src, &mut claim_file)
                .and_then(|_| claim_file.sync_all())
                .map_err(|e| StageError::io("copy", processing_path, e))
        });

    if let Err(e) = copied {
        drop(claim_file);
        if let Err(cleanup) = fs::remove_file(processing_path) {
            warn!(
                path = %processing_path.display(),
                error = %cleanup,
                "Failed to release partial claim"
            );
        }
        return Err(e);
    }

    Ok(ClaimOutcome::Claimed)
}

/// Move `file` into `dest_dir`, keeping its name and replacing any file of
/// the same name already there. A missing destination directory is recreated
/// once before giving up.
pub fn move_into(file: &Path, dest_dir: &Path) -> Result<PathBuf, StageError> {
    match try_move(file, dest_dir) {
        Err(StageError::DestinationDirMissing(dir)) => {
            warn!(dir = %dir.display(), "Destination directory disappeared, recreating");
            fs::create_dir_all(&dir).map_err(|e| StageError::io("create directory", &dir, e))?;
            try_move(file, dest_dir)
        }
        other => other,
    }
}

fn try_move(file: &Path, dest_dir: &Path) -> Result<PathBuf, StageError> {
    let name = file
        .file_name()
        .ok_or_else(|| StageError::SourceMissing(file.to_path_buf()))?;
    let dest = dest_dir.join(name);

    match fs::rename(file, &dest) {
        Ok(()) => Ok(dest),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if !file.exists() {
                Err(StageError::SourceMissing(file.to_path_buf()))
            } else if !dest_dir.is_dir() {
                Err(StageError::DestinationDirMissing(dest_dir.to_path_buf()))
            } else {
                Err(StageError::io("move", file, e))
            }
        }
        Err(e) => {
            // rename cannot cross filesystems
            debug!(error = %e, from = %file.display(), "Rename failed, copying instead");
            fs::copy(file, &dest).map_err(|e| StageError::io("copy", &dest, e))?;
            fs::remove_file(file).map_err(|e| StageError::io("remove", file, e))?;
            Ok(dest)
        }
    }
}

/// Delete a file, reporting whether it was still there
pub fn remove_if_present(path: &Path) -> Result<bool, StageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StageError::io("remove", path, e)),
    }
}

/// Regular files directly inside `dir`, as `(name, path)` pairs sorted by name
pub fn list_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, StageError> {
    let entries = fs::read_dir(dir).map_err(|e| StageError::io("list", dir, e))?;
    let mut files: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            Some((name, entry.path()))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Append a diagnostic entry to `<error_dir>/<name>.log`
pub fn append_failure_log(error_dir: &Path, name: &str, message: &str) {
    let log_path = error_dir.join(format!("{}.log", name));
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");

    match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(mut file) => {
            let separator = "=".repeat(80);
            if let Err(e) = writeln!(file, "{}\n[{}]\n{}", separator, timestamp, message) {
                error!(error = %e, path = %log_path.display(), "Failed to write failure log");
            }
        }
        Err(e) => {
            error!(error = %e, path = %log_path.display(), "Failed to open failure log");
        }
    }
}

fn parent_of(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}
