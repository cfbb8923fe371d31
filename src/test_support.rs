//! Helpers shared by the unit tests.

use crate::config::{PipelineConfig, SettingsFile};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};

/// Settings rooted in a scratch directory. The tool is `sh <root>/tool.sh`.
pub fn settings_in(root: &Path) -> SettingsFile {
    let json = serde_json::json!({
        "WatchSettings": {
            "InputDirectory": root.join("in"),
            "ProcessingDirectory": root.join("processing"),
            "OutputDirectory": root.join("out"),
            "ErrorDirectory": root.join("error"),
            "RetryDelayMs": 10,
            "StabilizeAttempts": 3,
            "StabilizeDelayMs": 10
        },
        "ToolSettings": {
            "ToolPath": "sh",
            "ToolArgs": [],
            "ResourcePath": root.join("tool.sh"),
            "WorkingDirectory": root
        }
    });
    SettingsFile::from_json(&json.to_string()).unwrap()
}

/// Resolved config whose tool is a shell script with the given body
pub fn config_with_tool(root: &Path, script: &str) -> PipelineConfig {
    write_script(root, "tool.sh", script);
    PipelineConfig::resolve(settings_in(root)).unwrap()
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    path
}

/// Names of the regular files in a directory, sorted
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

/// Number of lines in a counter file the stub tools append to
pub fn count_lines(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Wait for a stub tool to write a pid to `path`
pub async fn read_pid(path: &Path) -> u32 {
    for _ in 0..200 {
        if let Some(pid) = fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            return pid;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no pid written to {}", path.display());
}

/// Whether a process is still running; an unreaped zombie counts as gone
pub fn process_alive(pid: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid))
        .is_some_and(|p| p.status() != ProcessStatus::Zombie)
}
