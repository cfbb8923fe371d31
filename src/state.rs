use crate::types::{FileTask, TaskState};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Persisted progress of one in-flight file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub source_path: PathBuf,
    /// Tool invocations already made
    pub attempts: u32,
    pub stage: TaskState,
    pub updated_at: DateTime<Utc>,
}

/// On-disk ledger contents, keyed by file name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub tasks: HashMap<String, TaskRecord>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl State {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            started_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Load state from a file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let state: State = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
        Ok(state)
    }

    /// Save state to a file atomically (write to temp, then rename)
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create state directory: {}", parent.display())
            })?;
        }

        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(self).context("Failed to serialize state")?;

        fs::write(&temp_path, &content)
            .with_context(|| format!("Failed to write temp state file: {}", temp_path.display()))?;

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename state file to: {}", path.display()))?;

        Ok(())
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to the resumption ledger. Every operation is a no-op when
/// no state file is configured.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    inner: Option<Arc<Mutex<LedgerInner>>>,
}

#[derive(Debug)]
struct LedgerInner {
    state: State,
    path: PathBuf,
}

impl Ledger {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Open the ledger at `path`, starting empty if the file does not exist
    pub fn open(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            let state = State::load(path)?;
            info!(
                path = %path.display(),
                in_flight = state.tasks.len(),
                "Loaded resumption ledger"
            );
            state
        } else {
            State::new()
        };

        Ok(Self {
            inner: Some(Arc::new(Mutex::new(LedgerInner {
                state,
                path: path.to_path_buf(),
            }))),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Persist the current stage and attempt count of a task. Terminal tasks
    /// are dropped instead.
    pub async fn record(&self, task: &FileTask) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut inner = inner.lock().await;
        if task.state.is_terminal() {
            inner.state.tasks.remove(&task.name);
        } else {
            inner.state.tasks.insert(
                task.name.clone(),
                TaskRecord {
                    source_path: task.source_path.clone(),
                    attempts: task.attempt,
                    stage: task.state,
                    updated_at: Utc::now(),
                },
            );
        }
        inner.persist();
    }

    /// Drop a task that reached a terminal outcome
    pub async fn forget(&self, name: &str) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut inner = inner.lock().await;
        if inner.state.tasks.remove(name).is_some() {
            inner.persist();
        }
    }

    /// Update the attempt count of a recorded task before its next invocation
    pub async fn set_attempts(&self, name: &str, attempts: u32) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut inner = inner.lock().await;
        if let Some(record) = inner.state.tasks.get_mut(name) {
            record.attempts = attempts;
            record.updated_at = Utc::now();
            inner.persist();
        }
    }

    pub async fn get(&self, name: &str) -> Option<TaskRecord> {
        let inner = self.inner.as_ref()?;
        let inner = inner.lock().await;
        inner.state.tasks.get(name).cloned()
    }

    /// Remove records whose file is no longer in the processing directory
    pub async fn retain(&self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let mut inner = inner.lock().await;
        let before = inner.state.tasks.len();
        inner.state.tasks.retain(|name, _| keep(name.as_str()));
        let dropped = before - inner.state.tasks.len();
        if dropped > 0 {
            inner.persist();
        }
        dropped
    }
}

impl LedgerInner {
    fn persist(&mut self) {
        let path = self.path.clone();
        if let Err(e) = self.state.save(&path) {
            error!(error = %e, "Failed to save state");
        }
    }
}
