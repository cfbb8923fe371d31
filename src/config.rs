use anyhow::{Context, Result};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What happens to a claimed file whose name matches none of the input patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnrecognizedPolicy {
    /// Route to the error directory without invoking the tool
    #[default]
    Reject,
    /// Route to the output directory without invoking the tool
    PassThrough,
}

/// How the external tool is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Positional command-line arguments, exit code decides the outcome
    #[default]
    Cli,
    /// Legacy interactive driving over stdin on fixed timers (opt-in only)
    Scripted,
}

/// Timers for the scripted backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScriptedSettings {
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

impl Default for ScriptedSettings {
    fn default() -> Self {
        Self {
            startup_delay_ms: default_startup_delay_ms(),
            step_delay_ms: default_step_delay_ms(),
            settle_ms: default_settle_ms(),
        }
    }
}

/// Stage directories and pipeline behaviour (`WatchSettings` section)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WatchSettings {
    pub input_directory: PathBuf,
    pub processing_directory: PathBuf,
    pub output_directory: PathBuf,
    pub error_directory: PathBuf,
    /// Maximum tool invocations per file
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Glob patterns matched against the base file name
    #[serde(default = "default_input_patterns")]
    pub input_patterns: Vec<String>,
    /// Number of pipeline workers
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_stabilize_attempts")]
    pub stabilize_attempts: u32,
    #[serde(default = "default_stabilize_delay_ms")]
    pub stabilize_delay_ms: u64,
    #[serde(default)]
    pub unrecognized_files: UnrecognizedPolicy,
    /// Append diagnostics to `<ErrorDirectory>/<name>.log` for failed files
    #[serde(default = "default_true")]
    pub write_failure_log: bool,
    /// Resumption ledger, disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
}

/// External tool settings (`ToolSettings` section, `JavaSettings` accepted)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ToolSettings {
    #[serde(default = "default_tool_path")]
    pub tool_path: PathBuf,
    /// Arguments placed before the resource path
    #[serde(default = "default_tool_args")]
    pub tool_args: Vec<String>,
    pub resource_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_sidecar_extension")]
    pub sidecar_extension: String,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub scripted: ScriptedSettings,
}

/// The settings file as it sits on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SettingsFile {
    pub watch_settings: WatchSettings,
    #[serde(alias = "JavaSettings")]
    pub tool_settings: ToolSettings,
}

fn default_retry_count() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_input_patterns() -> Vec<String> {
    vec!["*.txt".to_string()]
}
fn default_concurrency() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    100
}
fn default_stabilize_attempts() -> u32 {
    10
}
fn default_stabilize_delay_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}
fn default_tool_path() -> PathBuf {
    PathBuf::from("java")
}
fn default_tool_args() -> Vec<String> {
    vec!["-jar".to_string()]
}
fn default_timeout_ms() -> u64 {
    600_000
}
fn default_sidecar_extension() -> String {
    "csi".to_string()
}
fn default_startup_delay_ms() -> u64 {
    5000
}
fn default_step_delay_ms() -> u64 {
    500
}
fn default_settle_ms() -> u64 {
    10_000
}

impl SettingsFile {
    /// Load and validate the settings file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Invalid settings file: {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let settings: SettingsFile =
            serde_json::from_str(content).context("Failed to parse settings")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        let watch = &self.watch_settings;
        for (key, dir) in [
            ("InputDirectory", &watch.input_directory),
            ("ProcessingDirectory", &watch.processing_directory),
            ("OutputDirectory", &watch.output_directory),
            ("ErrorDirectory", &watch.error_directory),
        ] {
            if dir.as_os_str().is_empty() {
                anyhow::bail!("WatchSettings:{key} must not be empty");
            }
        }
        if watch.retry_count == 0 {
            anyhow::bail!("WatchSettings:RetryCount must be at least 1");
        }
        if watch.concurrency == 0 {
            anyhow::bail!("WatchSettings:Concurrency must be at least 1");
        }
        if watch.queue_capacity == 0 {
            anyhow::bail!("WatchSettings:QueueCapacity must be at least 1");
        }
        if self.tool_settings.resource_path.as_os_str().is_empty() {
            anyhow::bail!("ToolSettings:ResourcePath must not be empty");
        }
        if self.tool_settings.timeout_ms == 0 {
            anyhow::bail!("ToolSettings:TimeoutMs must be positive");
        }
        Ok(())
    }
}

/// Resolved tool settings with absolute paths
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub resource_path: PathBuf,
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub sidecar_extension: String,
    pub backend: BackendKind,
    pub startup_delay: Duration,
    pub step_delay: Duration,
    pub settle: Duration,
}

/// Immutable runtime configuration handed to every component
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_dir: PathBuf,
    pub processing_dir: PathBuf,
    pub output_dir: PathBuf,
    pub error_dir: PathBuf,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub input_patterns: Vec<Pattern>,
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub stabilize_attempts: u32,
    pub stabilize_delay: Duration,
    pub unrecognized: UnrecognizedPolicy,
    pub write_failure_log: bool,
    pub state_file: Option<PathBuf>,
    pub tool: ToolConfig,
}

impl PipelineConfig {
    /// Create the stage directories if absent and resolve every path to an
    /// absolute, canonical form.
    pub fn resolve(settings: SettingsFile) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to read current directory")?;
        let SettingsFile {
            watch_settings: watch,
            tool_settings: tool,
        } = settings;

        let input_patterns = watch
            .input_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).with_context(|| format!("Invalid input pattern: {}", p))
            })
            .collect::<Result<Vec<_>>>()?;

        let working_dir = tool
            .working_directory
            .as_deref()
            .map(|dir| absolutize(&cwd, dir))
            .unwrap_or_else(|| cwd.clone());

        Ok(Self {
            input_dir: ensure_stage_dir(&cwd, &watch.input_directory)?,
            processing_dir: ensure_stage_dir(&cwd, &watch.processing_directory)?,
            output_dir: ensure_stage_dir(&cwd, &watch.output_directory)?,
            error_dir: ensure_stage_dir(&cwd, &watch.error_directory)?,
            max_attempts: watch.retry_count,
            retry_delay: Duration::from_millis(watch.retry_delay_ms),
            input_patterns,
            concurrency: watch.concurrency,
            queue_capacity: watch.queue_capacity,
            stabilize_attempts: watch.stabilize_attempts,
            stabilize_delay: Duration::from_millis(watch.stabilize_delay_ms),
            unrecognized: watch.unrecognized_files,
            write_failure_log: watch.write_failure_log,
            state_file: watch.state_file.as_deref().map(|p| absolutize(&cwd, p)),
            tool: ToolConfig {
                program: tool.tool_path,
                args: tool.tool_args,
                resource_path: absolutize(&cwd, &tool.resource_path),
                working_dir,
                timeout: Duration::from_millis(tool.timeout_ms),
                sidecar_extension: tool.sidecar_extension.trim_start_matches('.').to_string(),
                backend: tool.backend,
                startup_delay: Duration::from_millis(tool.scripted.startup_delay_ms),
                step_delay: Duration::from_millis(tool.scripted.step_delay_ms),
                settle: Duration::from_millis(tool.scripted.settle_ms),
            },
        })
    }

    /// True if the base name matches one of the configured input patterns
    pub fn is_recognized(&self, name: &str) -> bool {
        self.input_patterns.iter().any(|p| p.matches(name))
    }

    /// Sidecar path for a file: the full path with the sidecar extension appended
    pub fn sidecar_path(&self, path: &Path) -> PathBuf {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(".");
        sidecar.push(&self.tool.sidecar_extension);
        PathBuf::from(sidecar)
    }
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn ensure_stage_dir(base: &Path, dir: &Path) -> Result<PathBuf> {
    let dir = absolutize(base, dir);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    dir.canonicalize()
        .with_context(|| format!("Failed to resolve directory: {}", dir.display()))
}
