//! Legacy backend that drives an interactive instance of the tool.
//!
//! The tool is started with only its resource argument and fed the input
//! path, sidecar path and output directory over stdin on fixed timers, the
//! same sequence an operator would type. There is no real success signal:
//! once the sequence has been sent and the settle period has passed the
//! attempt counts as a success unless the tool exited non-zero on its own.
//! A still-running process is terminated.

use crate::config::ToolConfig;
use crate::error::InvokeError;
use crate::process::{check_prerequisites, terminate_tree, InvocationRequest, TreeGuard};
use crate::types::ProcessInvocation;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ScriptedInvoker {
    tool: ToolConfig,
}

impl ScriptedInvoker {
    pub fn new(tool: ToolConfig) -> Self {
        Self { tool }
    }

    pub async fn invoke(
        &self,
        request: &InvocationRequest<'_>,
    ) -> Result<ProcessInvocation, InvokeError> {
        check_prerequisites(&self.tool, request)?;

        let command = self.tool.program.to_string_lossy().into_owned();
        let mut args = self.tool.args.clone();
        args.push(self.tool.resource_path.to_string_lossy().into_owned());

        let start = Instant::now();
        let mut child = Command::new(&self.tool.program)
            .args(&args)
            .current_dir(&self.tool.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| InvokeError::Spawn {
                command: command.clone(),
                source,
            })?;

        let mut guard = TreeGuard::new(&child);

        info!(command = %command, "Started interactive tool, waiting for it to load");
        tokio::time::sleep(self.tool.startup_delay).await;

        if let Some(mut stdin) = child.stdin.take() {
            for step in script_steps(request) {
                debug!(step = %step, "Sending scripted input");
                if let Err(e) = stdin.write_all(format!("{}\n", step).as_bytes()).await {
                    terminate_tree(&mut child).await;
                    guard.disarm();
                    return Err(InvokeError::Wait(e));
                }
                if let Err(e) = stdin.flush().await {
                    terminate_tree(&mut child).await;
                    guard.disarm();
                    return Err(InvokeError::Wait(e));
                }
                tokio::time::sleep(self.tool.step_delay).await;
            }
        }

        let exit_code = match tokio::time::timeout(self.tool.settle, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                terminate_tree(&mut child).await;
                guard.disarm();
                return Err(InvokeError::Wait(e));
            }
            Err(_) => {
                warn!(command = %command, "Interactive tool still running after settle period, closing it");
                terminate_tree(&mut child).await;
                None
            }
        };
        guard.disarm();

        if let Some(code) = exit_code.filter(|code| *code != 0) {
            return Err(InvokeError::Exit {
                code: Some(code),
                stderr: String::new(),
            });
        }

        Ok(ProcessInvocation {
            command,
            args,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            timed_out: false,
            elapsed: start.elapsed(),
        })
    }
}

/// The typed sequence: input path, sidecar path without extension, output directory
fn script_steps(request: &InvocationRequest<'_>) -> Vec<String> {
    vec![
        request.input.to_string_lossy().into_owned(),
        strip_extension(request.sidecar),
        request.output_dir.to_string_lossy().into_owned(),
    ]
}

fn strip_extension(path: &Path) -> String {
    path.with_extension("").to_string_lossy().into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::config_with_tool;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_script_steps() {
        let input = PathBuf::from("/p/a.txt");
        let sidecar = PathBuf::from("/p/a.txt.csi");
        let output = PathBuf::from("/out");
        let req = InvocationRequest {
            input: &input,
            sidecar: &sidecar,
            output_dir: &output,
        };
        assert_eq!(script_steps(&req), vec!["/p/a.txt", "/p/a.txt", "/out"]);
    }

    fn scripted(root: &Path, script: &str) -> ScriptedInvoker {
        let mut config = config_with_tool(root, script);
        config.tool.startup_delay = Duration::from_millis(10);
        config.tool.step_delay = Duration::from_millis(10);
        config.tool.settle = Duration::from_millis(300);
        ScriptedInvoker::new(config.tool)
    }

    #[tokio::test]
    async fn test_feeds_sequence_over_stdin() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let input = root.join("a.txt");
        fs::write(&input, "x").unwrap();
        let sidecar = root.join("a.txt.csi");
        let output = root.join("out");

        let inv = scripted(
            &root,
            r#"read a; read b; read c; printf '%s\n%s\n%s\n' "$a" "$b" "$c" > "$(dirname "$0")/typed.txt""#,
        );
        let req = InvocationRequest {
            input: &input,
            sidecar: &sidecar,
            output_dir: &output,
        };
        let result = inv.invoke(&req).await.unwrap();
        assert!(result.succeeded());

        let typed = fs::read_to_string(root.join("typed.txt")).unwrap();
        let expected = format!(
            "{}\n{}\n{}\n",
            input.display(),
            input.display(),
            output.display()
        );
        assert_eq!(typed, expected);
    }

    #[tokio::test]
    async fn test_hung_tool_is_closed_and_counted_done() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let input = root.join("a.txt");
        fs::write(&input, "x").unwrap();
        let sidecar = root.join("a.txt.csi");
        let output = root.join("out");

        let inv = scripted(&root, "sleep 30");
        let req = InvocationRequest {
            input: &input,
            sidecar: &sidecar,
            output_dir: &output,
        };
        let start = Instant::now();
        let result = inv.invoke(&req).await.unwrap();
        assert!(result.succeeded());
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
