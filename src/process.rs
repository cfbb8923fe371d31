use crate::config::{BackendKind, ToolConfig};
use crate::error::InvokeError;
use crate::scripted::ScriptedInvoker;
use crate::types::ProcessInvocation;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for the output readers after the process is gone
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Paths for a single tool run
#[derive(Debug, Clone, Copy)]
pub struct InvocationRequest<'a> {
    pub input: &'a Path,
    pub sidecar: &'a Path,
    pub output_dir: &'a Path,
}

/// The configured way of running the external tool
#[derive(Debug, Clone)]
pub enum ToolBackend {
    Cli(ProcessInvoker),
    Scripted(ScriptedInvoker),
}

impl ToolBackend {
    pub fn from_config(tool: &ToolConfig) -> Self {
        match tool.backend {
            BackendKind::Cli => Self::Cli(ProcessInvoker::new(tool.clone())),
            BackendKind::Scripted => {
                warn!("Using the scripted tool backend; outcomes are not verified");
                Self::Scripted(ScriptedInvoker::new(tool.clone()))
            }
        }
    }

    pub async fn invoke(
        &self,
        request: &InvocationRequest<'_>,
    ) -> Result<ProcessInvocation, InvokeError> {
        match self {
            Self::Cli(invoker) => invoker.invoke(request).await,
            Self::Scripted(invoker) => invoker.invoke(request).await,
        }
    }
}

/// Runs the external tool once with positional arguments and classifies the result
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    tool: ToolConfig,
}

impl ProcessInvoker {
    pub fn new(tool: ToolConfig) -> Self {
        Self { tool }
    }

    pub async fn invoke(
        &self,
        request: &InvocationRequest<'_>,
    ) -> Result<ProcessInvocation, InvokeError> {
        check_prerequisites(&self.tool, request)?;

        let args = build_args(&self.tool.args, &self.tool.resource_path, request);
        let invocation = run_with_timeout(
            &self.tool.program,
            &args,
            &self.tool.working_dir,
            self.tool.timeout,
        )
        .await?;

        if !invocation.stderr.trim().is_empty() {
            warn!(
                input = %request.input.display(),
                stderr = %invocation.stderr.trim_end(),
                "Tool wrote to stderr"
            );
        }

        classify(invocation, self.tool.timeout)
    }
}

/// Fail fast on anything the tool would trip over, and create the output directory
pub(crate) fn check_prerequisites(
    tool: &ToolConfig,
    request: &InvocationRequest<'_>,
) -> Result<(), InvokeError> {
    if !tool.resource_path.is_file() {
        return Err(InvokeError::MissingResource(tool.resource_path.clone()));
    }
    if !request.input.is_file() {
        return Err(InvokeError::MissingInput(request.input.to_path_buf()));
    }
    if !tool.working_dir.is_dir() {
        return Err(InvokeError::MissingWorkingDir(tool.working_dir.clone()));
    }
    if !request.output_dir.is_dir() {
        fs::create_dir_all(request.output_dir).map_err(|source| InvokeError::OutputDir {
            path: request.output_dir.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Positional convention: `<tool args...> <resource> <input> <sidecar> <output dir>`
pub fn build_args(
    prefix: &[String],
    resource: &Path,
    request: &InvocationRequest<'_>,
) -> Vec<String> {
    let mut args = prefix.to_vec();
    for path in [resource, request.input, request.sidecar, request.output_dir] {
        args.push(path.to_string_lossy().into_owned());
    }
    args
}

fn classify(
    invocation: ProcessInvocation,
    timeout: Duration,
) -> Result<ProcessInvocation, InvokeError> {
    if invocation.succeeded() {
        return Ok(invocation);
    }
    if invocation.timed_out {
        return Err(InvokeError::Timeout(timeout));
    }
    Err(InvokeError::Exit {
        code: invocation.exit_code,
        stderr: invocation.stderr.trim_end().to_string(),
    })
}

/// Spawn a process, drain both output streams concurrently and wait for it
/// up to `timeout`. On timeout the whole process tree is killed.
pub async fn run_with_timeout(
    program: &Path,
    args: &[String],
    working_dir: &Path,
    timeout: Duration,
) -> Result<ProcessInvocation, InvokeError> {
    let command = program.to_string_lossy().into_owned();
    let start = Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| InvokeError::Spawn {
            command: command.clone(),
            source,
        })?;

    debug!(command = %command, pid = ?child.id(), "Tool started");
    let mut guard = TreeGuard::new(&child);

    let stdout_reader = spawn_reader(child.stdout.take(), "stdout");
    let stderr_reader = spawn_reader(child.stderr.take(), "stderr");

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (status.code(), false),
        Ok(Err(e)) => {
            terminate_tree(&mut child).await;
            guard.disarm();
            stdout_reader.abort();
            stderr_reader.abort();
            return Err(InvokeError::Wait(e));
        }
        Err(_) => {
            warn!(
                command = %command,
                timeout_secs = timeout.as_secs(),
                "Tool did not exit in time, killing process tree"
            );
            terminate_tree(&mut child).await;
            (None, true)
        }
    };
    guard.disarm();

    let stdout = collect_output(stdout_reader).await;
    let stderr = collect_output(stderr_reader).await;
    let elapsed = start.elapsed();

    info!(
        command = %command,
        exit_code = ?exit_code,
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "Tool finished"
    );

    Ok(ProcessInvocation {
        command,
        args: args.to_vec(),
        stdout,
        stderr,
        exit_code,
        timed_out,
        elapsed,
    })
}

fn spawn_reader<R>(stream: Option<R>, stream_name: &'static str) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return String::new();
        };
        let mut reader = BufReader::new(stream);
        let mut captured = String::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    debug!(stream = stream_name, line = %text.trim_end(), "tool output");
                    captured.push_str(&text);
                }
                Err(e) => {
                    debug!(stream = stream_name, error = %e, "Stopped reading tool output");
                    break;
                }
            }
        }
        captured
    })
}

async fn collect_output(mut reader: JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_GRACE, &mut reader).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
        Err(_) => {
            // something outside the tree still holds the pipe open
            reader.abort();
            warn!("Output stream still open after exit, discarding");
            String::new()
        }
    }
}

/// Kill a child and every process descended from it, then reap the child
pub(crate) async fn terminate_tree(child: &mut Child) {
    let descendants = match child.id() {
        Some(pid) => ProcessTree::snapshot().descendants_of(pid),
        None => Vec::new(),
    };

    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Child already exited");
    }

    if !descendants.is_empty() {
        let killed = kill_pids(&descendants);
        debug!(
            found = descendants.len(),
            killed, "Killed descendant processes"
        );
    }

    if let Err(e) = child.wait().await {
        warn!(error = %e, "Failed to reap killed child");
    }
}

/// Kills the descendants of a child that is still running when the
/// invocation is dropped, e.g. when its task is aborted at shutdown. The
/// child itself goes through `kill_on_drop`, so the guard must be declared
/// after the child to run first.
pub(crate) struct TreeGuard {
    pid: Option<u32>,
}

impl TreeGuard {
    pub(crate) fn new(child: &Child) -> Self {
        Self { pid: child.id() }
    }

    /// The child has been reaped; nothing left to clean up
    pub(crate) fn disarm(&mut self) {
        self.pid = None;
    }
}

impl Drop for TreeGuard {
    fn drop(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        let descendants = ProcessTree::snapshot().descendants_of(pid);
        if !descendants.is_empty() {
            let killed = kill_pids(&descendants);
            warn!(pid, killed, "Invocation cancelled, killed tool descendants");
        }
    }
}

/// Parent/child view of the process table at one point in time
struct ProcessTree {
    children: HashMap<Pid, Vec<Pid>>,
}

impl ProcessTree {
    fn snapshot() -> Self {
        let mut sys = System::new();
        sys.refresh_processes();
        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in sys.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }
        Self { children }
    }

    fn descendants_of(&self, root: u32) -> Vec<Pid> {
        let mut found = Vec::new();
        let mut stack = vec![Pid::from_u32(root)];
        while let Some(pid) = stack.pop() {
            if let Some(kids) = self.children.get(&pid) {
                for kid in kids {
                    found.push(*kid);
                    stack.push(*kid);
                }
            }
        }
        found
    }
}

fn kill_pids(pids: &[Pid]) -> usize {
    let mut sys = System::new();
    sys.refresh_processes();
    pids.iter()
        .filter_map(|pid| sys.process(*pid))
        .filter(|process| process.kill())
        .count()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{config_with_tool, process_alive, read_pid, write_script};
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        root: PathBuf,
        input: PathBuf,
        sidecar: PathBuf,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let input = root.join("sample.txt");
        fs::write(&input, "payload").unwrap();
        Fixture {
            sidecar: root.join("sample.txt.csi"),
            output: root.join("converted"),
            input,
            root,
            _tmp: tmp,
        }
    }

    fn request(f: &Fixture) -> InvocationRequest<'_> {
        InvocationRequest {
            input: &f.input,
            sidecar: &f.sidecar,
            output_dir: &f.output,
        }
    }

    fn invoker(f: &Fixture, script: &str, timeout: Duration) -> ProcessInvoker {
        let mut config = config_with_tool(&f.root, script);
        config.tool.timeout = timeout;
        ProcessInvoker::new(config.tool)
    }

    #[test]
    fn test_build_args_order() {
        let input = PathBuf::from("/p/a.txt");
        let sidecar = PathBuf::from("/p/a.txt.csi");
        let output = PathBuf::from("/out");
        let req = InvocationRequest {
            input: &input,
            sidecar: &sidecar,
            output_dir: &output,
        };
        let args = build_args(&["-jar".to_string()], Path::new("/opt/tool.jar"), &req);
        assert_eq!(
            args,
            vec!["-jar", "/opt/tool.jar", "/p/a.txt", "/p/a.txt.csi", "/out"]
        );
    }

    #[tokio::test]
    async fn test_success_passes_positional_args() {
        let f = fixture();
        let inv = invoker(
            &f,
            r#"printf '%s\n' "$@" > "$(dirname "$0")/args.txt"; exit 0"#,
            Duration::from_secs(30),
        );

        let result = inv.invoke(&request(&f)).await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(f.output.is_dir(), "output directory is created before the run");

        let args = fs::read_to_string(f.root.join("args.txt")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert_eq!(
            args,
            vec![
                f.input.to_str().unwrap(),
                f.sidecar.to_str().unwrap(),
                f.output.to_str().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let f = fixture();
        let inv = invoker(&f, "echo 'bad input' >&2; exit 3", Duration::from_secs(30));

        match inv.invoke(&request(&f)).await {
            Err(InvokeError::Exit { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("bad input"));
            }
            other => panic!("expected exit failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_resource_does_not_spawn() {
        let f = fixture();
        let mut inv = invoker(&f, "exit 0", Duration::from_secs(30));
        inv.tool.resource_path = f.root.join("missing.jar");

        let err = inv.invoke(&request(&f)).await.unwrap_err();
        assert!(matches!(err, InvokeError::MissingResource(_)));
    }

    #[tokio::test]
    async fn test_missing_input() {
        let f = fixture();
        let inv = invoker(&f, "exit 0", Duration::from_secs(30));
        fs::remove_file(&f.input).unwrap();

        let err = inv.invoke(&request(&f)).await.unwrap_err();
        assert!(matches!(err, InvokeError::MissingInput(_)));
    }

    #[tokio::test]
    async fn test_large_output_on_both_streams() {
        let f = fixture();
        let inv = invoker(
            &f,
            "head -c 300000 /dev/zero | tr '\\0' a; head -c 300000 /dev/zero | tr '\\0' b >&2; exit 0",
            Duration::from_secs(30),
        );

        let result = inv.invoke(&request(&f)).await.unwrap();
        assert_eq!(result.stdout.len(), 300_000);
        assert_eq!(result.stderr.len(), 300_000);
    }

    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let f = fixture();
        let inv = invoker(&f, "sleep 30", Duration::from_millis(300));

        let start = Instant::now();
        let err = inv.invoke(&request(&f)).await.unwrap_err();
        assert!(matches!(err, InvokeError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_descendants() {
        let f = fixture();
        let pid_file = f.root.join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let inv = invoker(&f, &script, Duration::from_millis(500));

        let err = inv.invoke(&request(&f)).await.unwrap_err();
        assert!(matches!(err, InvokeError::Timeout(_)));

        let pid = read_pid(&pid_file).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!process_alive(pid), "grandchild {} survived the timeout kill", pid);
    }

    #[tokio::test]
    async fn test_cancelled_invocation_leaves_no_descendants() {
        let f = fixture();
        let pid_file = f.root.join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let inv = invoker(&f, &script, Duration::from_secs(60));

        let input = f.input.clone();
        let sidecar = f.sidecar.clone();
        let output = f.output.clone();
        let task = tokio::spawn(async move {
            let req = InvocationRequest {
                input: &input,
                sidecar: &sidecar,
                output_dir: &output,
            };
            inv.invoke(&req).await.map(|_| ())
        });

        let pid = read_pid(&pid_file).await;
        assert!(process_alive(pid));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!process_alive(pid), "grandchild {} survived cancellation", pid);
    }

    #[tokio::test]
    async fn test_run_with_timeout_records_invocation() {
        let f = fixture();
        let script = write_script(&f.root, "echo.sh", "echo hello; exit 0");
        let result = run_with_timeout(
            Path::new("sh"),
            &[script.to_string_lossy().into_owned()],
            &f.root,
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        assert_eq!(result.command, "sh");
        assert_eq!(result.stdout, "hello\n");
        assert!(result.succeeded());
    }
}
