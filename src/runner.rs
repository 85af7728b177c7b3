/// Single invocation of the external build tool: spawn it, drain stdout and
/// stderr concurrently, watch for output inactivity, and kill the whole
/// process tree if it hangs.
///
/// Every call is independent. A non-zero exit is a normal [`RunResult`]; only
/// a failure to start the process (or to observe it) is an error.
use crate::process_tree::{self, TreeGuard};
use crate::sink::{OutputSink, StreamKind, TracingSink};
use crate::watchdog::Watchdog;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;

/// Exit code reported when the process was killed for hanging.
///
/// A tool that itself exits with -1 is indistinguishable from a hang.
pub const HUNG_EXIT_CODE: i32 = -1;

/// Output inactivity after which the process is presumed stuck.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(20);

/// How often the poll loop checks for exit and inactivity.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the pipes may stay open after the direct child exits.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Upper bound on reaping the direct child after SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment overrides every build-tool invocation gets.
///
/// MSBuild's node reuse leaves worker nodes running after the build and can
/// starve task processes of stdout (dotnet/msbuild#6753).
pub const BUILD_TOOL_ENV: [(&str, &str); 2] = [
    ("MSBUILDDISABLENODEREUSE", "1"),
    ("MSBUILDENSURESTDOUTFORTASKPROCESSES", "1"),
];

/// Everything needed to launch one process.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub working_dir: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub inactivity_timeout: Duration,
}

/// Outcome of a run that got as far as starting the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// Captured stdout, one `\n`-terminated line per line read.
    pub output: String,
    /// Captured stderr, same discipline.
    pub errors: String,
    /// Real exit code, or [`HUNG_EXIT_CODE`].
    pub exit_code: i32,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == HUNG_EXIT_CODE
    }
}

/// Errors that prevent a [`RunResult`] from being produced.
#[derive(Debug)]
pub enum RunnerError {
    /// The executable could not be started (missing, not executable, bad cwd).
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// A piped stream was not available on the spawned child.
    MissingPipe(StreamKind),
    /// Polling the child for exit status failed.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Spawn { program, source } => {
                write!(f, "failed to start `{}`: {}", program, source)
            }
            RunnerError::MissingPipe(stream) => {
                write!(f, "child process has no {} pipe", stream)
            }
            RunnerError::Wait { source } => {
                write!(f, "failed to wait for child process: {}", source)
            }
        }
    }
}

impl std::error::Error for RunnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunnerError::Spawn { source, .. } => Some(source),
            RunnerError::MissingPipe(_) => None,
            RunnerError::Wait { source } => Some(source),
        }
    }
}

/// Runs the external tool with a working directory and argument list.
///
/// The orchestrator depends on this rather than on [`ProcessRunner`] so it
/// can be exercised without a real build tool.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        working_dir: &Path,
        args: &[String],
    ) -> impl Future<Output = Result<RunResult, RunnerError>> + Send;
}

/// Tunables for [`ProcessRunner`].
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub inactivity_timeout: Duration,
    pub poll_interval: Duration,
    /// Wait for descendants holding the pipes after a natural exit.
    pub drain_grace: Duration,
    /// Extra environment overrides, applied after [`BUILD_TOOL_ENV`].
    pub env: BTreeMap<String, String>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_grace: DEFAULT_DRAIN_GRACE,
            env: BTreeMap::new(),
        }
    }
}

/// Supervises one external program per call.
pub struct ProcessRunner {
    program: String,
    options: RunnerOptions,
    sink: Arc<dyn OutputSink>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            options: RunnerOptions::default(),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Build the request for one invocation, merging the fixed build-tool
    /// environment with configured overrides.
    pub fn request(&self, working_dir: &Path, args: &[String]) -> RunRequest {
        let mut env: BTreeMap<String, String> = BUILD_TOOL_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env.extend(self.options.env.clone());

        RunRequest {
            working_dir: working_dir.to_path_buf(),
            args: args.to_vec(),
            env,
            inactivity_timeout: self.options.inactivity_timeout,
        }
    }

    /// Execute a prepared request to completion, failure, or hang.
    pub async fn execute(&self, request: RunRequest) -> Result<RunResult, RunnerError> {
        let mut command = Command::new(&self.program);
        command
            .args(&request.args)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        process_tree::isolate(&mut command);

        tracing::info!(
            program = %self.program,
            args = ?request.args,
            cwd = %request.working_dir.display(),
            "starting external process"
        );

        let start = Instant::now();
        let mut child = command.spawn().map_err(|e| RunnerError::Spawn {
            program: self.program.clone(),
            source: e,
        })?;
        let pid = child.id();
        let mut guard = TreeGuard::new(pid);
        tracing::debug!(pid = ?pid, "external process started");

        let stdout = child
            .stdout
            .take()
            .ok_or(RunnerError::MissingPipe(StreamKind::Stdout))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(RunnerError::MissingPipe(StreamKind::Stderr))?;

        let watchdog = Arc::new(Watchdog::new(request.inactivity_timeout));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let output = Arc::new(Mutex::new(String::new()));
        let errors = Arc::new(Mutex::new(String::new()));

        let stdout_task = tokio::spawn(drain(
            stdout,
            StreamKind::Stdout,
            Arc::clone(&output),
            Arc::clone(&watchdog),
            Arc::clone(&self.sink),
            cancel_rx.clone(),
        ));
        let stderr_task = tokio::spawn(drain(
            stderr,
            StreamKind::Stderr,
            Arc::clone(&errors),
            Arc::clone(&watchdog),
            Arc::clone(&self.sink),
            cancel_rx,
        ));

        let status = loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|e| RunnerError::Wait { source: e })?
            {
                break Some(status);
            }
            if watchdog.check() {
                break None;
            }
            tokio::time::sleep(self.options.poll_interval).await;
        };

        let Some(status) = status else {
            // Hung: stop the drains, kill the tree, and report what was seen.
            let _ = cancel_tx.send(true);
            tracing::warn!(
                pid = ?pid,
                idle_ms = watchdog.idle_for().as_millis() as u64,
                timeout_ms = watchdog.timeout().as_millis() as u64,
                "external process produced no output within timeout, killing process tree"
            );
            guard.kill(&mut child);
            if tokio::time::timeout(REAP_TIMEOUT, child.wait()).await.is_err() {
                tracing::warn!(pid = ?pid, "killed process was not reaped in time");
            }
            // Drain tasks are abandoned; they stop on cancellation or EOF.
            drop(stdout_task);
            drop(stderr_task);

            let result = RunResult {
                output: snapshot(&output),
                errors: snapshot(&errors),
                exit_code: HUNG_EXIT_CODE,
            };
            tracing::info!(
                exit_code = result.exit_code,
                duration_ms = start.elapsed().as_millis() as u64,
                "external process terminated after hang"
            );
            return Ok(result);
        };

        // Natural exit: every line the child flushed is still in the pipes.
        // Descendants that inherited the pipes get a bounded grace period,
        // then the group is killed so the drains see EOF. The guard stays
        // armed until both drains finish.
        let drains = async {
            for task in [stdout_task, stderr_task] {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "output drain task failed");
                }
            }
        };
        tokio::pin!(drains);
        if tokio::time::timeout(self.options.drain_grace, &mut drains)
            .await
            .is_err()
        {
            tracing::warn!(
                pid = ?pid,
                grace_ms = self.options.drain_grace.as_millis() as u64,
                "output pipes still open after exit, killing remaining process group"
            );
            guard.kill(&mut child);
            let _ = cancel_tx.send(true);
            drains.await;
        }
        guard.disarm();

        let exit_code = status.code().unwrap_or_else(|| {
            tracing::warn!(status = %status, "external process exited without an exit code");
            HUNG_EXIT_CODE
        });
        let result = RunResult {
            output: snapshot(&output),
            errors: snapshot(&errors),
            exit_code,
        };
        tracing::info!(
            exit_code,
            output_bytes = result.output.len(),
            error_bytes = result.errors.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "external process exited"
        );
        Ok(result)
    }
}

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        working_dir: &Path,
        args: &[String],
    ) -> impl Future<Output = Result<RunResult, RunnerError>> + Send {
        let request = self.request(working_dir, args);
        self.execute(request)
    }
}

/// Read `reader` line by line until EOF, error, or cancellation.
async fn drain<R>(
    reader: R,
    stream: StreamKind,
    buffer: Arc<Mutex<String>>,
    watchdog: Arc<Watchdog>,
    sink: Arc<dyn OutputSink>,
    mut cancel: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let read = tokio::select! {
            _ = cancel.wait_for(|cancelled| *cancelled) => break,
            read = reader.read_until(b'\n', &mut raw) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&raw);
                watchdog.touch();
                {
                    let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
                    buf.push_str(&line);
                    buf.push('\n');
                }
                sink.line(stream, &line);
            }
            Err(e) => {
                tracing::warn!(stream = %stream, error = %e, "error reading child output");
                break;
            }
        }
    }
}

/// Strip the line terminator and decode, replacing invalid UTF-8.
fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn snapshot(buffer: &Mutex<String>) -> String {
    buffer.lock().unwrap_or_else(|e| e.into_inner()).clone()
}
