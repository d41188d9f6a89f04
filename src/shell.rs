//! Child process execution with a bounded wait.
//!
//! Every external invocation the orchestrator makes — unattended installers,
//! `Rscript`/`tlmgr` package calls, version queries, permission grants, job
//! scheduler commands — goes through [`run`]. A child that exceeds its wait
//! ceiling is killed and reported as a timeout; the orchestrator never blocks
//! forever on a wedged installer.

use crate::error::{BasecampError, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How often to poll a running child for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A fully-specified child invocation: program plus arguments, no shell.
///
/// Keeping the argv as data (instead of a shell string) lets platform
/// command construction be unit-tested without executing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments, in order.
    pub args: Vec<String>,
}

impl Invocation {
    /// Build an invocation from a program and argument list.
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Render for logging: program followed by space-joined arguments.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Result of executing a child process.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Exit code (None if killed by signal).
    pub exit_code: Option<i32>,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Execution duration.
    pub duration: Duration,

    /// Whether the child exited with code 0.
    pub success: bool,
}

impl RunResult {
    /// Combined stdout + stderr, for version extraction and transcripts.
    pub fn combined_output(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Options for child execution.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Working directory.
    pub cwd: Option<PathBuf>,

    /// Extra environment variables (merged over the process env).
    pub env: Vec<(String, String)>,

    /// Wait ceiling in seconds (None = wait indefinitely).
    pub timeout: Option<u64>,
}

impl RunOptions {
    /// Options with a wait ceiling.
    pub fn with_timeout(seconds: u64) -> Self {
        Self {
            timeout: Some(seconds),
            ..Default::default()
        }
    }
}

/// Execute an invocation, capturing output, killing on timeout.
pub fn run(invocation: &Invocation, options: &RunOptions) -> Result<RunResult> {
    let start = Instant::now();

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|_| BasecampError::CommandFailed {
        command: invocation.display(),
        code: None,
    })?;

    // Drain both pipes on their own threads so a chatty installer can't
    // block on a full pipe buffer while we wait for it to exit.
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = options
        .timeout
        .map(|secs| start + Duration::from_secs(secs));

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(BasecampError::CommandTimeout {
                            command: invocation.display(),
                            seconds: options.timeout.unwrap_or(0),
                        });
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(BasecampError::Io(e)),
        }
    };

    let stdout = join_reader(stdout_reader);
    let stderr = join_reader(stderr_reader);
    let duration = start.elapsed();

    Ok(RunResult {
        exit_code: status.code(),
        stdout,
        stderr,
        duration,
        success: status.success(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

fn join_reader(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

/// Execute and return only whether the child exited 0.
///
/// Launch failures and timeouts count as failure.
pub fn run_check(invocation: &Invocation, timeout: Option<u64>) -> bool {
    let options = RunOptions {
        timeout,
        ..Default::default()
    };
    run(invocation, &options).map(|r| r.success).unwrap_or(false)
}

/// Check whether a file has executable permission bits set.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// On Windows, executability is determined by file extension, not permission bits.
#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}
