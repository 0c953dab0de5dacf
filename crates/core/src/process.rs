//! Subprocess execution and cancellation.
//!
//! Every external program (the build tool and `git`) is run through the
//! [`CommandRunner`] trait so the engine can be driven by a scripted runner
//! in tests. [`ProcessRunner`] is the real implementation on top of
//! `tokio::process`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::ProcessError;

pub(crate) const CANCEL_POLL: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Caller-owned cancellation flag with an optional deadline.
///
/// Clones share the flag. Primitives check it before starting and bound
/// their subprocess timeouts by the remaining time.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that expires `budget` from now.
    pub fn with_deadline(budget: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + budget),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Time left before the deadline, if one was set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast when already cancelled.
    pub fn check(&self) -> Result<(), ProcessError> {
        if self.is_cancelled() {
            Err(ProcessError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The smaller of `limit` and the remaining deadline budget.
    pub fn bound(&self, limit: Duration) -> Duration {
        match self.remaining() {
            Some(left) => left.min(limit),
            None => limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// A fully described program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(' ') || arg.contains('"') || arg.contains('{') {
                out.push('\'');
                out.push_str(arg);
                out.push('\'');
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

/// Captured result of a finished program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end().is_empty(), self.stderr.trim_end().is_empty()) {
            (true, _) => self.stderr.trim_end().to_string(),
            (false, true) => self.stdout.trim_end().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
        }
    }

    /// Non-empty lines of [`combined`](Self::combined).
    pub fn log_lines(&self) -> Vec<String> {
        self.combined()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Runner seam
// ---------------------------------------------------------------------------

/// Runs one program to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<CommandOutput, ProcessError>;
}

/// [`CommandRunner`] backed by real subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation, cancel: &CancelToken) -> Result<CommandOutput, ProcessError> {
        cancel.check()?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }

        // Spawning in a missing directory also fails with NotFound.
        if let Some(dir) = invocation.cwd.as_ref().filter(|d| !d.is_dir()) {
            return Err(ProcessError::WorkingDirMissing(dir.clone()));
        }

        debug!(cmd = %invocation.display(), "running command");
        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                tool_missing(&invocation.program)
            } else {
                ProcessError::IoError(e)
            }
        })?;

        // Dropping the wait future drops the child, which kills it.
        let budget = cancel.bound(invocation.timeout);
        let wait = child.wait_with_output();
        let expiry = tokio::time::sleep(budget);
        let mut poll = tokio::time::interval(CANCEL_POLL);
        tokio::pin!(wait, expiry);
        let output = loop {
            tokio::select! {
                result = &mut wait => break result?,
                _ = &mut expiry => {
                    warn!(cmd = %invocation.display(), secs = budget.as_secs(), "command timed out");
                    if cancel.is_cancelled() {
                        return Err(ProcessError::Cancelled);
                    }
                    return Err(ProcessError::TimedOut {
                        program: invocation.program.clone(),
                        secs: budget.as_secs(),
                    });
                }
                _ = poll.tick() => {
                    if cancel.is_cancelled() {
                        warn!(cmd = %invocation.display(), "command cancelled");
                        return Err(ProcessError::Cancelled);
                    }
                }
            }
        };

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !result.success() {
            debug!(code = ?result.code, "command exited unsuccessfully");
        }
        Ok(result)
    }
}

/// Build the `ToolMissing` error for `program` with an install hint.
pub fn tool_missing(program: &str) -> ProcessError {
    ProcessError::ToolMissing {
        tool: program.to_string(),
        hint: install_hint(program).to_string(),
    }
}

/// Where to get a missing tool.
pub fn install_hint(program: &str) -> &'static str {
    let base = std::path::Path::new(program)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(program);
    match base {
        "flutter" => "install the Flutter SDK from https://docs.flutter.dev/get-started/install and make sure `flutter` is on PATH",
        "dart" => "install the Dart SDK from https://dart.dev/get-dart and make sure `dart` is on PATH",
        "git" => "install git from https://git-scm.com/downloads and make sure `git` is on PATH",
        _ => "install it or point depsync.toml [tool] at its full path",
    }
}
