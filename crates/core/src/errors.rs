//! Error types for the depsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Project(#[from] ProjectError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Staleness(#[from] StalenessError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Project discovery errors
// ---------------------------------------------------------------------------

/// Errors from locating the project root.
#[derive(Debug, Error)]
pub enum ProjectError {
    /// No directory between `start` and the filesystem root holds the manifest.
    #[error("no {manifest} found in '{}' or any parent directory", .start.display())]
    NotFound { start: PathBuf, manifest: String },

    /// Generic I/O wrapper.
    #[error("project I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Subprocess errors
// ---------------------------------------------------------------------------

/// Errors from running an external program.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The binary was not found on `$PATH`.
    #[error("required tool '{tool}' not found on PATH; {hint}")]
    ToolMissing { tool: String, hint: String },

    /// The command did not finish within its time budget.
    #[error("'{program}' timed out after {secs}s")]
    TimedOut { program: String, secs: u64 },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The directory the command should run in does not exist.
    #[error("working directory '{}' does not exist", .0.display())]
    WorkingDirMissing(PathBuf),

    /// Generic I/O wrapper (spawn / wait failures).
    #[error("process I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Remote oracle errors
// ---------------------------------------------------------------------------

/// Errors from querying a remote git endpoint.
///
/// All variants except [`RemoteError::Process`] carrying `ToolMissing` are
/// non-fatal for a staleness run: the dependency is simply not checked.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network or process failure talking to the remote.
    #[error("remote '{url}' unavailable: {detail}")]
    RemoteUnavailable { url: String, detail: String },

    /// The remote answered but does not advertise the ref.
    #[error("ref '{git_ref}' not found on remote '{url}'")]
    RefNotFound { url: String, git_ref: String },

    /// Underlying subprocess error.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),
}

impl RemoteError {
    /// Whether this failure must abort the caller instead of degrading it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Process(ProcessError::ToolMissing { .. }) | Self::Process(ProcessError::Cancelled)
        )
    }
}

// ---------------------------------------------------------------------------
// Staleness errors
// ---------------------------------------------------------------------------

/// Errors from the staleness detector.
#[derive(Debug, Error)]
pub enum StalenessError {
    /// The lock file could not be read.
    #[error("cannot read lock file '{}': {source}", .path.display())]
    LockUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A fatal remote error (missing git binary, cancellation).
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

// ---------------------------------------------------------------------------
// Backup errors
// ---------------------------------------------------------------------------

/// Errors from the backup manager.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Creating or verifying the snapshot failed; no mutation may proceed.
    #[error("backup of '{}' failed: {detail}", .path.display())]
    BackupFailed { path: PathBuf, detail: String },

    /// The snapshot to restore does not exist.
    #[error("backup not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Generic I/O wrapper.
    #[error("backup I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Installer errors
// ---------------------------------------------------------------------------

/// Errors from the dependency installer.
///
/// A non-zero exit of the build tool is *not* an error here: it is reported
/// as a failed [`crate::models::ActionResult`]. Only conditions that prevent
/// the tool from running at all surface as `InstallError`.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Underlying subprocess error (tool missing, timeout, cancellation).
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// A package descriptor could not be encoded.
    #[error("invalid package descriptor for '{name}': {detail}")]
    InvalidSpec { name: String, detail: String },
}

impl InstallError {
    /// Whether the build tool itself is missing.
    pub fn is_tool_missing(&self) -> bool {
        matches!(self, Self::Process(ProcessError::ToolMissing { .. }))
    }
}

// ---------------------------------------------------------------------------
// Source checkout errors
// ---------------------------------------------------------------------------

/// Errors from cloning and scanning a source repository.
#[derive(Debug, Error)]
pub enum SourceError {
    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// The requested ref could not be resolved in the clone.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// Generic I/O wrapper.
    #[error("source I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors from the step-driven sync engine.
///
/// `InvalidStateTransition` and `NoPendingConflict` reject a single caller
/// request and leave the engine where it was. Every other variant ends the run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A required external binary is missing.
    #[error("{0}")]
    ToolMissing(ProcessError),

    /// The pre-run backup could not be created.
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// The source repository could not be cloned.
    #[error("source checkout failed: {0}")]
    Source(#[from] SourceError),

    /// The caller cancelled the run.
    #[error("sync cancelled")]
    Cancelled,

    /// The engine was asked to do something its current phase does not allow.
    #[error("invalid sync state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// `resolve` was called for a package with no pending conflict.
    #[error("no pending conflict for package '{0}'")]
    NoPendingConflict(String),

    /// Installer error that is not tool-missing (e.g. bad descriptor).
    #[error("install error: {0}")]
    Install(InstallError),
}

impl From<InstallError> for SyncError {
    fn from(err: InstallError) -> Self {
        match err {
            InstallError::Process(ProcessError::Cancelled) => Self::Cancelled,
            InstallError::Process(e @ ProcessError::ToolMissing { .. }) => Self::ToolMissing(e),
            other => Self::Install(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
