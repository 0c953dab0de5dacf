//! Staleness detection.
//!
//! A locked git dependency is stale when the revision its ref points at
//! upstream no longer matches the revision recorded in the lock file. When
//! the remote cannot be asked, the dependency is reported as unknown and the
//! lock file's age serves as a coarse fallback signal.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::StalenessError;
use crate::git::RemoteOracle;
use crate::lock::read_git_dependencies;
use crate::models::GitDependency;
use crate::process::CancelToken;
use crate::project::Project;

/// Outcome of checking one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StalenessStatus {
    Current,
    Stale,
    /// The remote could not be consulted; never counted as stale.
    Unknown { reason: String },
}

impl std::fmt::Display for StalenessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Current => write!(f, "current"),
            Self::Stale => write!(f, "stale"),
            Self::Unknown { .. } => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalenessResult {
    pub dependency: GitDependency,
    pub remote_revision: Option<String>,
    pub status: StalenessStatus,
}

impl StalenessResult {
    pub fn is_stale(&self) -> bool {
        self.status == StalenessStatus::Stale
    }
}

/// Full staleness picture for one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessReport {
    pub results: Vec<StalenessResult>,
    /// Age of the lock file, when its mtime is readable.
    pub lock_age: Option<Duration>,
    /// The lock file is older than the configured threshold.
    pub lock_possibly_stale: bool,
}

impl StalenessReport {
    /// Dependencies precisely known to be behind upstream.
    pub fn stale(&self) -> impl Iterator<Item = &StalenessResult> {
        self.results.iter().filter(|r| r.is_stale())
    }

    pub fn unknown(&self) -> impl Iterator<Item = &StalenessResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, StalenessStatus::Unknown { .. }))
    }

    pub fn stale_names(&self) -> Vec<String> {
        self.stale().map(|r| r.dependency.name.clone()).collect()
    }
}

/// Whether two revisions name the same commit, allowing either side to be
/// abbreviated.
pub fn revisions_match(locked: &str, remote: &str) -> bool {
    let locked = locked.trim().to_ascii_lowercase();
    let remote = remote.trim().to_ascii_lowercase();
    if locked.is_empty() || remote.is_empty() {
        return false;
    }
    locked.starts_with(&remote) || remote.starts_with(&locked)
}

/// Compares locked revisions against a [`RemoteOracle`].
pub struct StalenessDetector {
    oracle: Arc<dyn RemoteOracle>,
    max_lock_age: Duration,
}

impl StalenessDetector {
    pub fn new(oracle: Arc<dyn RemoteOracle>, max_lock_age: Duration) -> Self {
        Self { oracle, max_lock_age }
    }

    /// Check each dependency in order.
    ///
    /// Only a missing `git` binary or cancellation fail the whole call;
    /// every other remote failure becomes [`StalenessStatus::Unknown`].
    pub async fn check(&self, deps: &[GitDependency], cancel: &CancelToken) -> Result<Vec<StalenessResult>, StalenessError> {
        let mut results = Vec::with_capacity(deps.len());
        for dep in deps {
            let result = match self.oracle.resolve_ref(&dep.url, &dep.git_ref, cancel).await {
                Ok(remote) => {
                    let status = if revisions_match(&dep.resolved_revision, &remote) {
                        StalenessStatus::Current
                    } else {
                        StalenessStatus::Stale
                    };
                    debug!(name = %dep.name, locked = %dep.resolved_revision, remote = %remote, %status, "checked dependency");
                    StalenessResult {
                        dependency: dep.clone(),
                        remote_revision: Some(remote),
                        status,
                    }
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(name = %dep.name, error = %e, "skipping staleness check");
                    StalenessResult {
                        dependency: dep.clone(),
                        remote_revision: None,
                        status: StalenessStatus::Unknown { reason: e.to_string() },
                    }
                }
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Parse the project's lock file and check every git dependency in it.
    pub async fn detect(&self, project: &Project, cancel: &CancelToken) -> Result<StalenessReport, StalenessError> {
        let deps = read_git_dependencies(&project.lock_path).map_err(|source| StalenessError::LockUnreadable {
            path: project.lock_path.clone(),
            source,
        })?;
        info!(count = deps.len(), lock = %project.lock_path.display(), "checking git dependencies");

        let lock_age = lock_age(&project.lock_path);
        let lock_possibly_stale = lock_age.map(|age| age > self.max_lock_age).unwrap_or(false);

        let results = self.check(&deps, cancel).await?;
        let report = StalenessReport {
            results,
            lock_age,
            lock_possibly_stale,
        };
        info!(
            stale = report.stale().count(),
            unknown = report.unknown().count(),
            lock_possibly_stale,
            "staleness check complete"
        );
        Ok(report)
    }
}

/// Time since the file was last modified.
pub fn lock_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    SystemTime::now().duration_since(modified).ok()
}
