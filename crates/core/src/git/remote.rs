//! Remote ref lookups ("what revision does `<ref>` point at upstream?").

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use git2::{Direction, Remote};
use tracing::{debug, instrument, warn};

use crate::errors::{ProcessError, RemoteError};
use crate::process::{CancelToken, CommandRunner, Invocation, CANCEL_POLL};

/// Answers the current upstream revision of a named ref.
#[async_trait]
pub trait RemoteOracle: Send + Sync {
    async fn resolve_ref(&self, url: &str, git_ref: &str, cancel: &CancelToken) -> Result<String, RemoteError>;
}

// ---------------------------------------------------------------------------
// `git ls-remote`
// ---------------------------------------------------------------------------

/// Oracle that shells out to `git ls-remote <url> <ref>`.
pub struct GitCliOracle {
    runner: Arc<dyn CommandRunner>,
    git: String,
    timeout: Duration,
}

impl GitCliOracle {
    pub fn new(runner: Arc<dyn CommandRunner>, git: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            git: git.into(),
            timeout,
        }
    }
}

#[async_trait]
impl RemoteOracle for GitCliOracle {
    #[instrument(skip(self, cancel))]
    async fn resolve_ref(&self, url: &str, git_ref: &str, cancel: &CancelToken) -> Result<String, RemoteError> {
        let invocation = Invocation::new(&self.git, ["ls-remote", url, git_ref]).with_timeout(self.timeout);
        let output = match self.runner.run(&invocation, cancel).await {
            Ok(output) => output,
            Err(e @ ProcessError::ToolMissing { .. }) | Err(e @ ProcessError::Cancelled) => {
                return Err(RemoteError::Process(e))
            }
            Err(e) => {
                return Err(RemoteError::RemoteUnavailable {
                    url: url.to_string(),
                    detail: e.to_string(),
                })
            }
        };

        if !output.success() {
            let detail = output.stderr.trim().to_string();
            warn!(url, code = ?output.code, %detail, "ls-remote failed");
            return Err(RemoteError::RemoteUnavailable {
                url: url.to_string(),
                detail,
            });
        }

        let listing = parse_ls_remote(&output.stdout);
        match select_revision(&listing, git_ref) {
            Some(rev) => {
                debug!(url, git_ref, rev, "resolved remote ref");
                Ok(rev.to_string())
            }
            None => Err(RemoteError::RefNotFound {
                url: url.to_string(),
                git_ref: git_ref.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// libgit2
// ---------------------------------------------------------------------------

/// Oracle that lists remote refs in-process through libgit2.
///
/// libgit2 cannot be interrupted, so a query that outlives its budget or is
/// cancelled is abandoned; the blocking thread finishes in the background.
#[derive(Debug, Clone, Copy)]
pub struct Git2Oracle {
    timeout: Duration,
}

impl Git2Oracle {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for Git2Oracle {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl RemoteOracle for Git2Oracle {
    #[instrument(skip(self, cancel))]
    async fn resolve_ref(&self, url: &str, git_ref: &str, cancel: &CancelToken) -> Result<String, RemoteError> {
        cancel.check()?;
        let unavailable = |detail: String| RemoteError::RemoteUnavailable {
            url: url.to_string(),
            detail,
        };

        let owned_url = url.to_string();
        let query = tokio::task::spawn_blocking(move || list_remote_refs(&owned_url));
        let budget = cancel.bound(self.timeout);
        let expiry = tokio::time::sleep(budget);
        let mut poll = tokio::time::interval(CANCEL_POLL);
        tokio::pin!(query, expiry);
        let joined = loop {
            tokio::select! {
                joined = &mut query => break joined,
                _ = &mut expiry => {
                    cancel.check()?;
                    warn!(url, secs = budget.as_secs(), "libgit2 ref listing timed out");
                    return Err(unavailable(format!("timed out after {}s", budget.as_secs())));
                }
                _ = poll.tick() => cancel.check()?,
            }
        };
        let listing = joined
            .map_err(|e| unavailable(e.to_string()))?
            .map_err(|e| unavailable(e.message().to_string()))?;

        select_revision(&listing, git_ref)
            .map(str::to_string)
            .ok_or_else(|| RemoteError::RefNotFound {
                url: url.to_string(),
                git_ref: git_ref.to_string(),
            })
    }
}

fn list_remote_refs(url: &str) -> Result<Vec<(String, String)>, git2::Error> {
    let mut remote = Remote::create_detached(url)?;
    remote.connect(Direction::Fetch)?;
    let refs = remote
        .list()?
        .iter()
        .map(|head| (head.oid().to_string(), head.name().to_string()))
        .collect();
    Ok(refs)
}

// ---------------------------------------------------------------------------
// Listing helpers
// ---------------------------------------------------------------------------

/// Parse `ls-remote` output into `(revision, ref_path)` pairs.
pub fn parse_ls_remote(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let (rev, path) = line.split_once('\t')?;
            let (rev, path) = (rev.trim(), path.trim());
            if rev.is_empty() || path.is_empty() {
                return None;
            }
            Some((rev.to_string(), path.to_string()))
        })
        .collect()
}

/// Pick the revision for `git_ref` from a listing.
///
/// The first entry whose path equals the ref or ends with `/<ref>` wins. When
/// the winning path is an annotated tag and the listing carries its peeled
/// `^{}` entry, the peeled commit is returned instead of the tag object.
pub fn select_revision<'a>(listing: &'a [(String, String)], git_ref: &str) -> Option<&'a str> {
    let suffix = format!("/{}", git_ref);
    let (rev, path) = listing
        .iter()
        .find(|(_, path)| !path.ends_with("^{}") && (path == git_ref || path.ends_with(&suffix)))?;

    let peeled = format!("{}^{{}}", path);
    let commit = listing
        .iter()
        .find(|(_, p)| *p == peeled)
        .map(|(r, _)| r.as_str());
    Some(commit.unwrap_or(rev.as_str()))
}
