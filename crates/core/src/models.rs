//! Domain model types used throughout depsync.
//!
//! These types bridge the lock parser, installer, conflict analyzer, sync
//! engine and the command-line front end.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `structured_data` key: the failure matched a known conflict signature.
pub const KEY_NEEDS_RESOLUTION: &str = "needs_resolution";
/// `structured_data` key: conflict category, e.g. `version_solving`.
pub const KEY_CONFLICT_TYPE: &str = "conflict_type";
/// `structured_data` key: package named as the cause of the conflict.
pub const KEY_CONFLICTING_PKG: &str = "conflicting_pkg";
/// `structured_data` key: category of a non-conflict failure.
pub const KEY_FAILURE_KIND: &str = "failure_kind";
/// `structured_data` key: the package this result is about.
pub const KEY_PACKAGE: &str = "package";
/// `structured_data` key: resolution strategy applied to produce this result.
pub const KEY_RESOLUTION: &str = "resolution";

// ---------------------------------------------------------------------------
// Lock entries
// ---------------------------------------------------------------------------

/// A git-sourced dependency as recorded in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitDependency {
    pub name: String,
    pub url: String,
    pub git_ref: String,
    pub resolved_revision: String,
}

// ---------------------------------------------------------------------------
// Install intent
// ---------------------------------------------------------------------------

/// Caller-supplied intent to add a git dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    pub name: String,
    pub url: String,
    /// Branch, tag or commit. `None` lets the build tool pick the default branch.
    pub git_ref: Option<String>,
    /// Path of the package inside the repository.
    pub subdirectory: Option<String>,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            git_ref: None,
            subdirectory: None,
        }
    }

    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = Some(git_ref.into());
        self
    }

    pub fn with_subdirectory(mut self, path: impl Into<String>) -> Self {
        self.subdirectory = Some(path.into());
        self
    }

    /// Parse the command-line shorthand `name=url[#ref[:path]]`.
    pub fn parse_shorthand(input: &str) -> Option<Self> {
        let (name, rest) = input.split_once('=')?;
        let name = name.trim();
        if name.is_empty() || rest.is_empty() {
            return None;
        }
        let (url, fragment) = match rest.rsplit_once('#') {
            Some((url, fragment)) => (url, Some(fragment)),
            None => (rest, None),
        };
        if url.is_empty() {
            return None;
        }
        let mut spec = Self::new(name, url);
        if let Some(fragment) = fragment {
            let (git_ref, path) = match fragment.split_once(':') {
                Some((r, p)) => (r, Some(p)),
                None => (fragment, None),
            };
            if !git_ref.is_empty() {
                spec.git_ref = Some(git_ref.to_string());
            }
            if let Some(p) = path.filter(|p| !p.is_empty()) {
                spec.subdirectory = Some(p.to_string());
            }
        }
        Some(spec)
    }
}

// ---------------------------------------------------------------------------
// Action results
// ---------------------------------------------------------------------------

/// Uniform outcome record for every engine operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub ok: bool,
    pub message: String,
    pub error_text: Option<String>,
    pub logs: Vec<String>,
    pub structured_data: BTreeMap<String, Value>,
}

impl ActionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>, error_text: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            error_text: Some(error_text.into()),
            ..Default::default()
        }
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.structured_data.insert(key.to_string(), value.into());
        self
    }

    pub fn set_data(&mut self, key: &str, value: impl Into<Value>) {
        self.structured_data.insert(key.to_string(), value.into());
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.structured_data.get(key).and_then(Value::as_str)
    }

    /// Whether the conflict analyzer flagged this failure as resolvable.
    pub fn needs_resolution(&self) -> bool {
        self.structured_data
            .get(KEY_NEEDS_RESOLUTION)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn conflict_type(&self) -> Option<&str> {
        self.data_str(KEY_CONFLICT_TYPE)
    }

    pub fn conflicting_package(&self) -> Option<&str> {
        self.data_str(KEY_CONFLICTING_PKG)
    }

    pub fn package(&self) -> Option<&str> {
        self.data_str(KEY_PACKAGE)
    }
}

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

/// A manifest snapshot taken before a mutating run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_path: PathBuf,
    pub timestamp: DateTime<Utc>,
    pub original_path: PathBuf,
    /// Hex SHA-256 of the snapshot contents.
    pub sha256: String,
}
