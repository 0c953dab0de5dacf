//! Project discovery.
//!
//! A project is the nearest directory, walking upward from a start
//! directory, that contains the manifest file.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::config::FilesConfig;
use crate::errors::ProjectError;

/// A located project. Immutable for the duration of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub root: PathBuf,
    pub manifest_path: PathBuf,
    pub lock_path: PathBuf,
    /// Top-level `name:` of the manifest, when it has one.
    pub name: Option<String>,
}

impl Project {
    /// Walk upward from `start` until a directory holding `files.manifest`
    /// is found.
    #[instrument(skip(files), fields(start = %start.as_ref().display()))]
    pub fn discover<P: AsRef<Path>>(start: P, files: &FilesConfig) -> Result<Self, ProjectError> {
        let start = start.as_ref();
        let start = if start.is_absolute() {
            start.to_path_buf()
        } else {
            std::env::current_dir()?.join(start)
        };

        for dir in start.ancestors() {
            let candidate = dir.join(&files.manifest);
            if candidate.is_file() {
                debug!(root = %dir.display(), "found project manifest");
                return Ok(Self::at(dir, files));
            }
        }

        Err(ProjectError::NotFound {
            start,
            manifest: files.manifest.clone(),
        })
    }

    /// Build a project rooted at `root` without searching.
    pub fn at(root: &Path, files: &FilesConfig) -> Self {
        let manifest_path = root.join(&files.manifest);
        let name = std::fs::read_to_string(&manifest_path)
            .ok()
            .and_then(|text| read_manifest_name(&text));
        Self {
            root: root.to_path_buf(),
            lock_path: root.join(&files.lock),
            manifest_path,
            name,
        }
    }

    pub fn has_lock(&self) -> bool {
        self.lock_path.is_file()
    }
}

/// Extract the top-level `name:` value from a manifest.
pub(crate) fn read_manifest_name(text: &str) -> Option<String> {
    text.lines()
        .filter(|line| !line.starts_with(' ') && !line.starts_with('\t'))
        .find_map(|line| line.strip_prefix("name:"))
        .map(|value| unquote(strip_comment(value).trim()).to_string())
        .filter(|name| !name.is_empty())
}

/// Remove a trailing ` # comment`.
pub(crate) fn strip_comment(value: &str) -> &str {
    match value.find(" #") {
        Some(pos) => &value[..pos],
        None => value,
    }
}

/// Remove one layer of matching single or double quotes.
pub(crate) fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' || first == b'\'') && first == last {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, body: &str) {
        std::fs::write(dir.join("pubspec.yaml"), body).unwrap();
    }

    #[test]
    fn test_discover_in_start_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "name: my_app\n");

        let project = Project::discover(dir.path(), &FilesConfig::default()).unwrap();
        assert_eq!(project.root, dir.path());
        assert_eq!(project.manifest_path, dir.path().join("pubspec.yaml"));
        assert_eq!(project.lock_path, dir.path().join("pubspec.lock"));
        assert_eq!(project.name.as_deref(), Some("my_app"));
    }

    #[test]
    fn test_discover_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "name: root_app\n");
        let nested = dir.path().join("lib").join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        let project = Project::discover(&nested, &FilesConfig::default()).unwrap();
        assert_eq!(project.root, dir.path());
    }

    #[test]
    fn test_discover_nearest_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "name: outer\n");
        let inner = dir.path().join("packages").join("inner");
        std::fs::create_dir_all(&inner).unwrap();
        write_manifest(&inner, "name: inner\n");

        let project = Project::discover(inner.join("."), &FilesConfig::default()).unwrap();
        assert_eq!(project.name.as_deref(), Some("inner"));
    }

    #[test]
    fn test_discover_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let files = FilesConfig {
            manifest: "depsync-test-manifest-that-does-not-exist.yaml".into(),
            ..Default::default()
        };
        let result = Project::discover(dir.path(), &files);
        assert!(matches!(result, Err(ProjectError::NotFound { .. })));
    }

    #[test]
    fn test_manifest_directory_is_not_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let files = FilesConfig {
            manifest: "depsync-test-manifest-dir".into(),
            ..Default::default()
        };
        std::fs::create_dir(dir.path().join(&files.manifest)).unwrap();
        assert!(Project::discover(dir.path(), &files).is_err());
    }

    #[test]
    fn test_read_manifest_name() {
        assert_eq!(read_manifest_name("name: app\n").as_deref(), Some("app"));
        assert_eq!(read_manifest_name("name: \"quoted\" # c\n").as_deref(), Some("quoted"));
        assert_eq!(
            read_manifest_name("dependencies:\n  name: nested\nname: top\n").as_deref(),
            Some("top")
        );
        assert_eq!(read_manifest_name("version: 1.0.0\n"), None);
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"abc\""), "abc");
        assert_eq!(unquote("'abc'"), "abc");
        assert_eq!(unquote("'abc\""), "'abc\"");
        assert_eq!(unquote("x"), "x");
    }
}
