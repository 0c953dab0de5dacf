//! Source repository checkout via `git2`.
//!
//! Used by the engine's optional clone step: the source repository is
//! cloned into a temporary directory, the requested ref is checked out, and
//! every directory holding a manifest becomes a candidate package.

use std::path::{Path, PathBuf};

use git2::{build::CheckoutBuilder, Oid, Repository};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info, instrument};

use crate::errors::SourceError;
use crate::models::PackageSpec;
use crate::project::read_manifest_name;

/// Directories never descended into during discovery.
const SKIPPED_DIRS: &[&str] = &[".git", ".dart_tool", "build", "node_modules", ".pub-cache"];

/// A package found inside a source checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPackage {
    pub name: String,
    /// Path relative to the repository root, `None` for the root itself.
    pub subdirectory: Option<String>,
}

impl DiscoveredPackage {
    /// The spec that installs this package from `url` at `git_ref`.
    pub fn to_spec(&self, url: &str, git_ref: Option<&str>) -> PackageSpec {
        PackageSpec {
            name: self.name.clone(),
            url: url.to_string(),
            git_ref: git_ref.map(str::to_string),
            subdirectory: self.subdirectory.clone(),
        }
    }
}

/// A cloned source repository. The clone is removed when this is dropped.
pub struct SourceCheckout {
    repo: Repository,
    head: Oid,
    _dir: TempDir,
}

impl SourceCheckout {
    /// Clone `url` into a fresh temporary directory and check out `git_ref`
    /// (branch, tag or commit). `None` keeps the remote's default branch.
    #[instrument(fields(url = %url))]
    pub fn clone_at(url: &str, git_ref: Option<&str>) -> Result<Self, SourceError> {
        let dir = tempfile::Builder::new().prefix("depsync-source-").tempdir()?;
        info!(path = %dir.path().display(), "cloning source repository");
        let repo = Repository::clone(url, dir.path())?;

        let head = match git_ref {
            Some(r) => checkout_ref(&repo, r)?,
            None => repo.head()?.peel_to_commit()?.id(),
        };
        debug!(head = %head, "source checkout ready");

        Ok(Self { repo, head, _dir: dir })
    }

    pub fn path(&self) -> &Path {
        self.repo
            .workdir()
            .unwrap_or_else(|| self.repo.path())
    }

    pub fn head_sha(&self) -> String {
        self.head.to_string()
    }

    /// Packages in the checkout whose relative directory matches one of
    /// `include` (all when empty).
    pub fn discover_packages(&self, manifest: &str, include: &[String]) -> Result<Vec<DiscoveredPackage>, SourceError> {
        discover_packages(self.path(), manifest, include)
    }
}

/// Resolve `git_ref` in a fresh clone and check it out detached.
fn checkout_ref(repo: &Repository, git_ref: &str) -> Result<Oid, SourceError> {
    let candidates = [
        format!("refs/remotes/origin/{}", git_ref),
        format!("refs/tags/{}", git_ref),
        git_ref.to_string(),
    ];
    let object = candidates
        .iter()
        .find_map(|spec| repo.revparse_single(spec).ok())
        .ok_or_else(|| SourceError::RefNotFound(git_ref.to_string()))?;
    let commit = object
        .peel_to_commit()
        .map_err(|_| SourceError::RefNotFound(git_ref.to_string()))?;

    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
    repo.set_head_detached(commit.id())?;
    info!(git_ref, sha = %commit.id(), "checked out source ref");
    Ok(commit.id())
}

/// Walk `root` for directories that contain `manifest`.
pub fn discover_packages(root: &Path, manifest: &str, include: &[String]) -> Result<Vec<DiscoveredPackage>, SourceError> {
    let mut found = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let manifest_path = dir.join(manifest);
        if manifest_path.is_file() {
            let rel = relative_slash_path(root, &dir);
            let matches = include.is_empty()
                || include
                    .iter()
                    .any(|pattern| glob_match::glob_match(pattern, rel.as_deref().unwrap_or(".")));
            if matches {
                let text = std::fs::read_to_string(&manifest_path)?;
                match read_manifest_name(&text) {
                    Some(name) => found.push(DiscoveredPackage { name, subdirectory: rel }),
                    None => debug!(path = %manifest_path.display(), "manifest without a name, skipping"),
                }
            }
        }

        let mut children = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            children.push(entry.path());
        }
        // Reverse-sorted so the stack pops in lexical order.
        children.sort();
        children.reverse();
        stack.extend(children);
    }

    debug!(count = found.len(), "discovered packages");
    Ok(found)
}

fn relative_slash_path(root: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return None;
    }
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{IndexAddOption, Signature};

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn commit_all(repo: &Repository, message: &str) -> Oid {
        let mut index = repo.index().unwrap();
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test", "test@test.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents).unwrap()
    }

    #[test]
    fn test_discover_packages_layout() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("pubspec.yaml"), "name: mono_root\n");
        write(&dir.path().join("packages/a/pubspec.yaml"), "name: pkg_a\n");
        write(&dir.path().join("packages/b/pubspec.yaml"), "name: pkg_b\n");
        write(&dir.path().join("packages/b/build/pubspec.yaml"), "name: ignored\n");
        write(&dir.path().join("tools/pubspec.yaml"), "version: 1.0.0\n");

        let all = discover_packages(dir.path(), "pubspec.yaml", &[]).unwrap();
        let names: Vec<&str> = all.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["mono_root", "pkg_a", "pkg_b"]);
        assert_eq!(all[0].subdirectory, None);
        assert_eq!(all[1].subdirectory.as_deref(), Some("packages/a"));

        let filtered = discover_packages(dir.path(), "pubspec.yaml", &["packages/*".to_string()]).unwrap();
        let names: Vec<&str> = filtered.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["pkg_a", "pkg_b"]);
    }

    #[test]
    fn test_to_spec() {
        let pkg = DiscoveredPackage {
            name: "pkg_a".into(),
            subdirectory: Some("packages/a".into()),
        };
        let spec = pkg.to_spec("https://x/mono.git", Some("v1"));
        assert_eq!(spec.url, "https://x/mono.git");
        assert_eq!(spec.git_ref.as_deref(), Some("v1"));
        assert_eq!(spec.subdirectory.as_deref(), Some("packages/a"));
    }

    #[test]
    fn test_clone_at_ref_from_local_repo() {
        let origin_dir = tempfile::tempdir().unwrap();
        let origin = Repository::init(origin_dir.path()).unwrap();
        write(&origin_dir.path().join("packages/a/pubspec.yaml"), "name: pkg_a\n");
        let first = commit_all(&origin, "first");
        origin.tag_lightweight("v1", &origin.find_object(first, None).unwrap(), false).unwrap();
        write(&origin_dir.path().join("packages/b/pubspec.yaml"), "name: pkg_b\n");
        let second = commit_all(&origin, "second");

        let url = origin_dir.path().to_str().unwrap();

        let latest = SourceCheckout::clone_at(url, None).unwrap();
        assert_eq!(latest.head_sha(), second.to_string());
        assert_eq!(latest.discover_packages("pubspec.yaml", &[]).unwrap().len(), 2);

        let tagged = SourceCheckout::clone_at(url, Some("v1")).unwrap();
        assert_eq!(tagged.head_sha(), first.to_string());
        let pkgs = tagged.discover_packages("pubspec.yaml", &[]).unwrap();
        assert_eq!(pkgs.len(), 1);
        assert_eq!(pkgs[0].name, "pkg_a");
    }

    #[test]
    fn test_clone_unknown_ref() {
        let origin_dir = tempfile::tempdir().unwrap();
        let origin = Repository::init(origin_dir.path()).unwrap();
        write(&origin_dir.path().join("pubspec.yaml"), "name: a\n");
        commit_all(&origin, "init");

        let result = SourceCheckout::clone_at(origin_dir.path().to_str().unwrap(), Some("no-such-ref"));
        assert!(matches!(result, Err(SourceError::RefNotFound(_))));
    }
}
