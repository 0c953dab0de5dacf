//! Lock file access.

pub mod parser;

use std::path::Path;

pub use parser::{parse_lock, LockParser, ParseState};

use crate::models::GitDependency;

/// Read and parse the git entries of the lock file at `path`.
pub fn read_git_dependencies(path: &Path) -> std::io::Result<Vec<GitDependency>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_lock(&text))
}
