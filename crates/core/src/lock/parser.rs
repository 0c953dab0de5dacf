//! Tagged-state parser for the git entries of a `pubspec.lock`.
//!
//! This is not a YAML parser. It understands exactly the following shapes
//! and ignores everything else:
//!
//! ```text
//! packages:                      <- indent 0: any top-level line resets to TopLevel
//!   pkg_a:                       <- indent 2, `name:` with no value: opens a block
//!     source: git                <- enters InGitSource (any other source drops the block)
//!     url: https://x/a           <- url / ref / revision keys at any deeper indent
//!     ref: main
//!     revision: abc123           <- in InGitSource: emits the record and resets
//!   pkg_b:
//!     dependency: "direct main"
//!     description:
//!       path: "."
//!       ref: main
//!       resolved-ref: "0a1b2c"   <- pub's spelling of `revision`
//!       url: "https://x/b.git"
//!     source: git                <- block already complete: emits on entry
//!     version: "1.0.0"
//! ```
//!
//! Values may be bare, single-quoted or double-quoted and may carry a
//! trailing ` # comment`. Blank lines and comment lines are skipped. A block
//! missing any of url, ref or revision is dropped without error.

use tracing::{debug, trace};

use crate::models::GitDependency;
use crate::project::{strip_comment, unquote};

/// Parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    TopLevel,
    InDependencyBlock,
    InGitSource,
}

#[derive(Debug, Default)]
struct PendingEntry {
    name: String,
    url: Option<String>,
    git_ref: Option<String>,
    revision: Option<String>,
}

impl PendingEntry {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn complete(&self) -> Option<GitDependency> {
        Some(GitDependency {
            name: self.name.clone(),
            url: self.url.clone()?,
            git_ref: self.git_ref.clone()?,
            resolved_revision: self.revision.clone()?,
        })
    }
}

/// Line-fed lock parser.
#[derive(Debug)]
pub struct LockParser {
    state: ParseState,
    pending: Option<PendingEntry>,
    entries: Vec<GitDependency>,
}

impl Default for LockParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LockParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::TopLevel,
            pending: None,
            entries: Vec::new(),
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Feed one line (without its newline).
    pub fn feed(&mut self, raw: &str) {
        let line = raw.trim_end_matches('\r');
        let content = line.trim_start();
        if content.is_empty() || content.starts_with('#') {
            return;
        }
        let indent = line.len() - content.len();

        if indent == 0 {
            self.reset();
            return;
        }

        let Some((key, value)) = split_key_value(content) else {
            return;
        };

        if indent == 2 {
            self.reset();
            if value.is_empty() {
                trace!(name = key, "opening dependency block");
                self.pending = Some(PendingEntry::new(key));
                self.state = ParseState::InDependencyBlock;
            }
            return;
        }

        if self.state == ParseState::TopLevel {
            return;
        }

        match key {
            "source" => {
                if value == "git" {
                    self.state = ParseState::InGitSource;
                    let ready = self
                        .pending
                        .as_ref()
                        .map(|p| p.complete().is_some())
                        .unwrap_or(false);
                    if ready {
                        self.emit();
                    }
                } else {
                    trace!(source = value, "dropping non-git block");
                    self.reset();
                }
            }
            "url" => self.set_field(|p| &mut p.url, value),
            "ref" => self.set_field(|p| &mut p.git_ref, value),
            "revision" | "resolved-ref" => {
                self.set_field(|p| &mut p.revision, value);
                if self.state == ParseState::InGitSource {
                    self.emit();
                }
            }
            _ => {}
        }
    }

    /// Consume the parser and return the complete git entries in file order.
    pub fn finish(self) -> Vec<GitDependency> {
        debug!(count = self.entries.len(), "parsed git lock entries");
        self.entries
    }

    fn set_field(&mut self, field: impl FnOnce(&mut PendingEntry) -> &mut Option<String>, value: &str) {
        if value.is_empty() {
            return;
        }
        if let Some(pending) = self.pending.as_mut() {
            *field(pending) = Some(value.to_string());
        }
    }

    /// Emit the pending entry if complete, then return to `TopLevel`.
    fn emit(&mut self) {
        if let Some(dep) = self.pending.as_ref().and_then(PendingEntry::complete) {
            match self.entries.iter_mut().find(|e| e.name == dep.name) {
                Some(existing) => *existing = dep,
                None => self.entries.push(dep),
            }
        } else if let Some(p) = &self.pending {
            trace!(name = %p.name, "dropping incomplete git block");
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.state = ParseState::TopLevel;
        self.pending = None;
    }
}

/// Split `key: value` into its trimmed, unquoted parts.
fn split_key_value(content: &str) -> Option<(&str, &str)> {
    let (key, value) = content.split_once(':')?;
    let key = unquote(key.trim());
    let value = unquote(strip_comment(value).trim());
    Some((key, value))
}

/// Parse a whole lock document.
pub fn parse_lock(text: &str) -> Vec<GitDependency> {
    let mut parser = LockParser::new();
    for line in text.lines() {
        parser.feed(line);
    }
    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUB_LOCK: &str = r#"# Generated by pub
# See https://dart.dev/tools/pub/glossary#lockfile
packages:
  async:
    dependency: transitive
    description:
      name: async
      sha256: "947bfcf187f74dbc5e146c9eb9c0f10c9f8b30743e341481c1e2ed3ecc18c20c"
      url: "https://pub.dev"
    source: hosted
    version: "2.11.0"
  pkg_b:
    dependency: "direct main"
    description:
      path: "."
      ref: main
      resolved-ref: "0a1b2c3d4e5f60718293a4b5c6d7e8f901234567"
      url: "https://github.com/acme/pkg_b.git"
    source: git
    version: "1.2.0"
  local_pkg:
    dependency: "direct main"
    description:
      path: "../local_pkg"
      relative: true
    source: path
    version: "0.0.1"
sdks:
  dart: ">=3.0.0 <4.0.0"
"#;

    #[test]
    fn test_source_first_shape() {
        let text = "packages:\n  pkg_a:\n    source: git\n    url: https://x/a\n    ref: main\n    revision: abc123\n";
        let deps = parse_lock(text);
        assert_eq!(
            deps,
            vec![GitDependency {
                name: "pkg_a".into(),
                url: "https://x/a".into(),
                git_ref: "main".into(),
                resolved_revision: "abc123".into(),
            }]
        );
    }

    #[test]
    fn test_pub_lock_shape() {
        let deps = parse_lock(PUB_LOCK);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].name, "pkg_b");
        assert_eq!(deps[0].url, "https://github.com/acme/pkg_b.git");
        assert_eq!(deps[0].git_ref, "main");
        assert_eq!(deps[0].resolved_revision, "0a1b2c3d4e5f60718293a4b5c6d7e8f901234567");
    }

    #[test]
    fn test_incomplete_entries_dropped() {
        let text = r#"packages:
  no_ref:
    source: git
    url: https://x/no_ref
    revision: aaa111
  no_url:
    source: git
    ref: main
    revision: bbb222
  good:
    source: git
    url: https://x/good
    ref: v1
    revision: ccc333
  truncated:
    source: git
    url: https://x/t
    ref: main
"#;
        let names: Vec<String> = parse_lock(text).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["good"]);
    }

    #[test]
    fn test_top_level_line_closes_block() {
        let text = "packages:\n  pkg_a:\n    source: git\n    url: https://x/a\n    ref: main\nsdks:\n    revision: abc123\n";
        assert!(parse_lock(text).is_empty());
    }

    #[test]
    fn test_non_git_source_drops_block() {
        let text = "packages:\n  pkg_a:\n    url: https://x/a\n    ref: main\n    revision: abc\n    source: hosted\n";
        assert!(parse_lock(text).is_empty());
    }

    #[test]
    fn test_duplicate_name_replaces_earlier_entry() {
        let text = r#"packages:
  dup:
    source: git
    url: https://x/old
    ref: main
    revision: 111
  other:
    source: git
    url: https://x/other
    ref: main
    revision: 222
  dup:
    source: git
    url: https://x/new
    ref: main
    revision: 333
"#;
        let deps = parse_lock(text);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].name, "dup");
        assert_eq!(deps[0].url, "https://x/new");
        assert_eq!(deps[0].resolved_revision, "333");
        assert_eq!(deps[1].name, "other");
    }

    #[test]
    fn test_quotes_comments_and_crlf() {
        let text = "packages:\r\n  'pkg_q':\r\n    source: \"git\"\r\n    url: 'https://x/q' # mirror\r\n    ref: \"release/1.x\"\r\n    revision: \"fff000\"\r\n";
        let deps = parse_lock(text);
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].name, "pkg_q");
        assert_eq!(deps[0].url, "https://x/q");
        assert_eq!(deps[0].git_ref, "release/1.x");
    }

    #[test]
    fn test_url_with_port_keeps_everything_after_first_colon() {
        let text = "packages:\n  p:\n    source: git\n    url: ssh://git@host:2222/p.git\n    ref: main\n    revision: abc\n";
        assert_eq!(parse_lock(text)[0].url, "ssh://git@host:2222/p.git");
    }

    #[test]
    fn test_state_transitions() {
        let mut parser = LockParser::new();
        assert_eq!(parser.state(), ParseState::TopLevel);
        parser.feed("packages:");
        assert_eq!(parser.state(), ParseState::TopLevel);
        parser.feed("  pkg_a:");
        assert_eq!(parser.state(), ParseState::InDependencyBlock);
        parser.feed("    source: git");
        assert_eq!(parser.state(), ParseState::InGitSource);
        parser.feed("    url: https://x/a");
        parser.feed("    ref: main");
        assert_eq!(parser.state(), ParseState::InGitSource);
        parser.feed("    revision: abc123");
        assert_eq!(parser.state(), ParseState::TopLevel);
        assert_eq!(parser.finish().len(), 1);
    }

    #[test]
    fn test_lookup_by_name_is_lossless() {
        let deps = parse_lock(PUB_LOCK);
        let found = deps.iter().find(|d| d.name == "pkg_b").unwrap();
        assert_eq!(found, &deps[0]);
    }
}
