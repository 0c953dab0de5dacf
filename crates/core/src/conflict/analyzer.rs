//! Classification of build tool failures.
//!
//! The analyzer runs an ordered list of [`ConflictMatcher`]s over the
//! combined output of a failed command. The first matcher that recognizes a
//! dependency conflict wins; otherwise the failure is bucketed into a coarse
//! [`FailureKind`].

use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ActionResult, KEY_CONFLICTING_PKG, KEY_CONFLICT_TYPE, KEY_FAILURE_KIND, KEY_NEEDS_RESOLUTION};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Categorisation of a dependency conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The solver found no set of versions satisfying every constraint.
    VersionSolving,
    /// A package requires an SDK version the toolchain does not provide.
    SdkConstraint,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VersionSolving => "version_solving",
            Self::SdkConstraint => "sdk_constraint",
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse category of a failure that is not a conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Network,
    Auth,
    Syntax,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Syntax => "syntax",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recognized conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    pub conflict_type: ConflictType,
    /// Package the tool blamed, when one could be extracted.
    pub conflicting_package: Option<String>,
    pub suggested_fix: String,
    pub user_message: String,
}

// ---------------------------------------------------------------------------
// Matchers
// ---------------------------------------------------------------------------

/// Recognizes conflict signatures in one tool's output.
///
/// Output wording changes between tool releases, so each matcher carries a
/// version that is logged with every match.
pub trait ConflictMatcher: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u32;

    /// `root_name` is the project's own package name, which must never be
    /// reported as the conflicting package.
    fn analyze(&self, output: &str, root_name: Option<&str>) -> Option<ConflictAnalysis>;
}

/// Matcher for `pub` solver output.
#[derive(Debug, Clone, Copy, Default)]
pub struct PubConflictMatcher;

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, text: &str) -> bool {
    cached(cell, pattern).map(|re| re.is_match(text)).unwrap_or(false)
}

static VERSION_SOLVING: OnceLock<Option<Regex>> = OnceLock::new();
const VERSION_SOLVING_PATTERN: &str = r"(?i)version solving failed";

static SDK: OnceLock<Option<Regex>> = OnceLock::new();
const SDK_PATTERN: &str =
    r"(?i)(current (dart|flutter) sdk version is|requires sdk version|sdk version .* is (incompatible|not supported))";

/// `because pkg_b requires ...`, `and pkg_c >=1.0.0 depends on ...`,
/// `because every version of pkg_a from git depends on ...`
static BLAMED: OnceLock<Option<Regex>> = OnceLock::new();
const BLAMED_PATTERN: &str = r"(?i)\b(?:because|and)\s+(?:every version of\s+|no versions of\s+)?([a-z_][a-z0-9_]*)\b[^,\n]*?\b(?:requires|depends on)\b";

/// 401/403 only when reported as an HTTP status, never inside revisions or versions.
static HTTP_AUTH: OnceLock<Option<Regex>> = OnceLock::new();
const HTTP_AUTH_PATTERN: &str =
    r"(?i)\b(?:http|status|error|returned|code)\b[^\n]{0,20}?\b40[13]\b|\b40[13]\s+(?:unauthorized|forbidden)\b";

/// `app depends on pkg_a from git which requires SDK version ...`
static WHICH: OnceLock<Option<Regex>> = OnceLock::new();
const WHICH_PATTERN: &str = r"(?i)\bdepends on\s+([a-z_][a-z0-9_]*)\b[^,\n]*?\bwhich\s+(?:requires|depends on)\b";

fn captured<'a>(cell: &'static OnceLock<Option<Regex>>, pattern: &str, text: &'a str) -> Vec<&'a str> {
    match cached(cell, pattern) {
        Some(re) => re
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect(),
        None => Vec::new(),
    }
}

impl PubConflictMatcher {
    fn blamed_package(output: &str, root_name: Option<&str>) -> Option<String> {
        let not_root = |name: &str| root_name.map(|root| !root.eq_ignore_ascii_case(name)).unwrap_or(true);
        captured(&BLAMED, BLAMED_PATTERN, output)
            .into_iter()
            .find(|name| not_root(name))
            .or_else(|| {
                captured(&WHICH, WHICH_PATTERN, output)
                    .into_iter()
                    .find(|name| not_root(name))
            })
            .map(str::to_string)
    }
}

impl ConflictMatcher for PubConflictMatcher {
    fn name(&self) -> &str {
        "pub"
    }

    fn version(&self) -> u32 {
        1
    }

    fn analyze(&self, output: &str, root_name: Option<&str>) -> Option<ConflictAnalysis> {
        let conflict_type = if matches(&SDK, SDK_PATTERN, output) {
            ConflictType::SdkConstraint
        } else if matches(&VERSION_SOLVING, VERSION_SOLVING_PATTERN, output) {
            ConflictType::VersionSolving
        } else {
            return None;
        };

        let conflicting_package = Self::blamed_package(output, root_name);
        let (suggested_fix, user_message) = match (conflict_type, conflicting_package.as_deref()) {
            (ConflictType::VersionSolving, Some(pkg)) => (
                format!("retry with a dependency override so the requested version wins over '{}'", pkg),
                format!("version solving failed: '{}' has incompatible constraints", pkg),
            ),
            (ConflictType::VersionSolving, None) => (
                "retry with a dependency override".to_string(),
                "version solving failed".to_string(),
            ),
            (ConflictType::SdkConstraint, Some(pkg)) => (
                format!("upgrade the SDK or override '{}' with a compatible version", pkg),
                format!("'{}' requires a different SDK version", pkg),
            ),
            (ConflictType::SdkConstraint, None) => (
                "upgrade the SDK or override the offending package".to_string(),
                "SDK version constraint not satisfied".to_string(),
            ),
        };

        Some(ConflictAnalysis {
            conflict_type,
            conflicting_package,
            suggested_fix,
            user_message,
        })
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

/// Ordered set of matchers plus the fallback failure classifier.
pub struct ConflictAnalyzer {
    matchers: Vec<Box<dyn ConflictMatcher>>,
}

impl Default for ConflictAnalyzer {
    fn default() -> Self {
        Self {
            matchers: vec![Box::new(PubConflictMatcher)],
        }
    }
}

impl ConflictAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// An analyzer with no matchers; every failure is unclassified.
    pub fn empty() -> Self {
        Self { matchers: Vec::new() }
    }

    /// Append a matcher; earlier matchers take precedence.
    pub fn with_matcher(mut self, matcher: Box<dyn ConflictMatcher>) -> Self {
        self.matchers.push(matcher);
        self
    }

    pub fn analyze(&self, output: &str, root_name: Option<&str>) -> Option<ConflictAnalysis> {
        self.matchers.iter().find_map(|m| {
            let found = m.analyze(output, root_name);
            if let Some(a) = &found {
                debug!(
                    matcher = m.name(),
                    matcher_version = m.version(),
                    conflict_type = %a.conflict_type,
                    package = ?a.conflicting_package,
                    "conflict signature matched"
                );
            }
            found
        })
    }

    /// Bucket a non-conflict failure.
    pub fn classify_failure(&self, output: &str) -> FailureKind {
        let lower = output.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if matches(&HTTP_AUTH, HTTP_AUTH_PATTERN, output)
            || has(&[
                "authentication failed",
                "permission denied",
                "could not read username",
                "terminal prompts disabled",
                "access denied",
            ])
        {
            FailureKind::Auth
        } else if has(&[
            "could not resolve host",
            "failed host lookup",
            "connection refused",
            "connection timed out",
            "network is unreachable",
            "socketexception",
            "unable to access",
            "timed out",
        ]) {
            FailureKind::Network
        } else if has(&[
            "error on line",
            "yamlexception",
            "could not parse",
            "error parsing",
            "invalid descriptor",
            "expected a",
            "is not a valid",
            "unexpected",
        ]) {
            FailureKind::Syntax
        } else {
            FailureKind::Other
        }
    }

    /// Record the analysis of a failed command's output on `result`.
    ///
    /// A conflict sets `needs_resolution`, `conflict_type` and (when known)
    /// `conflicting_pkg`; anything else sets `failure_kind`.
    pub fn annotate(&self, result: &mut ActionResult, output: &str, root_name: Option<&str>) -> Option<ConflictAnalysis> {
        match self.analyze(output, root_name) {
            Some(analysis) => {
                result.set_data(KEY_NEEDS_RESOLUTION, true);
                result.set_data(KEY_CONFLICT_TYPE, analysis.conflict_type.as_str());
                if let Some(pkg) = &analysis.conflicting_package {
                    result.set_data(KEY_CONFLICTING_PKG, pkg.as_str());
                }
                Some(analysis)
            }
            None => {
                result.set_data(KEY_NEEDS_RESOLUTION, false);
                result.set_data(KEY_FAILURE_KIND, self.classify_failure(output).as_str());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOLVER_OUTPUT: &str = "Resolving dependencies...\n\
        Because pkg_b >=1.0.0 depends on pkg_c ^2.0.0 and app depends on pkg_c ^1.0.0, pkg_b >=1.0.0 is forbidden.\n\
        So, because app depends on pkg_b from git, version solving failed.";

    #[test]
    fn test_version_solving_with_blamed_package() {
        let a = ConflictAnalyzer::new()
            .analyze("version solving failed because pkg_b requires pkg_c ^2.0.0", None)
            .unwrap();
        assert_eq!(a.conflict_type, ConflictType::VersionSolving);
        assert_eq!(a.conflicting_package.as_deref(), Some("pkg_b"));
        assert!(a.user_message.contains("pkg_b"));
    }

    #[test]
    fn test_real_solver_output_skips_root() {
        let a = ConflictAnalyzer::new().analyze(SOLVER_OUTPUT, Some("app")).unwrap();
        assert_eq!(a.conflict_type, ConflictType::VersionSolving);
        assert_eq!(a.conflicting_package.as_deref(), Some("pkg_b"));
    }

    #[test]
    fn test_root_only_leaves_package_unknown() {
        let out = "Because app depends on pkg_x any which doesn't exist, version solving failed.";
        let a = ConflictAnalyzer::new().analyze(out, Some("app")).unwrap();
        assert_eq!(a.conflicting_package, None);
    }

    #[test]
    fn test_sdk_constraint() {
        let out = "The current Dart SDK version is 2.19.0.\n\n\
            Because app depends on pkg_a from git which requires SDK version >=3.0.0 <4.0.0, version solving failed.";
        let a = ConflictAnalyzer::new().analyze(out, Some("app")).unwrap();
        assert_eq!(a.conflict_type, ConflictType::SdkConstraint);
        assert_eq!(a.conflicting_package.as_deref(), Some("pkg_a"));
    }

    #[test]
    fn test_non_conflict_failures() {
        let analyzer = ConflictAnalyzer::new();
        assert!(analyzer.analyze("Could not resolve host: github.com", None).is_none());
        assert_eq!(
            analyzer.classify_failure("fatal: unable to access 'https://x/': Could not resolve host: x"),
            FailureKind::Network
        );
        assert_eq!(
            analyzer.classify_failure("remote: Permission denied to user.\nfatal: Authentication failed"),
            FailureKind::Auth
        );
        assert_eq!(
            analyzer.classify_failure("Error on line 4, column 3 of pubspec.yaml: Expected a key"),
            FailureKind::Syntax
        );
        assert_eq!(analyzer.classify_failure("something odd happened"), FailureKind::Other);
    }

    #[test]
    fn test_http_status_auth_needs_http_context() {
        let analyzer = ConflictAnalyzer::new();
        assert_eq!(
            analyzer.classify_failure("fatal: unable to access 'https://x/a.git/': The requested URL returned error: 403"),
            FailureKind::Auth
        );
        assert_eq!(analyzer.classify_failure("HTTP 401 Unauthorized"), FailureKind::Auth);
        assert_eq!(analyzer.classify_failure("could not find ref 4030ab1"), FailureKind::Other);
        assert_eq!(analyzer.classify_failure("pkg_a 1.403.0 is missing\nref 401cafe"), FailureKind::Other);
    }

    #[test]
    fn test_annotate_sets_structured_data() {
        let analyzer = ConflictAnalyzer::new();
        let mut conflict = ActionResult::failure("install failed", "exit 1");
        analyzer.annotate(&mut conflict, "version solving failed because pkg_b requires x", None);
        assert!(conflict.needs_resolution());
        assert_eq!(conflict.conflict_type(), Some("version_solving"));
        assert_eq!(conflict.conflicting_package(), Some("pkg_b"));

        let mut plain = ActionResult::failure("install failed", "exit 1");
        analyzer.annotate(&mut plain, "connection refused", None);
        assert!(!plain.needs_resolution());
        assert_eq!(plain.structured_data[KEY_FAILURE_KIND], "network");
    }

    struct AlwaysConflict;

    impl ConflictMatcher for AlwaysConflict {
        fn name(&self) -> &str {
            "always"
        }
        fn version(&self) -> u32 {
            7
        }
        fn analyze(&self, _output: &str, _root: Option<&str>) -> Option<ConflictAnalysis> {
            Some(ConflictAnalysis {
                conflict_type: ConflictType::VersionSolving,
                conflicting_package: Some("custom".into()),
                suggested_fix: String::new(),
                user_message: String::new(),
            })
        }
    }

    #[test]
    fn test_matchers_are_pluggable_and_ordered() {
        assert!(ConflictAnalyzer::empty().analyze(SOLVER_OUTPUT, None).is_none());

        let analyzer = ConflictAnalyzer::new().with_matcher(Box::new(AlwaysConflict));
        let a = analyzer.analyze(SOLVER_OUTPUT, Some("app")).unwrap();
        assert_eq!(a.conflicting_package.as_deref(), Some("pkg_b"));
        let a = analyzer.analyze("anything", None).unwrap();
        assert_eq!(a.conflicting_package.as_deref(), Some("custom"));
    }
}
