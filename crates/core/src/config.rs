//! TOML-based configuration for depsync.
//!
//! Configuration is looked up in this order: an explicit path, a
//! `depsync.toml` next to the project manifest, the per-user config file
//! under [`dirs::config_dir`], and finally built-in defaults. Tool paths can
//! additionally be overridden through environment variables, see
//! [`DepsyncConfig::apply_env_overrides`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

/// File name looked up in the project root.
pub const PROJECT_CONFIG_FILE: &str = "depsync.toml";

/// Environment variable overriding [`ToolConfig::program`].
pub const ENV_BUILD_TOOL: &str = "DEPSYNC_BUILD_TOOL";

/// Environment variable overriding [`ToolConfig::git`].
pub const ENV_GIT: &str = "DEPSYNC_GIT";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepsyncConfig {
    /// External programs and their time budget.
    #[serde(default)]
    pub tool: ToolConfig,

    /// Manifest and lock file names.
    #[serde(default)]
    pub files: FilesConfig,

    /// Remote ref lookups.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Staleness heuristics.
    #[serde(default)]
    pub staleness: StalenessConfig,

    /// Sync engine behaviour.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Package discovery inside a cloned source repository.
    #[serde(default)]
    pub source: SourceConfig,
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// External program settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Build tool binary, `flutter` or `dart`.
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments placed before every build tool subcommand.
    #[serde(default = "default_subcommand")]
    pub subcommand: Vec<String>,

    /// Git binary used for `ls-remote`.
    #[serde(default = "default_git")]
    pub git: String,

    /// Upper bound for a single build tool invocation.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_program() -> String {
    "flutter".into()
}
fn default_subcommand() -> Vec<String> {
    vec!["pub".into()]
}
fn default_git() -> String {
    "git".into()
}
fn default_command_timeout() -> u64 {
    600
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            subcommand: default_subcommand(),
            git: default_git(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl ToolConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

/// Names of the files the engine reads and mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default = "default_manifest")]
    pub manifest: String,

    #[serde(default = "default_lock")]
    pub lock: String,
}

fn default_manifest() -> String {
    "pubspec.yaml".into()
}
fn default_lock() -> String {
    "pubspec.lock".into()
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            lock: default_lock(),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

/// Which implementation answers remote ref queries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    /// Shell out to `git ls-remote`.
    #[default]
    Cli,
    /// List refs in-process through libgit2.
    Libgit2,
}

/// Remote ref lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub backend: RemoteBackend,

    /// Upper bound for a single remote listing.
    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,
}

fn default_remote_timeout() -> u64 {
    30
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::default(),
            timeout_secs: default_remote_timeout(),
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Staleness
// ---------------------------------------------------------------------------

/// Staleness fallback settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessConfig {
    /// A lock file older than this is flagged "possibly stale" (default 24).
    #[serde(default = "default_max_lock_age")]
    pub max_lock_age_hours: u64,
}

fn default_max_lock_age() -> u64 {
    24
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            max_lock_age_hours: default_max_lock_age(),
        }
    }
}

impl StalenessConfig {
    pub fn max_lock_age(&self) -> Duration {
        Duration::from_secs(self.max_lock_age_hours.saturating_mul(3600))
    }
}

// ---------------------------------------------------------------------------
// Sync behaviour
// ---------------------------------------------------------------------------

/// When the engine runs the final `pub get`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalizePolicy {
    /// Only after at least one package was installed.
    #[default]
    OnSuccess,
    /// Always, even when every install failed.
    Always,
}

/// Sync engine behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Retry conflicting installs with an override directive without asking.
    #[serde(default)]
    pub auto_resolve: bool,

    #[serde(default)]
    pub finalize: FinalizePolicy,
}

// ---------------------------------------------------------------------------
// Source discovery
// ---------------------------------------------------------------------------

/// Package discovery inside a cloned source repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Glob patterns (relative to the clone root) a package directory must
    /// match. Empty means every directory holding a manifest.
    #[serde(default)]
    pub include: Vec<String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl DepsyncConfig {
    /// Load a [`DepsyncConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: DepsyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Find and load the configuration that applies to `project_root`.
    ///
    /// An explicit path must exist. Otherwise the project file wins over the
    /// per-user file, and defaults are used when neither exists.
    pub fn discover(explicit: Option<&Path>, project_root: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        let project_file = project_root.join(PROJECT_CONFIG_FILE);
        if project_file.is_file() {
            return Self::load_from_file(project_file);
        }

        if let Some(user_file) = user_config_path().filter(|p| p.is_file()) {
            return Self::load_from_file(user_file);
        }

        debug!("no configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Apply `DEPSYNC_BUILD_TOOL` / `DEPSYNC_GIT` when they are set.
    pub fn apply_env_overrides(&mut self) {
        if let Some(program) = resolve_optional_env(ENV_BUILD_TOOL, "tool.program") {
            self.tool.program = program;
        }
        if let Some(git) = resolve_optional_env(ENV_GIT, "tool.git") {
            self.tool.git = git;
        }
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tool.program.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "tool.program".into(),
                detail: "build tool must not be empty".into(),
            });
        }
        if self.tool.git.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "tool.git".into(),
                detail: "git binary must not be empty".into(),
            });
        }
        if self.tool.command_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tool.command_timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if self.remote.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "remote.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        for (field, name) in [
            ("files.manifest", &self.files.manifest),
            ("files.lock", &self.files.lock),
        ] {
            if name.is_empty() || name.contains('/') || name.contains('\\') {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    detail: format!("'{}' must be a plain file name", name),
                });
            }
        }

        Ok(())
    }

    /// Convenience: discover, apply overrides, and validate in one call.
    pub fn load_and_resolve(explicit: Option<&Path>, project_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::discover(explicit, project_root)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Render the defaults as a commented TOML document for `depsync init`.
    pub fn default_toml() -> String {
        r#"# depsync configuration

[tool]
program = "flutter"        # or "dart"
subcommand = ["pub"]
git = "git"
command_timeout_secs = 600

[files]
manifest = "pubspec.yaml"
lock = "pubspec.lock"

[remote]
backend = "cli"            # or "libgit2"
timeout_secs = 30

[staleness]
max_lock_age_hours = 24

[sync]
auto_resolve = false
finalize = "on_success"    # or "always"

[source]
include = []               # e.g. ["packages/*"]
"#
        .to_string()
    }
}

/// `~/.config/depsync/config.toml` (platform equivalent).
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("depsync").join("config.toml"))
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs and returns `None` if the variable is unset or empty.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.trim().is_empty() => {
            debug!(field, env_name, "resolved env override");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env override is set but empty");
            None
        }
        Err(_) => None,
    }
}
