//! Build tool invocation.
//!
//! Git dependencies are added with `pub add` using the JSON descriptor form:
//!
//! ```text
//! flutter pub add 'pkg_a:{"git":{"url":"https://x/a.git","ref":"main","path":"packages/a"}}'
//! flutter pub add 'override:pkg_a:{"git":{...}}'
//! ```
//!
//! A non-zero exit is reported as a failed [`ActionResult`] whose output has
//! been run through the [`ConflictAnalyzer`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{info, instrument, warn};

use crate::conflict::ConflictAnalyzer;
use crate::errors::{InstallError, ProcessError};
use crate::models::{ActionResult, PackageSpec, KEY_FAILURE_KIND, KEY_PACKAGE};
use crate::process::{CancelToken, CommandRunner, Invocation};
use crate::project::Project;

/// Runs `pub add`, `pub get` and `pub upgrade` for a project.
pub struct DependencyInstaller {
    runner: Arc<dyn CommandRunner>,
    analyzer: Arc<ConflictAnalyzer>,
    program: String,
    subcommand: Vec<String>,
    timeout: Duration,
}

impl DependencyInstaller {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        analyzer: Arc<ConflictAnalyzer>,
        program: impl Into<String>,
        subcommand: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            analyzer,
            program: program.into(),
            subcommand,
            timeout,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Confirm the build tool can be started at all.
    pub async fn check_tool(&self, cancel: &CancelToken) -> Result<(), InstallError> {
        let invocation = Invocation::new(&self.program, ["--version"]).with_timeout(self.timeout);
        let output = self.runner.run(&invocation, cancel).await?;
        if !output.success() {
            warn!(program = %self.program, code = ?output.code, "build tool --version exited unsuccessfully");
        }
        Ok(())
    }

    /// Add `spec` as a regular git dependency.
    #[instrument(skip(self, project, spec, cancel), fields(package = %spec.name))]
    pub async fn install(&self, project: &Project, spec: &PackageSpec, cancel: &CancelToken) -> Result<ActionResult, InstallError> {
        let arg = format!("{}:{}", spec.name, git_descriptor(spec)?);
        self.add(project, spec, arg, false, cancel).await
    }

    /// Add `spec` through an override directive, which wins over every other
    /// constraint on the package.
    #[instrument(skip(self, project, spec, cancel), fields(package = %spec.name))]
    pub async fn install_override(
        &self,
        project: &Project,
        spec: &PackageSpec,
        cancel: &CancelToken,
    ) -> Result<ActionResult, InstallError> {
        let arg = format!("override:{}:{}", spec.name, git_descriptor(spec)?);
        self.add(project, spec, arg, true, cancel).await
    }

    async fn add(
        &self,
        project: &Project,
        spec: &PackageSpec,
        arg: String,
        is_override: bool,
        cancel: &CancelToken,
    ) -> Result<ActionResult, InstallError> {
        let verb = if is_override { "override" } else { "add" };
        let result = self.run_tool(project, vec!["add".to_string(), arg], cancel).await?;
        let result = match result {
            Ok(logs) => {
                info!(package = %spec.name, verb, "dependency installed");
                ActionResult::success(format!("installed {}", spec.name)).with_logs(logs)
            }
            Err((mut failed, output)) => {
                failed.message = format!("failed to install {}", spec.name);
                if let Some(analysis) = self.analyzer.annotate(&mut failed, &output, project.name.as_deref()) {
                    warn!(package = %spec.name, conflict_type = %analysis.conflict_type, "install hit a dependency conflict");
                } else {
                    warn!(package = %spec.name, verb, "install failed");
                }
                failed
            }
        };
        Ok(result.with_data(KEY_PACKAGE, spec.name.as_str()))
    }

    /// `pub get`.
    #[instrument(skip(self, project, cancel))]
    pub async fn get(&self, project: &Project, cancel: &CancelToken) -> Result<ActionResult, InstallError> {
        match self.run_tool(project, vec!["get".to_string()], cancel).await? {
            Ok(logs) => Ok(ActionResult::success("dependencies fetched").with_logs(logs)),
            Err((mut failed, output)) => {
                failed.message = "failed to fetch dependencies".to_string();
                self.analyzer.annotate(&mut failed, &output, project.name.as_deref());
                Ok(failed)
            }
        }
    }

    /// `pub upgrade <names>`; an empty list upgrades everything.
    #[instrument(skip(self, project, cancel))]
    pub async fn upgrade(&self, project: &Project, names: &[String], cancel: &CancelToken) -> Result<ActionResult, InstallError> {
        let mut args = vec!["upgrade".to_string()];
        args.extend(names.iter().cloned());
        let label = if names.is_empty() {
            "all dependencies".to_string()
        } else {
            names.join(", ")
        };
        match self.run_tool(project, args, cancel).await? {
            Ok(logs) => Ok(ActionResult::success(format!("upgraded {}", label))
                .with_logs(logs)
                .with_data("upgraded", names.to_vec())),
            Err((mut failed, output)) => {
                failed.message = format!("failed to upgrade {}", label);
                self.analyzer.annotate(&mut failed, &output, project.name.as_deref());
                Ok(failed)
            }
        }
    }

    /// Run `<program> <subcommand..> <args..>` in the project root.
    ///
    /// The outer error is fatal (tool missing, cancelled, I/O). The inner
    /// result separates success logs from a failed result plus the raw
    /// output to analyze. A timeout counts as a per-command failure.
    async fn run_tool(
        &self,
        project: &Project,
        args: Vec<String>,
        cancel: &CancelToken,
    ) -> Result<Result<Vec<String>, (ActionResult, String)>, InstallError> {
        let mut full = self.subcommand.clone();
        full.extend(args);
        let invocation = Invocation::new(&self.program, full)
            .in_dir(&project.root)
            .with_timeout(self.timeout);
        info!(cmd = %invocation.display(), "running build tool");

        match self.runner.run(&invocation, cancel).await {
            Ok(output) if output.success() => Ok(Ok(output.log_lines())),
            Ok(output) => {
                let combined = output.combined();
                let error_text = match output.code {
                    Some(code) => format!("{} exited with code {}", self.program, code),
                    None => format!("{} was terminated by a signal", self.program),
                };
                let failed = ActionResult::failure(String::new(), error_text).with_logs(output.log_lines());
                Ok(Err((failed, combined)))
            }
            Err(e @ ProcessError::TimedOut { .. }) => {
                let failed = ActionResult::failure(String::new(), e.to_string()).with_data(KEY_FAILURE_KIND, "other");
                Ok(Err((failed, String::new())))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The JSON git descriptor for `spec`, omitting absent fields.
pub fn git_descriptor(spec: &PackageSpec) -> Result<String, InstallError> {
    let invalid = |detail: &str| InstallError::InvalidSpec {
        name: spec.name.clone(),
        detail: detail.to_string(),
    };
    if spec.name.is_empty() {
        return Err(invalid("package name is empty"));
    }
    if !spec
        .name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(invalid("package names may only contain letters, digits and underscores"));
    }
    if spec.url.trim().is_empty() {
        return Err(invalid("git url is empty"));
    }

    let mut git = Map::new();
    git.insert("url".into(), Value::String(spec.url.clone()));
    if let Some(r) = spec.git_ref.as_deref().filter(|r| !r.is_empty()) {
        git.insert("ref".into(), Value::String(r.to_string()));
    }
    if let Some(p) = spec.subdirectory.as_deref().filter(|p| !p.is_empty()) {
        git.insert("path".into(), Value::String(p.to_string()));
    }
    Ok(json!({ "git": git }).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays canned outputs and records invocations.
    struct Scripted {
        outputs: Mutex<Vec<Result<CommandOutput, ProcessError>>>,
        seen: Mutex<Vec<Invocation>>,
    }

    impl Scripted {
        fn new(outputs: Vec<Result<CommandOutput, ProcessError>>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CommandRunner for Scripted {
        async fn run(&self, invocation: &Invocation, _cancel: &CancelToken) -> Result<CommandOutput, ProcessError> {
            self.seen.lock().unwrap().push(invocation.clone());
            self.outputs.lock().unwrap().pop().unwrap_or_else(|| Ok(ok("")))
        }
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn fail(stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    fn installer(runner: Arc<Scripted>) -> DependencyInstaller {
        DependencyInstaller::new(
            runner,
            Arc::new(ConflictAnalyzer::new()),
            "flutter",
            vec!["pub".into()],
            Duration::from_secs(60),
        )
    }

    fn project() -> (tempfile::TempDir, Project) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pubspec.yaml"), "name: app\n").unwrap();
        let project = Project::at(dir.path(), &Default::default());
        (dir, project)
    }

    #[test]
    fn test_descriptor_omits_absent_fields() {
        let spec = PackageSpec::new("pkg_a", "https://x/a.git");
        assert_eq!(git_descriptor(&spec).unwrap(), r#"{"git":{"url":"https://x/a.git"}}"#);

        let spec = spec.with_ref("main").with_subdirectory("packages/a");
        let value: Value = serde_json::from_str(&git_descriptor(&spec).unwrap()).unwrap();
        assert_eq!(value["git"]["ref"], "main");
        assert_eq!(value["git"]["path"], "packages/a");
    }

    #[test]
    fn test_descriptor_rejects_bad_names() {
        assert!(git_descriptor(&PackageSpec::new("", "u")).is_err());
        assert!(git_descriptor(&PackageSpec::new("a:b", "u")).is_err());
        assert!(git_descriptor(&PackageSpec::new("a", " ")).is_err());
    }

    #[tokio::test]
    async fn test_install_success_builds_command() {
        let runner = Scripted::new(vec![Ok(ok("Resolving dependencies...\n+ pkg_a 1.0.0\n"))]);
        let (_dir, project) = project();
        let result = installer(runner.clone())
            .install(&project, &PackageSpec::new("pkg_a", "https://x/a.git").with_ref("main"), &CancelToken::new())
            .await
            .unwrap();

        assert!(result.ok);
        assert_eq!(result.logs.len(), 2);
        assert_eq!(result.package(), Some("pkg_a"));

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].program, "flutter");
        assert_eq!(seen[0].args[..2], ["pub".to_string(), "add".to_string()]);
        let descriptor = seen[0].args[2].strip_prefix("pkg_a:").unwrap();
        let value: Value = serde_json::from_str(descriptor).unwrap();
        assert_eq!(value, json!({"git": {"url": "https://x/a.git", "ref": "main"}}));
        assert_eq!(seen[0].cwd.as_deref(), Some(project.root.as_path()));
    }

    #[tokio::test]
    async fn test_install_conflict_is_annotated() {
        let runner = Scripted::new(vec![Ok(fail("version solving failed because pkg_b requires pkg_c ^2.0.0"))]);
        let (_dir, project) = project();
        let result = installer(runner)
            .install(&project, &PackageSpec::new("pkg_a", "https://x/a.git"), &CancelToken::new())
            .await
            .unwrap();

        assert!(!result.ok);
        assert!(result.needs_resolution());
        assert_eq!(result.conflict_type(), Some("version_solving"));
        assert_eq!(result.conflicting_package(), Some("pkg_b"));
        assert_eq!(result.error_text.as_deref(), Some("flutter exited with code 1"));
        assert!(!result.logs.is_empty());
    }

    #[tokio::test]
    async fn test_install_override_prefix() {
        let runner = Scripted::new(vec![Ok(ok(""))]);
        let (_dir, project) = project();
        installer(runner.clone())
            .install_override(&project, &PackageSpec::new("pkg_a", "https://x/a.git"), &CancelToken::new())
            .await
            .unwrap();
        let seen = runner.seen.lock().unwrap();
        assert!(seen[0].args[2].starts_with("override:pkg_a:{"));
    }

    #[tokio::test]
    async fn test_tool_missing_is_an_error() {
        let runner = Scripted::new(vec![Err(crate::process::tool_missing("flutter"))]);
        let (_dir, project) = project();
        let err = installer(runner)
            .install(&project, &PackageSpec::new("pkg_a", "https://x/a.git"), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(err.is_tool_missing());
    }

    #[tokio::test]
    async fn test_timeout_is_a_failed_result() {
        let runner = Scripted::new(vec![Err(ProcessError::TimedOut {
            program: "flutter".into(),
            secs: 60,
        })]);
        let (_dir, project) = project();
        let result = installer(runner)
            .install(&project, &PackageSpec::new("pkg_a", "https://x/a.git"), &CancelToken::new())
            .await
            .unwrap();
        assert!(!result.ok);
        assert!(!result.needs_resolution());
    }

    #[tokio::test]
    async fn test_get_and_upgrade_commands() {
        let runner = Scripted::new(vec![Ok(ok("")), Ok(fail("Could not resolve host: pub.dev"))]);
        let (_dir, project) = project();
        let inst = installer(runner.clone());
        assert!(inst.get(&project, &CancelToken::new()).await.unwrap().ok);
        let up = inst
            .upgrade(&project, &["pkg_a".to_string(), "pkg_b".to_string()], &CancelToken::new())
            .await
            .unwrap();
        assert!(!up.ok);
        assert_eq!(up.structured_data[KEY_FAILURE_KIND], "network");

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].args, vec!["pub", "get"]);
        assert_eq!(seen[1].args, vec!["pub", "upgrade", "pkg_a", "pkg_b"]);
    }
}
