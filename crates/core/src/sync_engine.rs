//! Step-driven dependency synchronization engine.
//!
//! The [`SyncEngine`] is a resumable state machine. Each call to
//! [`SyncEngine::step`] performs one unit of work and returns the event it
//! produced, so a caller can render between steps:
//!
//! 1. `SETUP`: verify the build tool and back up the manifest.
//! 2. `CLONE_SOURCE` (optional): clone a source repository and discover packages.
//! 3. `INSTALL[i]`: install one package; failures are recorded, not fatal.
//! 4. `RESOLVE_CONFLICTS`: driven by [`SyncEngine::resolve`] and
//!    [`SyncEngine::finish_resolution`], or automatic with `auto_resolve`.
//! 5. `FINALIZE`: `pub get`, subject to the configured [`FinalizePolicy`].
//!
//! Terminal phases are `DONE`, `FAILED` and `CANCELLED`. Manifest edits that
//! already succeeded are not rolled back on failure or cancellation; the
//! backup taken during `SETUP` is the recovery path.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backup::BackupManager;
use crate::config::FinalizePolicy;
use crate::conflict::{ConflictResolver, Resolution};
use crate::errors::{InstallError, SyncError};
use crate::git::{DiscoveredPackage, SourceCheckout};
use crate::installer::DependencyInstaller;
use crate::models::{ActionResult, BackupRecord, PackageSpec, KEY_PACKAGE, KEY_RESOLUTION};
use crate::process::CancelToken;
use crate::project::Project;

// ---------------------------------------------------------------------------
// Phases & events
// ---------------------------------------------------------------------------

/// Where the engine is in a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    CloneSource,
    /// Installing the package at this index.
    Install(usize),
    ResolveConflicts,
    Finalize,
    Done,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::CloneSource => write!(f, "clone_source"),
            Self::Install(i) => write!(f, "install[{}]", i),
            Self::ResolveConflicts => write!(f, "resolve_conflicts"),
            Self::Finalize => write!(f, "finalize"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A package whose install hit a conflict and awaits a [`Resolution`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub package: String,
    pub conflict_type: Option<String>,
    pub conflicting_package: Option<String>,
    /// Resolution attempts made so far.
    pub attempts: u32,
}

/// What a single [`SyncEngine::step`] did.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StepEvent {
    BackupCreated {
        record: BackupRecord,
    },
    SourceCloned {
        url: String,
        head: String,
        packages: Vec<DiscoveredPackage>,
    },
    Installed {
        index: usize,
        total: usize,
        result: ActionResult,
    },
    /// The engine is in `RESOLVE_CONFLICTS` and needs the caller to act.
    AwaitingResolution {
        pending: Vec<PendingConflict>,
    },
    ConflictResolved {
        package: String,
        resolution: Resolution,
        result: ActionResult,
    },
    Finalized {
        result: ActionResult,
    },
    FinalizeSkipped {
        reason: String,
    },
    Completed {
        summary: SyncSummary,
    },
}

// ---------------------------------------------------------------------------
// Plan & summary
// ---------------------------------------------------------------------------

/// A source repository to clone before installing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePlan {
    pub url: String,
    pub git_ref: Option<String>,
    /// Glob patterns a package directory must match; empty means all.
    pub include: Vec<String>,
}

/// What a run should install.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub specs: Vec<PackageSpec>,
    /// When set and `specs` is empty, one spec per discovered package is
    /// installed from the source repository.
    pub source: Option<SourcePlan>,
}

impl SyncPlan {
    pub fn new(specs: Vec<PackageSpec>) -> Self {
        Self { specs, source: None }
    }

    pub fn with_source(mut self, url: impl Into<String>, git_ref: Option<String>, include: Vec<String>) -> Self {
        self.source = Some(SourcePlan {
            url: url.into(),
            git_ref,
            include,
        });
        self
    }
}

/// Final outcome of one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageOutcome {
    pub name: String,
    pub ok: bool,
    pub message: String,
    pub error_text: Option<String>,
    pub resolution: Option<String>,
}

/// Report of a run, enumerating every attempted package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub run_id: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub backup: Option<BackupRecord>,
    pub packages: Vec<PackageOutcome>,
    /// Packages whose conflict was skipped or never resolved.
    pub unresolved: Vec<String>,
    /// `Some(ok)` when `pub get` ran.
    pub finalized: Option<bool>,
}

impl SyncSummary {
    pub fn succeeded(&self) -> usize {
        self.packages.iter().filter(|p| p.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.packages.len() - self.succeeded()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The step-driven sync engine.
pub struct SyncEngine {
    project: Project,
    plan: SyncPlan,
    installer: Arc<DependencyInstaller>,
    backups: BackupManager,
    cancel: CancelToken,
    auto_resolve: bool,
    finalize: FinalizePolicy,
    manifest_name: String,

    phase: Phase,
    specs: Vec<PackageSpec>,
    /// One install result per attempted package, append-only.
    results: Vec<ActionResult>,
    /// Every resolution attempt, in order.
    resolutions: Vec<ActionResult>,
    pending: Vec<PendingConflict>,
    auto_attempted: HashSet<String>,
    unresolved: Vec<String>,
    backup: Option<BackupRecord>,
    finalized: Option<bool>,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

impl SyncEngine {
    pub fn new(project: Project, plan: SyncPlan, installer: Arc<DependencyInstaller>, cancel: CancelToken) -> Self {
        let manifest_name = project
            .manifest_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "pubspec.yaml".to_string());
        let specs = plan.specs.clone();
        let run_id = Uuid::new_v4();
        info!(%run_id, root = %project.root.display(), packages = specs.len(), "initializing sync engine");
        Self {
            project,
            plan,
            installer,
            backups: BackupManager::new(),
            cancel,
            auto_resolve: false,
            finalize: FinalizePolicy::default(),
            manifest_name,
            phase: Phase::Setup,
            specs,
            results: Vec::new(),
            resolutions: Vec::new(),
            pending: Vec::new(),
            auto_attempted: HashSet::new(),
            unresolved: Vec::new(),
            backup: None,
            finalized: None,
            run_id,
            started_at: Utc::now(),
        }
    }

    /// Apply one override retry per conflict without waiting for the caller.
    pub fn with_auto_resolve(mut self, auto_resolve: bool) -> Self {
        self.auto_resolve = auto_resolve;
        self
    }

    pub fn with_finalize(mut self, finalize: FinalizePolicy) -> Self {
        self.finalize = finalize;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn specs(&self) -> &[PackageSpec] {
        &self.specs
    }

    /// Install results in attempt order. Resolutions never replace these;
    /// see [`SyncEngine::final_result`] for a package's current outcome.
    pub fn results(&self) -> &[ActionResult] {
        &self.results
    }

    /// The latest non-skip resolution attempt for `package`, falling back
    /// to its install result.
    pub fn final_result(&self, package: &str) -> Option<&ActionResult> {
        self.resolutions
            .iter()
            .rev()
            .find(|r| r.package() == Some(package) && !is_skip(r))
            .or_else(|| self.results.iter().find(|r| r.package() == Some(package)))
    }

    pub fn resolution_attempts(&self) -> &[ActionResult] {
        &self.resolutions
    }

    pub fn pending_conflicts(&self) -> &[PendingConflict] {
        &self.pending
    }

    pub fn backup(&self) -> Option<&BackupRecord> {
        self.backup.as_ref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Perform the next unit of work.
    ///
    /// In `DONE` this keeps returning [`StepEvent::Completed`]. In `FAILED`
    /// or `CANCELLED` it returns [`SyncError::InvalidStateTransition`].
    pub async fn step(&mut self) -> Result<StepEvent, SyncError> {
        match self.phase {
            Phase::Done => {
                return Ok(StepEvent::Completed {
                    summary: self.summary(),
                })
            }
            Phase::Failed | Phase::Cancelled => return Err(self.invalid("step")),
            _ => {}
        }
        if self.cancel.is_cancelled() {
            return Err(self.fail(SyncError::Cancelled));
        }

        debug!(phase = %self.phase, "sync step");
        let outcome = match self.phase {
            Phase::Setup => self.do_setup().await,
            Phase::CloneSource => self.do_clone_source().await,
            Phase::Install(i) => self.do_install(i).await,
            Phase::ResolveConflicts => self.do_resolve_step().await,
            Phase::Finalize => self.do_finalize().await,
            Phase::Done | Phase::Failed | Phase::Cancelled => return Err(self.invalid("step")),
        };
        outcome.map_err(|e| self.fail(e))
    }

    async fn do_setup(&mut self) -> Result<StepEvent, SyncError> {
        self.installer.check_tool(&self.cancel).await?;
        let record = self.backups.create(&self.project)?;
        self.backup = Some(record.clone());

        self.phase = if self.plan.source.is_some() {
            Phase::CloneSource
        } else {
            self.first_install_phase()
        };
        Ok(StepEvent::BackupCreated { record })
    }

    async fn do_clone_source(&mut self) -> Result<StepEvent, SyncError> {
        let source = match self.plan.source.clone() {
            Some(source) => source,
            None => {
                self.phase = self.first_install_phase();
                return Err(self.invalid("clone_source"));
            }
        };

        let manifest = self.manifest_name.clone();
        let url = source.url.clone();
        let git_ref = source.git_ref.clone();
        let include = source.include.clone();
        let (head, packages) = tokio::task::spawn_blocking(move || {
            let checkout = SourceCheckout::clone_at(&url, git_ref.as_deref())?;
            let packages = checkout.discover_packages(&manifest, &include)?;
            Ok::<_, crate::errors::SourceError>((checkout.head_sha(), packages))
        })
        .await
        .map_err(|e| {
            SyncError::Source(crate::errors::SourceError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                e.to_string(),
            )))
        })??;

        info!(url = %source.url, head = %head, count = packages.len(), "source repository cloned");
        if self.specs.is_empty() {
            self.specs = packages
                .iter()
                .map(|p| p.to_spec(&source.url, source.git_ref.as_deref()))
                .collect();
        }
        self.phase = self.first_install_phase();
        Ok(StepEvent::SourceCloned {
            url: source.url,
            head,
            packages,
        })
    }

    async fn do_install(&mut self, index: usize) -> Result<StepEvent, SyncError> {
        let Some(spec) = self.specs.get(index).cloned() else {
            return Err(self.invalid("install"));
        };
        let total = self.specs.len();
        info!(package = %spec.name, index, total, "installing package");

        let result = match self.installer.install(&self.project, &spec, &self.cancel).await {
            Ok(result) => result,
            Err(e @ InstallError::InvalidSpec { .. }) => {
                ActionResult::failure(format!("failed to install {}", spec.name), e.to_string())
                    .with_data(KEY_PACKAGE, spec.name.as_str())
            }
            Err(e) => return Err(e.into()),
        };

        if result.needs_resolution() {
            self.pending.push(PendingConflict {
                package: spec.name.clone(),
                conflict_type: result.conflict_type().map(str::to_string),
                conflicting_package: result.conflicting_package().map(str::to_string),
                attempts: 0,
            });
        }
        self.results.push(result.clone());

        self.phase = if index + 1 < total {
            Phase::Install(index + 1)
        } else {
            self.after_installs()
        };
        Ok(StepEvent::Installed { index, total, result })
    }

    async fn do_resolve_step(&mut self) -> Result<StepEvent, SyncError> {
        if !self.auto_resolve {
            return Ok(StepEvent::AwaitingResolution {
                pending: self.pending.clone(),
            });
        }

        let next = self
            .pending
            .iter()
            .find(|p| !self.auto_attempted.contains(&p.package))
            .map(|p| p.package.clone());
        match next {
            Some(package) => {
                self.auto_attempted.insert(package.clone());
                let event = self.apply_resolution(&package, Resolution::RetryWithOverride).await?;
                // One automatic retry only.
                if let Some(pos) = self.pending.iter().position(|p| p.package == package) {
                    self.pending.remove(pos);
                    self.unresolved.push(package);
                }
                self.advance_if_resolved();
                Ok(event)
            }
            None => {
                self.finish_resolution()?;
                self.do_finalize().await
            }
        }
    }

    async fn do_finalize(&mut self) -> Result<StepEvent, SyncError> {
        let any_success = self
            .results
            .iter()
            .filter_map(|r| r.package())
            .any(|name| self.final_result(name).is_some_and(|r| r.ok));
        if !any_success && self.finalize == FinalizePolicy::OnSuccess {
            let reason = if self.results.is_empty() {
                "no packages were installed".to_string()
            } else {
                format!("all {} package(s) failed", self.results.len())
            };
            warn!(%reason, unresolved = self.unresolved.len(), "skipping finalize");
            self.phase = Phase::Done;
            return Ok(StepEvent::FinalizeSkipped { reason });
        }

        let result = self.installer.get(&self.project, &self.cancel).await?;
        if !result.ok {
            warn!(error = ?result.error_text, "finalize failed");
        }
        self.finalized = Some(result.ok);
        self.phase = Phase::Done;
        info!(run_id = %self.run_id, "sync finished");
        Ok(StepEvent::Finalized { result })
    }

    // -----------------------------------------------------------------------
    // Conflict resolution
    // -----------------------------------------------------------------------

    /// Perform one resolution attempt for a pending conflict.
    pub async fn resolve(&mut self, package: &str, resolution: Resolution) -> Result<StepEvent, SyncError> {
        if self.phase != Phase::ResolveConflicts {
            return Err(self.invalid("resolve"));
        }
        if !self.pending.iter().any(|p| p.package == package) {
            return Err(SyncError::NoPendingConflict(package.to_string()));
        }
        self.cancel.check().map_err(|_| self.fail(SyncError::Cancelled))?;

        let event = self
            .apply_resolution(package, resolution)
            .await
            .map_err(|e| self.fail(e))?;
        self.advance_if_resolved();
        Ok(event)
    }

    /// Give up on every remaining conflict and move on to `FINALIZE`.
    ///
    /// Returns the packages left unresolved by this call.
    pub fn finish_resolution(&mut self) -> Result<Vec<String>, SyncError> {
        if self.phase != Phase::ResolveConflicts {
            return Err(self.invalid("finish_resolution"));
        }
        let remaining: Vec<String> = self.pending.drain(..).map(|p| p.package).collect();
        if !remaining.is_empty() {
            warn!(packages = ?remaining, "conflicts left unresolved");
        }
        self.unresolved.extend(remaining.iter().cloned());
        self.phase = Phase::Finalize;
        Ok(remaining)
    }

    async fn apply_resolution(&mut self, package: &str, resolution: Resolution) -> Result<StepEvent, SyncError> {
        let Some(spec) = self.specs.iter().find(|s| s.name == package).cloned() else {
            return Err(SyncError::NoPendingConflict(package.to_string()));
        };

        let result = ConflictResolver::new(&self.installer)
            .apply(&self.project, &spec, resolution, &self.cancel)
            .await?;
        self.resolutions.push(result.clone());

        let still_conflicting = result.needs_resolution();
        if let Some(pos) = self.pending.iter().position(|p| p.package == package) {
            if resolution == Resolution::Skip {
                self.pending.remove(pos);
                self.unresolved.push(package.to_string());
            } else if still_conflicting {
                self.pending[pos].attempts += 1;
            } else {
                self.pending.remove(pos);
            }
        }

        info!(package, %resolution, ok = result.ok, "conflict resolution attempted");
        Ok(StepEvent::ConflictResolved {
            package: package.to_string(),
            resolution,
            result,
        })
    }

    fn advance_if_resolved(&mut self) {
        if self.phase == Phase::ResolveConflicts && self.pending.is_empty() {
            self.phase = Phase::Finalize;
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn first_install_phase(&self) -> Phase {
        if self.specs.is_empty() {
            self.after_installs()
        } else {
            Phase::Install(0)
        }
    }

    fn after_installs(&self) -> Phase {
        if self.pending.is_empty() {
            Phase::Finalize
        } else {
            Phase::ResolveConflicts
        }
    }

    fn invalid(&self, to: &str) -> SyncError {
        SyncError::InvalidStateTransition {
            from: self.phase.to_string(),
            to: to.to_string(),
        }
    }

    /// Move to the terminal phase implied by `err`, when it ends the run.
    fn fail(&mut self, err: SyncError) -> SyncError {
        match &err {
            SyncError::Cancelled => {
                warn!(phase = %self.phase, "sync cancelled");
                self.phase = Phase::Cancelled;
            }
            SyncError::ToolMissing(_) | SyncError::Backup(_) | SyncError::Source(_) | SyncError::Install(_) => {
                error!(phase = %self.phase, error = %err, "sync failed");
                self.phase = Phase::Failed;
            }
            SyncError::InvalidStateTransition { .. } | SyncError::NoPendingConflict(_) => {}
        }
        err
    }

    /// Snapshot of the run so far.
    pub fn summary(&self) -> SyncSummary {
        let packages = self
            .specs
            .iter()
            .filter_map(|spec| {
                let result = self.final_result(&spec.name)?;
                let resolution = self
                    .resolutions
                    .iter()
                    .rev()
                    .find(|r| r.package() == Some(spec.name.as_str()))
                    .and_then(|r| r.structured_data.get(KEY_RESOLUTION))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                Some(PackageOutcome {
                    name: spec.name.clone(),
                    ok: result.ok,
                    message: result.message.clone(),
                    error_text: result.error_text.clone(),
                    resolution,
                })
            })
            .collect();

        SyncSummary {
            run_id: self.run_id.to_string(),
            phase: self.phase,
            started_at: self.started_at,
            completed_at: Utc::now(),
            backup: self.backup.clone(),
            packages,
            unresolved: self.unresolved.clone(),
            finalized: self.finalized,
        }
    }

    // -----------------------------------------------------------------------
    // Unattended driver
    // -----------------------------------------------------------------------

    /// Drive the engine to a terminal phase on a spawned task, streaming
    /// every event. Conflicts still pending after automatic resolution are
    /// left unresolved. The channel closes after `Completed` or an error.
    pub fn spawn(mut self) -> mpsc::Receiver<Result<StepEvent, SyncError>> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            loop {
                let event = self.step().await;
                let last = matches!(event, Ok(StepEvent::Completed { .. }) | Err(_));
                let awaiting = matches!(event, Ok(StepEvent::AwaitingResolution { .. }));
                if tx.send(event).await.is_err() {
                    debug!("event receiver dropped, cancelling sync");
                    self.cancel.cancel();
                    break;
                }
                if last {
                    break;
                }
                if awaiting {
                    if let Err(e) = self.finish_resolution() {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });
        rx
    }
}

fn is_skip(result: &ActionResult) -> bool {
    result.structured_data.get(KEY_RESOLUTION).and_then(|v| v.as_str()) == Some(Resolution::Skip.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictAnalyzer;
    use crate::errors::ProcessError;
    use crate::process::{CommandOutput, CommandRunner, Invocation};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers by matching the invocation's arguments.
    struct Scripted {
        rules: Vec<(String, CommandOutput)>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for Scripted {
        async fn run(&self, invocation: &Invocation, _cancel: &CancelToken) -> Result<CommandOutput, ProcessError> {
            let line = invocation.args.join(" ");
            self.seen.lock().unwrap().push(line.clone());
            for (needle, out) in &self.rules {
                if line.contains(needle.as_str()) {
                    return Ok(out.clone());
                }
            }
            Ok(ok())
        }
    }

    fn ok() -> CommandOutput {
        CommandOutput {
            code: Some(0),
            ..Default::default()
        }
    }

    fn fail(stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(1),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    fn engine(rules: Vec<(&str, CommandOutput)>, names: &[&str]) -> (tempfile::TempDir, Arc<Scripted>, SyncEngine) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pubspec.yaml"), "name: app\n").unwrap();
        let project = Project::at(dir.path(), &Default::default());
        let runner = Arc::new(Scripted {
            rules: rules.into_iter().map(|(n, o)| (n.to_string(), o)).collect(),
            seen: Mutex::new(Vec::new()),
        });
        let installer = Arc::new(DependencyInstaller::new(
            runner.clone(),
            Arc::new(ConflictAnalyzer::new()),
            "flutter",
            vec!["pub".into()],
            Duration::from_secs(60),
        ));
        let specs = names
            .iter()
            .map(|n| PackageSpec::new(*n, format!("https://x/{}.git", n)))
            .collect();
        let engine = SyncEngine::new(project, SyncPlan::new(specs), installer, CancelToken::new());
        (dir, runner, engine)
    }

    #[tokio::test]
    async fn test_happy_path_phases() {
        let (_dir, runner, mut engine) = engine(vec![], &["pkg_a", "pkg_b"]);
        assert_eq!(engine.phase(), Phase::Setup);

        assert!(matches!(engine.step().await.unwrap(), StepEvent::BackupCreated { .. }));
        assert_eq!(engine.phase(), Phase::Install(0));
        assert!(matches!(engine.step().await.unwrap(), StepEvent::Installed { index: 0, total: 2, .. }));
        assert!(matches!(engine.step().await.unwrap(), StepEvent::Installed { index: 1, .. }));
        assert_eq!(engine.phase(), Phase::Finalize);
        assert!(matches!(engine.step().await.unwrap(), StepEvent::Finalized { .. }));
        assert_eq!(engine.phase(), Phase::Done);

        let StepEvent::Completed { summary } = engine.step().await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.finalized, Some(true));

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen.first().map(String::as_str), Some("--version"));
        assert_eq!(seen.last().map(String::as_str), Some("pub get"));
    }

    #[tokio::test]
    async fn test_failure_in_middle_continues() {
        let (_dir, _runner, mut engine) = engine(vec![("pkg_b:", fail("Could not resolve host: x"))], &["pkg_a", "pkg_b", "pkg_c"]);
        for _ in 0..4 {
            engine.step().await.unwrap();
        }
        assert_eq!(engine.results().len(), 3);
        assert_eq!(engine.results().iter().filter(|r| !r.ok).count(), 1);
        assert!(!engine.results()[1].ok);
        assert_eq!(engine.phase(), Phase::Finalize);
    }

    #[tokio::test]
    async fn test_manual_resolution_flow() {
        let conflict = fail("version solving failed because pkg_b requires pkg_c ^2.0.0");
        let (_dir, runner, mut engine) = engine(vec![("add pkg_a:", conflict)], &["pkg_a"]);
        engine.step().await.unwrap();
        engine.step().await.unwrap();
        assert_eq!(engine.phase(), Phase::ResolveConflicts);

        let StepEvent::AwaitingResolution { pending } = engine.step().await.unwrap() else {
            panic!("expected awaiting resolution");
        };
        assert_eq!(pending[0].package, "pkg_a");
        assert_eq!(pending[0].conflicting_package.as_deref(), Some("pkg_b"));

        assert!(matches!(
            engine.resolve("pkg_x", Resolution::Skip).await,
            Err(SyncError::NoPendingConflict(_))
        ));

        let event = engine.resolve("pkg_a", Resolution::RetryWithOverride).await.unwrap();
        assert!(matches!(event, StepEvent::ConflictResolved { ref result, .. } if result.ok));
        assert_eq!(engine.phase(), Phase::Finalize);
        assert!(runner.seen.lock().unwrap().iter().any(|l| l.contains("override:pkg_a:")));

        // The install record keeps its conflict annotations.
        assert_eq!(engine.results().len(), 1);
        let install = &engine.results()[0];
        assert!(!install.ok);
        assert!(install.needs_resolution());
        assert_eq!(install.conflicting_package(), Some("pkg_b"));
        assert_eq!(engine.resolution_attempts().len(), 1);
        assert!(engine.final_result("pkg_a").unwrap().ok);

        assert!(matches!(engine.step().await.unwrap(), StepEvent::Finalized { .. }));
        let summary = engine.summary();
        assert!(summary.packages[0].ok);
        assert_eq!(summary.packages[0].resolution.as_deref(), Some("retry_with_override"));
        assert!(summary.unresolved.is_empty());
        assert_eq!(summary.finalized, Some(true));
    }

    #[tokio::test]
    async fn test_skip_keeps_install_result_as_outcome() {
        let conflict = fail("version solving failed because pkg_b requires pkg_c ^2.0.0");
        let (_dir, _runner, mut engine) = engine(vec![("add pkg_a:", conflict)], &["pkg_a"]);
        engine.step().await.unwrap();
        engine.step().await.unwrap();

        engine.resolve("pkg_a", Resolution::Skip).await.unwrap();
        assert_eq!(engine.resolution_attempts().len(), 1);
        let outcome = engine.final_result("pkg_a").unwrap();
        assert_eq!(outcome, &engine.results()[0]);
        assert!(outcome.needs_resolution());

        let summary = engine.summary();
        assert_eq!(summary.unresolved, vec!["pkg_a"]);
        assert_eq!(summary.packages[0].resolution.as_deref(), Some("skip"));
        assert_eq!(summary.packages[0].message, "failed to install pkg_a");
    }

    #[tokio::test]
    async fn test_finish_resolution_marks_unresolved_and_skips_finalize() {
        let conflict = fail("version solving failed");
        let (_dir, runner, mut engine) = engine(vec![("add ", conflict)], &["pkg_a"]);
        engine.step().await.unwrap();
        engine.step().await.unwrap();
        assert_eq!(engine.finish_resolution().unwrap(), vec!["pkg_a"]);
        assert_eq!(engine.phase(), Phase::Finalize);

        assert!(matches!(engine.step().await.unwrap(), StepEvent::FinalizeSkipped { .. }));
        assert_eq!(engine.summary().unresolved, vec!["pkg_a"]);
        assert!(!runner.seen.lock().unwrap().iter().any(|l| l == "pub get"));
    }

    #[tokio::test]
    async fn test_finalize_always_runs_when_configured() {
        let (_dir, runner, engine) = engine(vec![("add ", fail("boom"))], &["pkg_a"]);
        let mut engine = engine.with_finalize(FinalizePolicy::Always);
        for _ in 0..3 {
            engine.step().await.unwrap();
        }
        assert_eq!(engine.phase(), Phase::Done);
        assert!(runner.seen.lock().unwrap().iter().any(|l| l == "pub get"));
    }

    #[tokio::test]
    async fn test_auto_resolve_applies_single_override() {
        let conflict = fail("version solving failed because pkg_b requires x");
        let (_dir, runner, engine) = engine(vec![("add ", conflict)], &["pkg_a"]);
        let mut engine = engine.with_auto_resolve(true);
        engine.step().await.unwrap();
        engine.step().await.unwrap();
        let event = engine.step().await.unwrap();
        assert!(matches!(event, StepEvent::ConflictResolved { resolution: Resolution::RetryWithOverride, .. }));
        assert_eq!(engine.phase(), Phase::Finalize);
        assert_eq!(engine.summary().unresolved, vec!["pkg_a"]);
        let overrides = runner
            .seen
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.contains("override:"))
            .count();
        assert_eq!(overrides, 1);
    }

    #[tokio::test]
    async fn test_resolve_outside_phase_is_rejected() {
        let (_dir, _runner, mut engine) = engine(vec![], &["pkg_a"]);
        let err = engine.resolve("pkg_a", Resolution::Skip).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidStateTransition { .. }));
        assert_eq!(engine.phase(), Phase::Setup);
        assert!(engine.finish_resolution().is_err());
    }

    #[tokio::test]
    async fn test_cancel_between_steps() {
        let (_dir, _runner, mut engine) = engine(vec![], &["pkg_a", "pkg_b"]);
        engine.step().await.unwrap();
        engine.step().await.unwrap();
        engine.cancel_token().cancel();
        assert!(matches!(engine.step().await, Err(SyncError::Cancelled)));
        assert_eq!(engine.phase(), Phase::Cancelled);
        assert_eq!(engine.results().len(), 1);
        assert!(matches!(engine.step().await, Err(SyncError::InvalidStateTransition { .. })));
    }

    #[tokio::test]
    async fn test_backup_failure_prevents_installs() {
        let (dir, runner, mut engine) = engine(vec![], &["pkg_a"]);
        std::fs::remove_file(dir.path().join("pubspec.yaml")).unwrap();
        assert!(matches!(engine.step().await, Err(SyncError::Backup(_))));
        assert_eq!(engine.phase(), Phase::Failed);
        assert!(!runner.seen.lock().unwrap().iter().any(|l| l.starts_with("pub add")));
    }

    #[tokio::test]
    async fn test_spawn_streams_until_completed() {
        let conflict = fail("version solving failed");
        let (_dir, _runner, engine) = engine(vec![("add pkg_b:", conflict)], &["pkg_a", "pkg_b"]);
        let mut rx = engine.spawn();
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event.unwrap());
        }
        assert!(matches!(events.first(), Some(StepEvent::BackupCreated { .. })));
        assert!(events.iter().any(|e| matches!(e, StepEvent::AwaitingResolution { .. })));
        let Some(StepEvent::Completed { summary }) = events.last() else {
            panic!("expected completion");
        };
        assert_eq!(summary.packages.len(), 2);
        assert_eq!(summary.unresolved, vec!["pkg_b"]);
        assert_eq!(summary.finalized, Some(true));
    }
}
