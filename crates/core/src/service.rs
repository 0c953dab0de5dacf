//! Caller-facing facade.
//!
//! [`DepSync`] wires configuration, the subprocess runner, the remote oracle
//! and the installer together and exposes the operations a front end needs.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::backup::BackupManager;
use crate::config::{DepsyncConfig, RemoteBackend};
use crate::conflict::{self, ConflictAnalyzer};
use crate::errors::{CoreError, SyncError};
use crate::git::{Git2Oracle, GitCliOracle, RemoteOracle};
use crate::installer::DependencyInstaller;
use crate::models::{ActionResult, PackageSpec};
use crate::process::{CancelToken, CommandRunner, ProcessRunner};
use crate::project::Project;
use crate::staleness::{StalenessDetector, StalenessReport};
use crate::sync_engine::{StepEvent, SyncEngine, SyncPlan};

/// `structured_data` key: path of the backup taken before mutating.
pub const KEY_BACKUP: &str = "backup";

pub struct DepSync {
    config: DepsyncConfig,
    oracle: Arc<dyn RemoteOracle>,
    installer: Arc<DependencyInstaller>,
    backups: BackupManager,
    cancel: CancelToken,
}

impl DepSync {
    /// Build with real subprocesses.
    pub fn new(config: DepsyncConfig) -> Self {
        Self::with_runner(config, Arc::new(ProcessRunner))
    }

    /// Build on top of an arbitrary runner; the remote backend still follows
    /// `config.remote.backend`.
    pub fn with_runner(config: DepsyncConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let oracle: Arc<dyn RemoteOracle> = match config.remote.backend {
            RemoteBackend::Cli => Arc::new(GitCliOracle::new(
                runner.clone(),
                config.tool.git.clone(),
                config.remote.timeout(),
            )),
            RemoteBackend::Libgit2 => Arc::new(Git2Oracle::new(config.remote.timeout())),
        };
        let installer = Arc::new(DependencyInstaller::new(
            runner,
            Arc::new(ConflictAnalyzer::new()),
            config.tool.program.clone(),
            config.tool.subcommand.clone(),
            config.tool.command_timeout(),
        ));
        Self {
            config,
            oracle,
            installer,
            backups: BackupManager::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn RemoteOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Cancellation token shared by every operation started from here.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &DepsyncConfig {
        &self.config
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Locate the project containing `start`.
    pub fn discover_project(&self, start: &Path) -> Result<Project, CoreError> {
        Ok(Project::discover(start, &self.config.files)?)
    }

    /// Compare every locked git dependency against its remote.
    pub async fn detect_stale(&self, project: &Project) -> Result<StalenessReport, CoreError> {
        let detector = StalenessDetector::new(self.oracle.clone(), self.config.staleness.max_lock_age());
        Ok(detector.detect(project, &self.cancel).await?)
    }

    /// Back up the manifest and add one git dependency, retrying once with
    /// an override on conflict when `auto_resolve` is set.
    pub async fn add_dependency(&self, project: &Project, spec: &PackageSpec, auto_resolve: bool) -> Result<ActionResult, CoreError> {
        self.cancel.check()?;
        let record = self.backups.create(project)?;
        let result = conflict::add_dependency(&self.installer, project, spec, auto_resolve, &self.cancel)
            .await
            .map_err(SyncError::from)?;
        Ok(result.with_data(KEY_BACKUP, record.backup_path.display().to_string()))
    }

    /// A step-driven engine for `plan`.
    pub fn engine(&self, project: Project, mut plan: SyncPlan) -> SyncEngine {
        if let Some(source) = plan.source.as_mut() {
            if source.include.is_empty() {
                source.include = self.config.source.include.clone();
            }
        }
        SyncEngine::new(project, plan, self.installer.clone(), self.cancel.clone())
            .with_auto_resolve(self.config.sync.auto_resolve)
            .with_finalize(self.config.sync.finalize)
    }

    /// Run `plan` unattended, streaming step events.
    pub fn synchronize(&self, project: Project, plan: SyncPlan) -> mpsc::Receiver<Result<StepEvent, SyncError>> {
        self.engine(project, plan).spawn()
    }

    /// Upgrade the dependencies known to be stale.
    ///
    /// Dependencies whose remote could not be queried are left alone. Nothing
    /// is written when every dependency is current.
    pub async fn refresh_stale(&self, project: &Project) -> Result<ActionResult, CoreError> {
        let report = self.detect_stale(project).await?;
        let stale = report.stale_names();
        let unknown: Vec<String> = report.unknown().map(|r| r.dependency.name.clone()).collect();

        if stale.is_empty() {
            info!("no stale git dependencies");
            return Ok(ActionResult::success("all git dependencies are current")
                .with_data("stale", Vec::<String>::new())
                .with_data("unknown", unknown)
                .with_data("lock_possibly_stale", report.lock_possibly_stale));
        }

        let record = self.backups.create(project)?;
        info!(packages = ?stale, "upgrading stale git dependencies");
        let result = self
            .installer
            .upgrade(project, &stale, &self.cancel)
            .await
            .map_err(SyncError::from)?;
        Ok(result
            .with_data("stale", stale)
            .with_data("unknown", unknown)
            .with_data("lock_possibly_stale", report.lock_possibly_stale)
            .with_data(KEY_BACKUP, record.backup_path.display().to_string()))
    }
}
