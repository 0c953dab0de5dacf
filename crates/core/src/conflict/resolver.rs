//! Conflict resolution strategies.
//!
//! A conflicting install can be retried through an override directive,
//! retried as-is (for failures the caller fixed out of band), or skipped.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::InstallError;
use crate::installer::DependencyInstaller;
use crate::models::{ActionResult, PackageSpec, KEY_PACKAGE, KEY_RESOLUTION};
use crate::process::CancelToken;
use crate::project::Project;

/// Named resolution strategies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Reinstall with `override:` so the requested source wins.
    RetryWithOverride,
    /// Leave the package out and record the conflict as unresolved.
    Skip,
    /// Run the same install again.
    RetryUnchanged,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RetryWithOverride => "retry_with_override",
            Self::Skip => "skip",
            Self::RetryUnchanged => "retry_unchanged",
        }
    }

    pub const ALL: [Resolution; 3] = [Self::RetryWithOverride, Self::Skip, Self::RetryUnchanged];
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Applies one [`Resolution`] to one package.
pub struct ConflictResolver<'a> {
    installer: &'a DependencyInstaller,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(installer: &'a DependencyInstaller) -> Self {
        Self { installer }
    }

    /// Perform exactly one attempt for `spec` under `resolution`.
    pub async fn apply(
        &self,
        project: &Project,
        spec: &PackageSpec,
        resolution: Resolution,
        cancel: &CancelToken,
    ) -> Result<ActionResult, InstallError> {
        info!(package = %spec.name, %resolution, "resolving conflict");
        let result = match resolution {
            Resolution::RetryWithOverride => self.installer.install_override(project, spec, cancel).await?,
            Resolution::RetryUnchanged => self.installer.install(project, spec, cancel).await?,
            Resolution::Skip => ActionResult::failure(
                format!("skipped {}", spec.name),
                "conflict left unresolved",
            )
            .with_data(KEY_PACKAGE, spec.name.as_str()),
        };
        Ok(result.with_data(KEY_RESOLUTION, resolution.as_str()))
    }
}

/// Install `spec`, retrying once with an override when the install hits a
/// conflict and `auto_resolve` is set. Without `auto_resolve` the first
/// result is returned as-is, annotations included.
pub async fn add_dependency(
    installer: &DependencyInstaller,
    project: &Project,
    spec: &PackageSpec,
    auto_resolve: bool,
    cancel: &CancelToken,
) -> Result<ActionResult, InstallError> {
    let first = installer.install(project, spec, cancel).await?;
    if first.ok || !first.needs_resolution() || !auto_resolve {
        return Ok(first);
    }
    cancel.check()?;

    let mut retried = ConflictResolver::new(installer)
        .apply(project, spec, Resolution::RetryWithOverride, cancel)
        .await?;
    let mut logs = first.logs;
    logs.append(&mut retried.logs);
    retried.logs = logs;
    Ok(retried)
}
