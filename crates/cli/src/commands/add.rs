//! `depsync add`.

use anyhow::{Context, Result};

use depsync_core::service::KEY_BACKUP;
use depsync_core::{DepSync, PackageSpec, Project};

use crate::style;

pub async fn run(
    depsync: &DepSync,
    project: &Project,
    name: String,
    url: String,
    git_ref: Option<String>,
    path: Option<String>,
    auto_resolve: bool,
) -> Result<()> {
    let mut spec = PackageSpec::new(name, url);
    spec.git_ref = git_ref;
    spec.subdirectory = path;

    let spinner = style::spinner(format!("Adding {}...", spec.name));
    let result = depsync.add_dependency(project, &spec, auto_resolve).await;
    spinner.finish_and_clear();
    let result = result.with_context(|| format!("failed to add {}", spec.name))?;

    super::print_result(&result);
    if let Some(backup) = result.structured_data.get(KEY_BACKUP).and_then(|v| v.as_str()) {
        println!("  {}", style::dim(&format!("backup: {}", backup)));
    }

    if result.ok {
        return Ok(());
    }
    if result.needs_resolution() {
        let blamed = result.conflicting_package().unwrap_or("another dependency");
        let hint = if auto_resolve {
            format!("Still conflicts with {} after an override retry", blamed)
        } else {
            format!("Conflicts with {}. Re-run with --auto-resolve to override it.", blamed)
        };
        println!("{}", style::warn(&hint));
    }
    anyhow::bail!("{} was not added", spec.name)
}
