//! `depsync init` and `depsync validate`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::Style;
use dialoguer::Confirm;

use depsync_core::config::{DepsyncConfig, FilesConfig, PROJECT_CONFIG_FILE};
use depsync_core::Project;

use crate::style;

/// Write the default configuration, by default next to the project manifest.
pub fn run(explicit: Option<&Path>, start: &Path, output: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match output.or_else(|| explicit.map(Path::to_path_buf)) {
        Some(path) => path,
        None => project_root(start).join(PROJECT_CONFIG_FILE),
    };

    if path.exists() && !force {
        if !console::user_attended() {
            anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
        }
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", path.display()))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !overwrite {
            println!("{}", style::warn("Init cancelled. Existing file was not modified."));
            return Ok(());
        }
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, DepsyncConfig::default_toml())
        .with_context(|| format!("failed to write {}", path.display()))?;

    println!("{}", style::success(&format!("Wrote {}", path.display())));
    Ok(())
}

/// Load the effective configuration and report what it resolves to.
pub fn validate(explicit: Option<&Path>, start: &Path) -> Result<()> {
    let root = project_root(start);
    let config = DepsyncConfig::load_and_resolve(explicit, &root).context("configuration is invalid")?;

    let value = Style::new().cyan();
    let tool = std::iter::once(config.tool.program.as_str())
        .chain(config.tool.subcommand.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");

    println!();
    println!("{}", style::header("Effective configuration"));
    println!();
    println!("    Build tool     : {}", value.apply_to(tool));
    println!("    Git            : {}", value.apply_to(&config.tool.git));
    println!("    Manifest / lock: {}", value.apply_to(format!("{} / {}", config.files.manifest, config.files.lock)));
    println!("    Remote backend : {}", value.apply_to(format!("{:?}", config.remote.backend).to_lowercase()));
    println!("    Lock max age   : {}", value.apply_to(format!("{}h", config.staleness.max_lock_age_hours)));
    println!("    Auto-resolve   : {}", value.apply_to(config.sync.auto_resolve));
    println!();
    println!("{}", style::success("Configuration is valid"));
    Ok(())
}

fn project_root(start: &Path) -> PathBuf {
    Project::discover(start, &FilesConfig::default())
        .map(|p| p.root)
        .unwrap_or_else(|_| start.to_path_buf())
}
