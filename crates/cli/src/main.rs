//! depsync command-line tool.
//!
//! Provides subcommands for checking git dependencies for staleness, adding
//! git dependencies, running a full synchronization with interactive
//! conflict resolution, and managing manifest backups and configuration.

mod commands;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use depsync_core::config::DepsyncConfig;
use depsync_core::process::CancelToken;
use depsync_core::{DepSync, Project};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Keep git-sourced pub dependencies in sync with upstream.
#[derive(Parser, Debug)]
#[command(name = "depsync", version, about = "Keep git-sourced pub dependencies in sync with upstream")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory inside the project (defaults to the current directory).
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report git dependencies whose upstream ref has moved.
    Stale {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Add a git dependency.
    Add {
        /// Package name.
        name: String,

        /// Git repository URL.
        #[arg(long)]
        url: String,

        /// Branch, tag or commit.
        #[arg(long = "ref")]
        git_ref: Option<String>,

        /// Package path inside the repository.
        #[arg(long)]
        path: Option<String>,

        /// Retry once with a dependency override on conflict.
        #[arg(long)]
        auto_resolve: bool,
    },

    /// Install a set of git dependencies, resolving conflicts as they come up.
    Sync {
        /// Package to install, as name=url[#ref[:path]]. Repeatable.
        #[arg(long = "spec", value_name = "SPEC")]
        specs: Vec<String>,

        /// Clone this repository and install the packages found in it.
        #[arg(long)]
        source: Option<String>,

        /// Ref to check out in the source repository.
        #[arg(long, requires = "source")]
        source_ref: Option<String>,

        /// Retry conflicting packages once with an override, without asking.
        #[arg(long)]
        auto_resolve: bool,

        /// Never prompt; conflicts left after automatic resolution stay unresolved.
        #[arg(short, long)]
        yes: bool,
    },

    /// Upgrade every git dependency known to be stale.
    Upgrade,

    /// List manifest backups, newest first.
    Backups,

    /// Restore the manifest from a backup.
    Restore {
        /// Backup file to restore.
        #[arg(conflicts_with = "latest")]
        path: Option<PathBuf>,

        /// Restore the newest backup.
        #[arg(long)]
        latest: bool,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Write a default depsync.toml into the project.
    Init {
        /// Output path (defaults to <project>/depsync.toml).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Validate the effective configuration.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("Error: {:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let start = match &cli.project {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to read the current directory")?,
    };

    match cli.command {
        Commands::Init { output, force } => commands::init::run(cli.config.as_deref(), &start, output, force),
        Commands::Validate => commands::init::validate(cli.config.as_deref(), &start),
        command => {
            let (config, project) = load_project(cli.config.as_deref(), &start)?;
            let cancel = CancelToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let depsync = DepSync::new(config).with_cancel(cancel);

            match command {
                Commands::Stale { json } => commands::stale::run(&depsync, &project, json).await,
                Commands::Add {
                    name,
                    url,
                    git_ref,
                    path,
                    auto_resolve,
                } => commands::add::run(&depsync, &project, name, url, git_ref, path, auto_resolve).await,
                Commands::Sync {
                    specs,
                    source,
                    source_ref,
                    auto_resolve,
                    yes,
                } => {
                    let options = commands::sync::SyncOptions {
                        specs,
                        source,
                        source_ref,
                        auto_resolve,
                        interactive: !yes && console::user_attended(),
                    };
                    commands::sync::run(&depsync, project, options).await
                }
                Commands::Upgrade => commands::stale::upgrade(&depsync, &project).await,
                Commands::Backups => commands::backups::list(&depsync, &project),
                Commands::Restore { path, latest, yes } => {
                    commands::backups::restore(&depsync, &project, path, latest, yes || !console::user_attended())
                }
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

/// Load configuration and locate the project.
///
/// The project-level `depsync.toml` lives at the project root, which is only
/// known after discovery, so configuration is resolved a second time once
/// the root is found.
fn load_project(explicit: Option<&Path>, start: &Path) -> Result<(DepsyncConfig, Project)> {
    let initial = DepsyncConfig::load_and_resolve(explicit, start).context("failed to load configuration")?;
    let project = Project::discover(start, &initial.files).context("failed to locate the project")?;

    debug!(root = %project.root.display(), manifest = %project.manifest_path.display(), "project located");
    if project.root == start {
        return Ok((initial, project));
    }
    let config =
        DepsyncConfig::load_and_resolve(explicit, &project.root).context("failed to load project configuration")?;
    let project = Project::at(&project.root, &config.files);
    Ok((config, project))
}

fn cancel_on_ctrl_c(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", style::warn("Interrupted, stopping after the current step..."));
            cancel.cancel();
        }
    });
}
