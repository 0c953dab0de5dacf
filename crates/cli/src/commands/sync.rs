//! `depsync sync`: drive the sync engine step by step, prompting for
//! conflict resolutions when a terminal is attached.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use dialoguer::Select;

use depsync_core::conflict::Resolution;
use depsync_core::sync_engine::{Phase, PendingConflict, StepEvent, SyncPlan, SyncSummary};
use depsync_core::{DepSync, PackageSpec, Project, SyncEngine};

use crate::style;

pub struct SyncOptions {
    pub specs: Vec<String>,
    pub source: Option<String>,
    pub source_ref: Option<String>,
    pub auto_resolve: bool,
    pub interactive: bool,
}

pub async fn run(depsync: &DepSync, project: Project, options: SyncOptions) -> Result<()> {
    let specs = options
        .specs
        .iter()
        .map(|s| {
            PackageSpec::parse_shorthand(s)
                .with_context(|| format!("invalid --spec '{}': expected name=url[#ref[:path]]", s))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut plan = SyncPlan::new(specs);
    if let Some(url) = options.source {
        plan = plan.with_source(url, options.source_ref, Vec::new());
    }
    if plan.specs.is_empty() && plan.source.is_none() {
        anyhow::bail!("nothing to sync: pass --spec or --source");
    }

    let mut engine = depsync.engine(project, plan);
    if options.auto_resolve {
        engine = engine.with_auto_resolve(true);
    }

    let summary = match drive(&mut engine, options.interactive).await {
        Ok(summary) => summary,
        Err(e) => {
            if let Some(backup) = engine.backup() {
                println!(
                    "{}",
                    style::warn(&format!(
                        "Manifest backup kept at {} (restore with `depsync restore --latest`)",
                        backup.backup_path.display()
                    ))
                );
            }
            return Err(e);
        }
    };

    print_summary(&summary);
    if summary.failed() > 0 || !summary.unresolved.is_empty() {
        anyhow::bail!(
            "{} package(s) failed, {} left unresolved",
            summary.failed(),
            summary.unresolved.len()
        );
    }
    Ok(())
}

async fn drive(engine: &mut SyncEngine, interactive: bool) -> Result<SyncSummary> {
    loop {
        let spinner = style::spinner(format!("{}...", engine.phase()));
        let event = engine.step().await;
        spinner.finish_and_clear();

        match event.with_context(|| format!("sync stopped in phase {}", engine.phase()))? {
            StepEvent::BackupCreated { record } => {
                println!("{}", style::dim(&format!("backup: {}", record.backup_path.display())));
            }
            StepEvent::SourceCloned { url, head, packages } => {
                println!(
                    "{}",
                    style::success(&format!(
                        "Cloned {} at {} ({} packages)",
                        url,
                        style::short_rev(&head),
                        packages.len()
                    ))
                );
            }
            StepEvent::Installed { index, total, result } => {
                print!("[{}/{}] ", index + 1, total);
                super::print_result(&result);
            }
            StepEvent::AwaitingResolution { pending } => {
                if interactive {
                    resolve_interactively(engine, pending).await?;
                } else {
                    let left = engine.finish_resolution()?;
                    for name in left {
                        println!("{}", style::warn(&format!("{}: conflict left unresolved", name)));
                    }
                }
            }
            StepEvent::ConflictResolved { package, resolution, result } => {
                print!("{} ({}): ", package, resolution);
                super::print_result(&result);
            }
            StepEvent::Finalized { result } => {
                super::print_result(&result);
            }
            StepEvent::FinalizeSkipped { reason } => {
                println!("{}", style::warn(&format!("Skipped final `pub get`: {}", reason)));
            }
            StepEvent::Completed { summary } => return Ok(summary),
        }
    }
}

/// Ask about each pending conflict until none remain or the user stops.
async fn resolve_interactively(engine: &mut SyncEngine, mut pending: Vec<PendingConflict>) -> Result<()> {
    let mut labels: Vec<String> = Resolution::ALL.iter().map(|r| r.to_string()).collect();
    labels.push("leave the remaining conflicts unresolved".to_string());

    while engine.phase() == Phase::ResolveConflicts {
        let Some(conflict) = pending.first().cloned() else {
            break;
        };
        println!();
        let blamed = conflict.conflicting_package.as_deref().unwrap_or("unknown");
        let kind = conflict.conflict_type.as_deref().unwrap_or("conflict");
        println!(
            "{}",
            style::warn(&format!(
                "{}: {} with {} (attempts: {})",
                conflict.package, kind, blamed, conflict.attempts
            ))
        );

        let choice = Select::new()
            .with_prompt(format!("How should {} be resolved?", conflict.package))
            .items(&labels)
            .default(0)
            .interact()
            .context("failed to read resolution choice")?;

        let Some(resolution) = Resolution::ALL.get(choice).copied() else {
            let left = engine.finish_resolution()?;
            println!("{}", style::warn(&format!("{} conflict(s) left unresolved", left.len())));
            break;
        };

        let spinner = style::spinner(format!("Applying {} to {}...", resolution, conflict.package));
        let event = engine.resolve(&conflict.package, resolution).await;
        spinner.finish_and_clear();
        if let StepEvent::ConflictResolved { result, .. } = event? {
            super::print_result(&result);
        }
        pending = engine.pending_conflicts().to_vec();
    }
    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    println!();
    println!(
        "{}",
        style::header(&format!(
            "Sync {} ({} ok, {} failed)",
            summary.phase,
            summary.succeeded(),
            summary.failed()
        ))
    );
    println!();

    if !summary.packages.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Package", "Result", "Resolution", "Message"]);
        for p in &summary.packages {
            let outcome = if p.ok {
                Cell::new("ok").fg(Color::Green)
            } else if summary.unresolved.contains(&p.name) {
                Cell::new("unresolved").fg(Color::Yellow)
            } else {
                Cell::new("failed").fg(Color::Red)
            };
            table.add_row(vec![
                Cell::new(&p.name),
                outcome,
                Cell::new(p.resolution.as_deref().unwrap_or("-")),
                Cell::new(&p.message),
            ]);
        }
        println!("{}", table);
        println!();
    }

    match summary.finalized {
        Some(true) => println!("{}", style::success("Dependencies fetched")),
        Some(false) => println!("{}", style::error("Final `pub get` failed")),
        None => {}
    }
    if let Some(backup) = &summary.backup {
        println!("{}", style::dim(&format!("backup: {}", backup.backup_path.display())));
    }
    println!("{}", style::dim(&format!("run {}", summary.run_id)));
}
