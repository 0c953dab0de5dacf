//! `depsync backups` and `depsync restore`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::{Confirm, Select};

use depsync_core::{BackupRecord, DepSync, Project};

use crate::style;

pub fn list(depsync: &DepSync, project: &Project) -> Result<()> {
    let records = depsync
        .backups()
        .list_backups(project)
        .context("failed to list backups")?;

    println!();
    if records.is_empty() {
        println!("{}", style::success("No backups"));
        println!();
        return Ok(());
    }

    println!("{}", style::header(&format!("Backups of {} ({})", project.manifest_path.display(), records.len())));
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Created", "File", "SHA-256"]);
    for r in &records {
        table.add_row(vec![
            Cell::new(created(r)),
            Cell::new(file_name(r)),
            Cell::new(&r.sha256[..12.min(r.sha256.len())]),
        ]);
    }
    println!("{}", table);
    println!();
    Ok(())
}

/// Restore a backup chosen by path, `--latest`, or an interactive pick.
pub fn restore(depsync: &DepSync, project: &Project, path: Option<PathBuf>, latest: bool, assume_yes: bool) -> Result<()> {
    let backups = depsync.backups();

    let record = match path {
        Some(path) => backups
            .record_for(project, &path)
            .with_context(|| format!("cannot use {} as a backup", path.display()))?,
        None => {
            let records = backups.list_backups(project).context("failed to list backups")?;
            if records.is_empty() {
                anyhow::bail!("no backups of {} found", project.manifest_path.display());
            }
            if latest || assume_yes {
                records.into_iter().next().context("no backups found")?
            } else {
                let items: Vec<String> = records.iter().map(|r| format!("{}  {}", created(r), file_name(r))).collect();
                let choice = Select::new()
                    .with_prompt("Backup to restore")
                    .items(&items)
                    .default(0)
                    .interact()
                    .context("failed to read backup selection")?;
                records.into_iter().nth(choice).context("invalid selection")?
            }
        }
    };

    if !assume_yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Overwrite {} with {}?",
                record.original_path.display(),
                file_name(&record)
            ))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !confirmed {
            println!("{}", style::warn("Restore cancelled. The manifest was not modified."));
            return Ok(());
        }
    }

    backups.restore(&record).context("restore failed")?;
    println!(
        "{}",
        style::success(&format!("Restored {} from {}", record.original_path.display(), file_name(&record)))
    );
    println!("{}", style::dim("Run `depsync sync` or `pub get` to refresh the lock file."));
    Ok(())
}

fn created(record: &BackupRecord) -> String {
    record
        .timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn file_name(record: &BackupRecord) -> String {
    record
        .backup_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
