//! `depsync stale` and `depsync upgrade`.

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};

use depsync_core::staleness::{StalenessReport, StalenessStatus};
use depsync_core::{DepSync, Project};

use crate::style;

/// Print the staleness report as a table, or as JSON with `json`.
pub async fn run(depsync: &DepSync, project: &Project, json: bool) -> Result<()> {
    let spinner = (!json).then(|| style::spinner("Querying remotes..."));
    let report = depsync.detect_stale(project).await;
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    let report = report.context("staleness check failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_report(&report);
    Ok(())
}

fn print_report(report: &StalenessReport) {
    println!();
    if report.results.is_empty() {
        println!("{}", style::success("No git dependencies in the lock file"));
        println!();
        return;
    }

    let stale = report.stale().count();
    println!(
        "{}",
        style::header(&format!("Git dependencies ({}, {} stale)", report.results.len(), stale))
    );
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Package", "Ref", "Locked", "Remote", "Status"]);

    for r in &report.results {
        let status = match &r.status {
            StalenessStatus::Current => Cell::new("current").fg(Color::Green),
            StalenessStatus::Stale => Cell::new("stale").fg(Color::Yellow),
            StalenessStatus::Unknown { reason } => Cell::new(format!("unknown: {}", reason)).fg(Color::Red),
        };
        let remote = r
            .remote_revision
            .as_deref()
            .map(style::short_rev)
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&r.dependency.name),
            Cell::new(&r.dependency.git_ref),
            Cell::new(style::short_rev(&r.dependency.resolved_revision)),
            Cell::new(remote),
            status,
        ]);
    }

    println!("{}", table);
    println!();

    if report.lock_possibly_stale {
        let age = report
            .lock_age
            .map(|d| format!(" ({}h old)", d.as_secs() / 3600))
            .unwrap_or_default();
        println!("{}", style::warn(&format!("Lock file may be out of date{}", age)));
        println!();
    }
}

/// Upgrade every stale git dependency.
pub async fn upgrade(depsync: &DepSync, project: &Project) -> Result<()> {
    let spinner = style::spinner("Checking and upgrading stale git dependencies...");
    let result = depsync.refresh_stale(project).await;
    spinner.finish_and_clear();
    let result = result.context("upgrade failed")?;

    super::print_result(&result);
    if let Some(backup) = result.structured_data.get(depsync_core::service::KEY_BACKUP).and_then(|v| v.as_str()) {
        println!("  {}", style::dim(&format!("backup: {}", backup)));
    }
    let unknown = result
        .structured_data
        .get("unknown")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .unwrap_or(0);
    if unknown > 0 {
        println!(
            "{}",
            style::warn(&format!("{} dependencies could not be checked and were left alone", unknown))
        );
    }

    if !result.ok {
        anyhow::bail!("upgrade failed");
    }
    Ok(())
}
