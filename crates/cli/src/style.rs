//! Terminal styling shared by the subcommands.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

fn marked(mark: &str, style: Style, msg: &str) -> String {
    format!("{} {}", style.apply_to(mark), msg)
}

pub fn success(msg: &str) -> String {
    marked("✓", Style::new().green(), msg)
}

pub fn error(msg: &str) -> String {
    marked("✗", Style::new().red(), msg)
}

pub fn warn(msg: &str) -> String {
    marked("⚠", Style::new().yellow(), msg)
}

/// Bold section title above tables.
pub fn header(msg: &str) -> String {
    Style::new().bold().apply_to(msg).to_string()
}

/// Secondary detail such as backup paths and tool output.
pub fn dim(msg: &str) -> String {
    Style::new().dim().apply_to(msg).to_string()
}

/// Short form of a revision for tables.
pub fn short_rev(rev: &str) -> String {
    rev.chars().take(10).collect()
}

/// Steadily ticking spinner with `msg`.
pub fn spinner(msg: impl Into<String>) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let template = ProgressStyle::with_template("{spinner:.blue} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(template.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    spinner.set_message(msg.into());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}
