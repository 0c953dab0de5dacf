//! Subcommand implementations.

pub mod add;
pub mod backups;
pub mod init;
pub mod stale;
pub mod sync;

use depsync_core::ActionResult;

use crate::style;

/// Build tool output lines shown under a failure.
const LOG_TAIL: usize = 15;

/// Print an action result the same way for every command.
pub(crate) fn print_result(result: &ActionResult) {
    if result.ok {
        println!("{}", style::success(&result.message));
    } else {
        println!("{}", style::error(&result.message));
        if let Some(error_text) = &result.error_text {
            println!("    {}", style::dim(error_text));
        }
        let tail = result.logs.len().saturating_sub(LOG_TAIL);
        for line in &result.logs[tail..] {
            println!("    {}", style::dim(line));
        }
    }
}
