use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

fn prefix() -> String {
    "[drctl]".bold().cyan().to_string()
}

/// Print an informational message: [drctl] message
pub fn info(msg: &str) {
    eprintln!("{} {}", prefix(), msg);
}

/// Print a success message in green.
pub fn success(msg: &str) {
    eprintln!("{} {}", prefix(), msg.green());
}

/// Print a warning message in yellow.
pub fn warn(msg: &str) {
    eprintln!("{} {}", prefix(), msg.yellow());
}

/// Ask before a destructive command. `assume_yes` skips the prompt; a
/// non-interactive terminal counts as "no".
pub fn confirm(msg: &str, assume_yes: bool) -> bool {
    if assume_yes {
        return true;
    }
    inquire::Confirm::new(msg)
        .with_default(false)
        .prompt()
        .unwrap_or(false)
}

/// Start a spinner on stderr for a long-running stage.
/// Call `.finish_and_clear()` when done.
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}
