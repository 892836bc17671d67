//! Consistent colored terminal output for the mdflow CLI.
//!
//! All user-facing output goes through these helpers so colors are uniform.
//! Colors are automatically disabled when stderr is not a TTY.

use colored::Colorize;

/// Format a header line: "=== Title ==="
pub fn header(title: &str) -> String {
    format!("=== {} ===", title.bold())
}

/// A successful step: "✓ message"
pub fn success(message: &str) -> String {
    format!("{} {}", "✓".green().bold(), message)
}

/// A warning line: "⚠ message"
pub fn warn(message: &str) -> String {
    format!("{} {}", "⚠".yellow().bold(), message)
}

/// The single top-level failure line.
pub fn failure(message: &str) -> String {
    format!("{} {}", "Agent failed:".red().bold(), message)
}

/// A dimmed hint line.
pub fn hint(message: &str) -> String {
    format!("  {}", message.dimmed())
}

/// A dimmed key: value detail line.
pub fn detail(key: &str, value: &str) -> String {
    format!("  {} {}", format!("{key}:").bold(), value)
}
