//! TTY-aware color and styling helpers for terminal output.
//!
//! Built on the [`console`] crate which automatically detects whether
//! stdout/stderr is a terminal and respects the `NO_COLOR` environment
//! variable (<https://no-color.org/>).

use console::Style;
use permlint::SecurityImpact;

fn out() -> Style {
    Style::new()
}

fn err() -> Style {
    Style::new().for_stderr()
}

// ---------------------------------------------------------------------------
// Stdout
// ---------------------------------------------------------------------------

pub fn bold(text: &str) -> String {
    out().bold().apply_to(text).to_string()
}

pub fn dim(text: &str) -> String {
    out().dim().apply_to(text).to_string()
}

/// Bold cyan – section headers.
pub fn header(text: &str) -> String {
    out().cyan().bold().apply_to(text).to_string()
}

pub fn green_bold(text: &str) -> String {
    out().green().bold().apply_to(text).to_string()
}

pub fn red(text: &str) -> String {
    out().red().apply_to(text).to_string()
}

pub fn red_bold(text: &str) -> String {
    out().red().bold().apply_to(text).to_string()
}

pub fn yellow(text: &str) -> String {
    out().yellow().apply_to(text).to_string()
}

pub fn cyan(text: &str) -> String {
    out().cyan().apply_to(text).to_string()
}

// ---------------------------------------------------------------------------
// Stderr
// ---------------------------------------------------------------------------

pub fn err_red_bold(text: &str) -> String {
    err().red().bold().apply_to(text).to_string()
}

pub fn err_dim(text: &str) -> String {
    err().dim().apply_to(text).to_string()
}

/// Bold cyan on stderr (hints).
pub fn err_cyan_bold(text: &str) -> String {
    err().cyan().bold().apply_to(text).to_string()
}

// ---------------------------------------------------------------------------
// Semantic
// ---------------------------------------------------------------------------

/// Colorize a severity label, padded to a fixed width.
pub fn impact(impact: SecurityImpact) -> String {
    let label = format!("{:<8}", impact.name());
    match impact {
        SecurityImpact::Critical => red_bold(&label),
        SecurityImpact::High => red(&label),
        SecurityImpact::Medium => yellow(&label),
        SecurityImpact::Low => dim(&label),
    }
}

/// Colorize a rule category (deny/ask/allow).
pub fn category(category: &str) -> String {
    match category {
        "allow" => out().green().apply_to(category).to_string(),
        "deny" => red(category),
        "ask" => yellow(category),
        _ => category.to_string(),
    }
}
