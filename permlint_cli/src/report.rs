//! Human-readable rendering of validation results and statistics.

use std::fmt::Write;
use std::path::Path;

use permlint::rules::RuleConflict;
use permlint::{RuleCategory, RuleStatistics, ValidationResult};

use crate::style;

pub fn render_result(path: &Path, result: &ValidationResult) -> String {
    let mut out = String::new();
    let name = path.display().to_string();

    let (mark, verdict) = if result.is_valid {
        (style::green_bold("✓"), "valid".to_string())
    } else {
        (style::red_bold("✗"), style::red_bold("invalid"))
    };
    let _ = writeln!(
        out,
        "{mark} {}: {verdict} ({} errors, {} warnings, {} conflicts)",
        style::bold(&name),
        result.errors.len(),
        result.warnings.len(),
        result.conflicts.len()
    );

    for error in &result.errors {
        let _ = writeln!(
            out,
            "  {} {} {}",
            style::impact(error.severity),
            style::red("error"),
            error
        );
    }

    for conflict in &result.conflicts {
        render_conflict(&mut out, conflict);
    }

    for warning in &result.warnings {
        let location = warning
            .location
            .map(|l| format!(" at {l}"))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  {:<8} {} {}{location}: {}",
            "",
            style::yellow("warning"),
            warning.kind,
            warning.message
        );
    }

    if !result.suggestions.is_empty() {
        let _ = writeln!(out, "  {}", style::cyan("suggestions:"));
        for suggestion in &result.suggestions {
            let _ = writeln!(out, "    - {suggestion}");
        }
    }

    let cached = if result.performance.from_cache {
        ", cached"
    } else {
        ""
    };
    let _ = writeln!(
        out,
        "  {}",
        style::dim(&format!(
            "{} rules in {:.2} ms{cached}",
            result.performance.rules_processed, result.performance.validation_time
        ))
    );
    out
}

fn render_conflict(out: &mut String, conflict: &RuleConflict) {
    let rules = conflict
        .conflicting_rules
        .iter()
        .map(|r| format!("{} '{}'", r.location, r.pattern))
        .collect::<Vec<_>>()
        .join(" vs ");
    let _ = writeln!(
        out,
        "  {} {} {}",
        style::impact(conflict.security_impact),
        style::bold(conflict.conflict_type.name()),
        rules
    );
    let _ = writeln!(out, "  {:<8} {}", "", style::dim(&conflict.message));
}

pub fn render_statistics(path: &Path, stats: &RuleStatistics) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", style::header(&path.display().to_string()));
    let _ = writeln!(out, "  {} {}", style::bold("rules:"), stats.total_rules);
    for category in RuleCategory::ALL {
        let _ = writeln!(
            out,
            "    {:<14} {}",
            style::category(category.name()),
            stats.by_category.get(category)
        );
    }

    let complexity = &stats.complexity;
    let _ = writeln!(
        out,
        "  {} {} literal, {} glob, {} regex-like (avg length {:.1})",
        style::bold("patterns:"),
        complexity.literal_count,
        complexity.glob_count,
        complexity.regex_count,
        complexity.average_pattern_length
    );

    let coverage = &stats.coverage;
    let _ = writeln!(
        out,
        "  {} {:.0}% wildcard, {} bare",
        style::bold("coverage:"),
        coverage.wildcard_ratio * 100.0,
        coverage.bare_rules
    );
    for (tool, count) in &coverage.per_tool {
        let _ = writeln!(out, "    {:<14} {count}", style::cyan(tool));
    }
    out
}
