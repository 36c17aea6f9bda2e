//! Structural overlap analysis between two normalized rules.
//!
//! `analyze(a, b)` decides whether every request matched by `b` is also
//! matched by `a` (`Superset`), the reverse (`Subset`), both (`Exact`), some
//! but not all (`Partial`), or nothing in common (`None`).
//!
//! Containment and intersection are computed over the effective segment
//! sequences (including implicit descendant coverage) with memoized dynamic
//! programming, so rules with several `**` stay polynomial.
//!
//! Two places are approximations rather than exact language operations:
//!
//! - Containment never proves `A ⊇ B` when `B` has a `**` at a position where
//!   `A` has a single-component element, even if later elements of `A` would
//!   absorb it. Such pairs are reported as `Partial`.
//! - Globs embedded in one component are compared by their literal prefix and
//!   suffix. This is exact for globs with a single `*`; with several wildcards
//!   intersection may be over-reported and containment under-reported. For
//!   example `a*b` against `*ab*` is reported as `Partial`.
//!
//! Both approximations err towards reporting an overlap, never towards hiding
//! one.
//!
//! Rules scoped to different tools never overlap, except that a bare
//! catch-all (`*`, `**`, `.*`) covers every tool.

use serde::{Deserialize, Serialize};
use tracing::{Level, instrument};

use super::normalize::{NormalizedRule, Segment, wildcard_matches};

/// The relationship between the request sets of two rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapType {
    /// Both rules match exactly the same requests.
    Exact,
    /// The first rule matches a strict subset of the second's requests.
    Subset,
    /// The first rule matches a strict superset of the second's requests.
    Superset,
    /// The rules share some requests but neither contains the other.
    Partial,
    /// The rules never match the same request.
    None,
}

impl OverlapType {
    pub fn is_overlapping(&self) -> bool {
        !matches!(self, OverlapType::None)
    }
}

/// Result of comparing two rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternOverlapAnalysis {
    pub overlap_type: OverlapType,
    /// Share of positionally matching literal segments (0-100). Used for
    /// ranking only.
    pub overlap_percentage: f64,
    pub conflicting_patterns: Vec<String>,
    pub suggestions: Vec<String>,
}

/// Compares rule `a` against rule `b`.
#[instrument(level = Level::TRACE, skip(a, b), fields(left = %a.pattern, right = %b.pattern))]
pub fn analyze(a: &NormalizedRule, b: &NormalizedRule) -> PatternOverlapAnalysis {
    let overlap_type = classify(a, b);

    let overlap_percentage = match overlap_type {
        OverlapType::Exact => 100.0,
        OverlapType::None => 0.0,
        _ => literal_overlap_percentage(&a.segments, &b.segments),
    };

    let a_text = a.original.trim().to_string();
    let b_text = b.original.trim().to_string();

    let suggestions = match overlap_type {
        OverlapType::Exact => vec![format!(
            "'{a_text}' and '{b_text}' match the same requests; keep only one of them"
        )],
        OverlapType::Superset => vec![format!("'{b_text}' is already covered by '{a_text}'")],
        OverlapType::Subset => vec![format!("'{a_text}' is already covered by '{b_text}'")],
        OverlapType::Partial => vec![format!(
            "'{a_text}' and '{b_text}' overlap on some requests; narrow one of them"
        )],
        OverlapType::None => Vec::new(),
    };

    let conflicting_patterns = if overlap_type.is_overlapping() {
        vec![a_text, b_text]
    } else {
        Vec::new()
    };

    PatternOverlapAnalysis {
        overlap_type,
        overlap_percentage,
        conflicting_patterns,
        suggestions,
    }
}

/// Classifies the overlap of `a` relative to `b` without building suggestions.
pub fn classify(a: &NormalizedRule, b: &NormalizedRule) -> OverlapType {
    // A bare catch-all matches every request, tool-scoped ones included.
    match (a.matches_everything(), b.matches_everything()) {
        (true, true) => return OverlapType::Exact,
        (true, false) => return OverlapType::Superset,
        (false, true) => return OverlapType::Subset,
        (false, false) if a.tool != b.tool => return OverlapType::None,
        (false, false) => {}
    }
    if a.segments == b.segments && a.covers_descendants == b.covers_descendants {
        return OverlapType::Exact;
    }

    let ea = a.effective_segments();
    let eb = b.effective_segments();

    match (contains(&ea, &eb), contains(&eb, &ea)) {
        (true, true) => OverlapType::Exact,
        (true, false) => OverlapType::Superset,
        (false, true) => OverlapType::Subset,
        (false, false) if intersects(&ea, &eb) => OverlapType::Partial,
        (false, false) => OverlapType::None,
    }
}

/// Percentage of positions holding equal literals, over the longer sequence.
fn literal_overlap_percentage(a: &[Segment], b: &[Segment]) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 100.0;
    }
    let matching = a
        .iter()
        .zip(b)
        .filter(|(x, y)| matches!((x, y), (Segment::Literal(l), Segment::Literal(m)) if l == m))
        .count();
    (matching as f64 / longest as f64) * 100.0
}

/// Memo table over `(i, j)` positions of two segment sequences.
struct Memo {
    width: usize,
    cells: Vec<Option<bool>>,
}

impl Memo {
    fn new(a: &[Segment], b: &[Segment]) -> Self {
        let width = b.len() + 1;
        Self {
            width,
            cells: vec![None; (a.len() + 1) * width],
        }
    }

    fn get(&self, i: usize, j: usize) -> Option<bool> {
        self.cells[i * self.width + j]
    }

    fn set(&mut self, i: usize, j: usize, value: bool) -> bool {
        self.cells[i * self.width + j] = Some(value);
        value
    }
}

/// Returns true if every sequence matched by `b` is matched by `a`.
pub fn contains(a: &[Segment], b: &[Segment]) -> bool {
    let mut memo = Memo::new(a, b);
    contains_from(a, b, 0, 0, &mut memo)
}

fn contains_from(a: &[Segment], b: &[Segment], i: usize, j: usize, memo: &mut Memo) -> bool {
    if let Some(cached) = memo.get(i, j) {
        return cached;
    }

    let result = if i == a.len() {
        j == b.len()
    } else if a[i] == Segment::DoubleStar {
        // `**` in A absorbs zero elements of B, or one more element of B.
        contains_from(a, b, i + 1, j, memo) || (j < b.len() && contains_from(a, b, i, j + 1, memo))
    } else if j == b.len() || b[j] == Segment::DoubleStar {
        false
    } else {
        segment_contains(&a[i], &b[j]) && contains_from(a, b, i + 1, j + 1, memo)
    };

    memo.set(i, j, result)
}

/// Returns true if some sequence is matched by both `a` and `b`.
pub fn intersects(a: &[Segment], b: &[Segment]) -> bool {
    let mut memo = Memo::new(a, b);
    intersects_from(a, b, 0, 0, &mut memo)
}

fn intersects_from(a: &[Segment], b: &[Segment], i: usize, j: usize, memo: &mut Memo) -> bool {
    if let Some(cached) = memo.get(i, j) {
        return cached;
    }

    let a_rest = i < a.len();
    let b_rest = j < b.len();

    let result = if !a_rest && !b_rest {
        true
    } else if a_rest && a[i] == Segment::DoubleStar {
        intersects_from(a, b, i + 1, j, memo) || (b_rest && intersects_from(a, b, i, j + 1, memo))
    } else if b_rest && b[j] == Segment::DoubleStar {
        intersects_from(a, b, i, j + 1, memo) || (a_rest && intersects_from(a, b, i + 1, j, memo))
    } else if !a_rest || !b_rest {
        false
    } else {
        segment_intersects(&a[i], &b[j]) && intersects_from(a, b, i + 1, j + 1, memo)
    };

    memo.set(i, j, result)
}

/// Single-component containment: does `x` match every component `y` matches?
fn segment_contains(x: &Segment, y: &Segment) -> bool {
    match (x, y) {
        (Segment::Star | Segment::DoubleStar, _) => true,
        (Segment::Literal(l), Segment::Literal(m)) => l == m,
        (Segment::Literal(_), _) => false,
        (Segment::Glob(g), Segment::Literal(m)) => wildcard_matches(g, m),
        (Segment::Glob(g), Segment::Glob(h)) => glob_contains(g, h),
        (Segment::Glob(g), Segment::Star | Segment::DoubleStar) => g.chars().all(|c| c == '*'),
    }
}

/// Single-component intersection.
fn segment_intersects(x: &Segment, y: &Segment) -> bool {
    match (x, y) {
        (Segment::Star | Segment::DoubleStar, _) | (_, Segment::Star | Segment::DoubleStar) => {
            true
        }
        (Segment::Literal(l), Segment::Literal(m)) => l == m,
        (Segment::Literal(l), Segment::Glob(g)) | (Segment::Glob(g), Segment::Literal(l)) => {
            wildcard_matches(g, l)
        }
        (Segment::Glob(g), Segment::Glob(h)) => globs_may_intersect(g, h),
    }
}

fn is_glob_wildcard(c: char) -> bool {
    c == '*' || c == '?'
}

/// Literal text before the first wildcard.
fn literal_prefix(glob: &str) -> &str {
    glob.find(is_glob_wildcard).map_or(glob, |p| &glob[..p])
}

/// Literal text after the last wildcard.
fn literal_suffix(glob: &str) -> &str {
    glob.rfind(is_glob_wildcard)
        .map_or(glob, |p| &glob[p + 1..])
}

/// Minimum length of a string the glob can match.
fn min_match_len(glob: &str) -> usize {
    glob.chars().filter(|&c| c != '*').count()
}

/// Does glob `g` match every string glob `h` matches? Exact when `g` has a
/// single `*` and no `?`; otherwise only identical globs are proven.
fn glob_contains(g: &str, h: &str) -> bool {
    if g == h {
        return true;
    }
    if g.matches('*').count() != 1 || g.contains('?') {
        return false;
    }
    let (prefix, suffix) = (literal_prefix(g), literal_suffix(g));
    literal_prefix(h).starts_with(prefix)
        && literal_suffix(h).ends_with(suffix)
        && min_match_len(h) >= prefix.len() + suffix.len()
}

/// Could globs `g` and `h` match a common string? Compatible literal prefixes
/// and suffixes are necessary; for single-`*` globs they are also sufficient.
fn globs_may_intersect(g: &str, h: &str) -> bool {
    let (gp, hp) = (literal_prefix(g), literal_prefix(h));
    let (gs, hs) = (literal_suffix(g), literal_suffix(h));
    let prefixes_compatible = gp.starts_with(hp) || hp.starts_with(gp);
    let suffixes_compatible = gs.ends_with(hs) || hs.ends_with(gs);
    prefixes_compatible && suffixes_compatible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::normalize::normalize;
    use crate::types::RuleCategory;

    fn rule(raw: &str) -> NormalizedRule {
        normalize(RuleCategory::Deny, 0, raw).unwrap()
    }

    fn overlap(a: &str, b: &str) -> OverlapType {
        analyze(&rule(a), &rule(b)).overlap_type
    }

    #[test]
    fn identical_patterns_are_exact() {
        assert_eq!(overlap("exec", "exec"), OverlapType::Exact);
        assert_eq!(overlap("src/**", "src/**/**"), OverlapType::Exact);
    }

    #[test]
    fn single_star_covers_descendants() {
        assert_eq!(overlap("admin/*", "admin/users/read"), OverlapType::Superset);
        assert_eq!(overlap("admin/users/read", "admin/*"), OverlapType::Subset);
    }

    #[test]
    fn double_star_is_broader_than_star() {
        // `a/**` also matches `a` itself.
        assert_eq!(overlap("a/**", "a/*"), OverlapType::Superset);
        assert_eq!(overlap("a/*", "a/**"), OverlapType::Subset);
    }

    #[test]
    fn literal_directory_covers_children() {
        assert_eq!(overlap("secrets", "secrets/key.pem"), OverlapType::Superset);
    }

    #[test]
    fn disjoint_extensions() {
        assert_eq!(overlap("*.exe", "*.js"), OverlapType::None);
        assert_eq!(overlap("src/*.rs", "docs/*.rs"), OverlapType::None);
    }

    #[test]
    fn glob_contains_literal() {
        assert_eq!(overlap("*.js", "app.js"), OverlapType::Superset);
        assert_eq!(overlap("src/*.js", "src/lib/app.js"), OverlapType::None);
        assert_eq!(overlap("src/**/*.js", "src/lib/app.js"), OverlapType::Superset);
    }

    #[test]
    fn glob_contains_narrower_glob() {
        assert_eq!(overlap("*.js", "app*.js"), OverlapType::Superset);
        assert_eq!(overlap("app*.js", "*.js"), OverlapType::Subset);
    }

    #[test]
    fn non_aligned_globs_are_partial() {
        assert_eq!(overlap("a*b", "*ab*"), OverlapType::Partial);
        assert_eq!(overlap("src/*.js", "src/app.*"), OverlapType::Partial);
    }

    #[test]
    fn different_tools_never_overlap() {
        assert_eq!(overlap("Read(.env)", "Edit(.env)"), OverlapType::None);
        assert_eq!(overlap("Read(.env)", ".env"), OverlapType::None);
    }

    #[test]
    fn bare_catch_all_covers_every_tool() {
        assert_eq!(overlap("**", "Bash(rm -rf /)"), OverlapType::Superset);
        assert_eq!(overlap("*", "Read(.env)"), OverlapType::Superset);
        assert_eq!(overlap(".*", "Edit"), OverlapType::Superset);
        assert_eq!(overlap("Bash(rm:*)", "**"), OverlapType::Subset);
        assert_eq!(overlap(".*", "a*/b"), OverlapType::Superset);
        assert_eq!(overlap("*", "**"), OverlapType::Exact);
        // Only a bare rule is a catch-all.
        assert_eq!(overlap("*/*", "Read(.env)"), OverlapType::None);
        assert_eq!(overlap("Read(**)", "Edit(.env)"), OverlapType::None);
    }

    #[test]
    fn tool_only_contains_scoped() {
        assert_eq!(overlap("Bash", "Bash(rm:*)"), OverlapType::Superset);
        assert_eq!(overlap("Bash(git:*)", "Bash(git push origin)"), OverlapType::Superset);
        assert_eq!(overlap("Bash(git:*)", "Bash(npm:*)"), OverlapType::None);
    }

    #[test]
    fn percentage_counts_literals_over_longer_pattern() {
        let analysis = analyze(&rule("src/*.js"), &rule("src/app.*"));
        assert_eq!(analysis.overlap_percentage, 50.0);
        assert_eq!(
            analysis.conflicting_patterns,
            vec!["src/*.js".to_string(), "src/app.*".to_string()]
        );
        assert_eq!(analysis.suggestions.len(), 1);
    }

    #[test]
    fn no_overlap_has_no_suggestions() {
        let analysis = analyze(&rule("*.exe"), &rule("*.js"));
        assert_eq!(analysis.overlap_percentage, 0.0);
        assert!(analysis.conflicting_patterns.is_empty());
        assert!(analysis.suggestions.is_empty());
    }

    #[test]
    fn contains_and_intersects_primitives() {
        let any = vec![Segment::DoubleStar];
        let lit = vec![Segment::Literal("x".into())];
        assert!(contains(&any, &lit));
        assert!(!contains(&lit, &any));
        assert!(intersects(&lit, &any));
        assert!(intersects(&any, &any));
        assert!(!intersects(&lit, &[Segment::Literal("y".into())]));
    }
}
