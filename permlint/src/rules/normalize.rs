//! Parsing raw rule strings into a canonical segment form.
//!
//! Two syntaxes are accepted:
//!
//! - Bare glob patterns: `admin/*`, `**/*.rs`, `exec`.
//! - Tool-scoped rules: `Edit`, `Read(.env)`, `Read(src/**)`, `Bash(git:*)`.
//!
//! Bare patterns and tool-scoped inner patterns are split on `/`, except for
//! `Bash` whose inner pattern is a command line split on whitespace. A
//! `prefix:*` suffix is read as "the prefix, optionally followed by anything".
//!
//! A pattern that matches a path also covers everything below it, the same way
//! denying a directory denies its contents. Unless the pattern already ends in
//! `**`, that implicit descendant coverage is recorded in
//! [`NormalizedRule::covers_descendants`].
//!
//! ```rust
//! use permlint::rules::normalize::{normalize, Segment};
//! use permlint::RuleCategory;
//!
//! let rule = normalize(RuleCategory::Allow, 0, "Bash(git:*)").unwrap();
//! assert_eq!(rule.tool.as_deref(), Some("Bash"));
//! assert_eq!(rule.segments, vec![Segment::Literal("git".into()), Segment::DoubleStar]);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Level, instrument};

use crate::types::{RuleCategory, RuleLocation};

/// Tool whose inner patterns are command lines rather than paths.
const COMMAND_TOOL: &str = "Bash";

/// Characters that make a rule look like a regular expression.
const REGEX_MARKERS: &[char] = &['\\', '^', '$', '(', '|', '['];

/// One element of a normalized pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum Segment {
    /// A literal path component or command word.
    Literal(String),
    /// A single component containing embedded wildcards (`*.js`, `v?`).
    Glob(String),
    /// `*`: exactly one component.
    Star,
    /// `**`: zero or more components.
    DoubleStar,
}

impl Segment {
    fn parse(piece: &str) -> Self {
        match piece {
            "**" => Segment::DoubleStar,
            "*" => Segment::Star,
            p if p.contains('*') || p.contains('?') => Segment::Glob(p.to_string()),
            p => Segment::Literal(p.to_string()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        !matches!(self, Segment::Literal(_))
    }

    /// Returns true if this segment matches the concrete component `text`.
    pub fn matches_component(&self, text: &str) -> bool {
        match self {
            Segment::Literal(l) => l == text,
            Segment::Glob(g) => wildcard_matches(g, text),
            Segment::Star | Segment::DoubleStar => true,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Literal(s) | Segment::Glob(s) => f.write_str(s),
            Segment::Star => f.write_str("*"),
            Segment::DoubleStar => f.write_str("**"),
        }
    }
}

/// How the raw rule was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleForm {
    /// A plain glob pattern with no tool scope.
    Bare,
    /// A tool name alone (`Edit`): every use of the tool.
    ToolOnly,
    /// `Tool(pattern)`.
    Scoped,
    /// `Tool(prefix:*)`.
    Prefix,
}

/// A rule parsed into its canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedRule {
    pub category: RuleCategory,
    /// Position of the rule inside its category list.
    pub index: usize,
    /// Canonical rendering of the segments.
    pub pattern: String,
    /// Tool scope, if the rule used `Tool(...)` syntax.
    pub tool: Option<String>,
    pub segments: Vec<Segment>,
    /// The rule as written (untrimmed).
    pub original: String,
    pub form: RuleForm,
    /// The pattern also matches everything below what it names.
    pub covers_descendants: bool,
    /// Looked like `Tool(...)` but was not well formed; parsed as bare.
    pub malformed: bool,
}

impl NormalizedRule {
    pub fn location(&self) -> RuleLocation {
        RuleLocation::new(self.category, self.index)
    }

    /// Segments including the implicit trailing `**` for descendant coverage.
    pub fn effective_segments(&self) -> Vec<Segment> {
        let mut segments = self.segments.clone();
        if self.covers_descendants {
            segments.push(Segment::DoubleStar);
        }
        segments
    }

    /// The inner pattern text (without any `Tool(...)` wrapper).
    pub fn inner(&self) -> &str {
        let trimmed = self.original.trim();
        match self.form {
            RuleForm::Bare => trimmed,
            RuleForm::ToolOnly => "",
            RuleForm::Scoped | RuleForm::Prefix => trimmed
                .find('(')
                .map(|p| &trimmed[p + 1..trimmed.len() - 1])
                .unwrap_or(trimmed),
        }
    }

    /// True for a bare rule that matches every request of every tool:
    /// `*`, `**` or the regex `.*`.
    pub fn matches_everything(&self) -> bool {
        if self.tool.is_some() {
            return false;
        }
        self.inner() == ".*" || matches!(self.segments.as_slice(), [Segment::Star] | [Segment::DoubleStar])
    }

    /// Number of wildcard segments (explicit only).
    pub fn wildcard_count(&self) -> usize {
        self.segments.iter().filter(|s| s.is_wildcard()).count()
    }

    pub fn has_wildcards(&self) -> bool {
        self.form == RuleForm::Prefix || self.segments.iter().any(Segment::is_wildcard)
    }

    /// Returns true if the inner pattern contains regex-only syntax.
    pub fn is_regex_like(&self) -> bool {
        is_regex_like(self.inner())
    }

    /// Checks a concrete request against this rule.
    ///
    /// `tool` must equal the rule's tool scope (or both be absent); `arg` is the
    /// path or command line.
    pub fn matches(&self, tool: Option<&str>, arg: &str) -> bool {
        if self.matches_everything() {
            return true;
        }
        if self.tool.as_deref() != tool {
            return false;
        }
        let components = split_components(self.tool.as_deref(), arg);
        let refs: Vec<&str> = components.iter().map(String::as_str).collect();
        sequence_matches(&self.effective_segments(), &refs)
    }
}

/// A rule that could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("empty rule at {0}")]
    Empty(RuleLocation),
}

/// Normalizes a raw rule string.
///
/// Fails only for empty or whitespace-only input.
#[instrument(level = Level::TRACE)]
pub fn normalize(
    category: RuleCategory,
    index: usize,
    raw: &str,
) -> Result<NormalizedRule, NormalizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty(RuleLocation::new(category, index)));
    }

    let (tool, inner, form, malformed) = split_tool(trimmed);
    let mut segments = Vec::new();

    let body = match form {
        RuleForm::Prefix => inner.strip_suffix(":*").unwrap_or(inner),
        _ => inner,
    };
    for piece in split_components(tool, body) {
        let segment = Segment::parse(&piece);
        // Adjacent `**` are equivalent to one.
        if segment == Segment::DoubleStar && segments.last() == Some(&Segment::DoubleStar) {
            continue;
        }
        segments.push(segment);
    }
    if form == RuleForm::Prefix && segments.last() != Some(&Segment::DoubleStar) {
        segments.push(Segment::DoubleStar);
    }

    let covers_descendants = segments.last() != Some(&Segment::DoubleStar);
    let pattern = render(tool, &segments);

    Ok(NormalizedRule {
        category,
        index,
        pattern,
        tool: tool.map(str::to_string),
        segments,
        original: raw.to_string(),
        form,
        covers_descendants,
        malformed,
    })
}

/// Splits `Tool(inner)` syntax. Returns `(tool, inner, form, malformed)`.
fn split_tool(s: &str) -> (Option<&str>, &str, RuleForm, bool) {
    if let Some(paren) = s.find('(') {
        let name = &s[..paren];
        if !is_tool_name(name) {
            return (None, s, RuleForm::Bare, false);
        }
        if !s.ends_with(')') {
            return (None, s, RuleForm::Bare, true);
        }
        let inner = s[paren + 1..s.len() - 1].trim();
        if inner.is_empty() {
            return (Some(name), "", RuleForm::ToolOnly, false);
        }
        let form = if inner.ends_with(":*") {
            RuleForm::Prefix
        } else {
            RuleForm::Scoped
        };
        return (Some(name), inner, form, false);
    }

    if is_tool_name(s) {
        (Some(s), "", RuleForm::ToolOnly, false)
    } else {
        (None, s, RuleForm::Bare, false)
    }
}

/// Tool names are identifiers that start with an uppercase letter (`Read`,
/// `WebFetch`) or use the MCP naming scheme (`mcp__server__tool`).
fn is_tool_name(s: &str) -> bool {
    let identifier = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    identifier && (s.starts_with(|c: char| c.is_ascii_uppercase()) || s.starts_with("mcp__"))
}

/// Splits a pattern body or a concrete argument into components.
fn split_components(tool: Option<&str>, body: &str) -> Vec<String> {
    if tool == Some(COMMAND_TOOL) {
        body.split_whitespace().map(str::to_string).collect()
    } else {
        body.split('/')
            .filter(|p| !p.is_empty() && *p != ".")
            .map(str::to_string)
            .collect()
    }
}

fn render(tool: Option<&str>, segments: &[Segment]) -> String {
    let sep = if tool == Some(COMMAND_TOOL) { " " } else { "/" };
    let body = segments
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(sep);
    match tool {
        Some(t) if body.is_empty() => t.to_string(),
        Some(t) => format!("{t}({body})"),
        None => body,
    }
}

/// Returns true if `s` contains characters only meaningful in a regex.
pub fn is_regex_like(s: &str) -> bool {
    s.contains(REGEX_MARKERS)
}

/// Matches `text` against a wildcard pattern where `*` matches any run of
/// characters and `?` matches one character.
///
/// Runs in `O(pattern × text)` without allocating a matcher per call.
pub fn wildcard_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    // Last `*` seen and the text position it currently absorbs up to.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p).copied() {
            Some('*') => {
                star = Some((p, t));
                p += 1;
            }
            Some(c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match star {
                Some((star_p, star_t)) => {
                    star = Some((star_p, star_t + 1));
                    p = star_p + 1;
                    t = star_t + 1;
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

/// Matches concrete components against a segment sequence.
fn sequence_matches(segments: &[Segment], components: &[&str]) -> bool {
    match segments.split_first() {
        None => components.is_empty(),
        Some((Segment::DoubleStar, rest)) => {
            (0..=components.len()).any(|skip| sequence_matches(rest, &components[skip..]))
        }
        Some((segment, rest)) => match components.split_first() {
            Some((first, others)) => {
                segment.matches_component(first) && sequence_matches(rest, others)
            }
            None => false,
        },
    }
}
