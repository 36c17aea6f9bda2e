//! Precedence-aware conflict detection.
//!
//! Precedence is `deny > ask > allow`. Every pair of rules is compared, one
//! category pair at a time:
//!
//! | pair          | finding                                   | impact            |
//! |---------------|-------------------------------------------|-------------------|
//! | same text     | `CONTRADICTORY_RULES`                     | critical          |
//! | deny ⊇ allow  | `ALLOW_OVERRIDES_DENY`                    | critical          |
//! | allow ⊋ deny  | `ALLOW_OVERRIDES_DENY`                    | high              |
//! | deny ∩ allow  | `ALLOW_OVERRIDES_DENY`                    | high (or medium)  |
//! | allow ⊇ ask   | `PRECEDENCE_AMBIGUITY`                    | medium            |
//! | deny ⊇ ask    | `PRECEDENCE_AMBIGUITY`                    | low               |
//! | same category | `OVERLAPPING_PATTERNS`                    | low               |
//!
//! Partial deny/allow overlaps drop to `medium` only when strict zero-bypass
//! mode is off and the overlap percentage is below the configured threshold.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{Level, debug, instrument};

use super::RuleSet;
use super::normalize::NormalizedRule;
use super::overlap::{OverlapType, analyze, classify};
use crate::types::{RuleCategory, RuleLocation};

/// Kind of conflict between rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictType {
    /// An allow rule matches requests a deny rule forbids.
    AllowOverridesDeny,
    /// Two rules in the same category overlap (redundancy).
    OverlappingPatterns,
    /// The same rule text appears in two categories.
    ContradictoryRules,
    /// A rule can never take effect because of precedence.
    PrecedenceAmbiguity,
}

impl ConflictType {
    pub fn name(&self) -> &'static str {
        match self {
            ConflictType::AllowOverridesDeny => "ALLOW_OVERRIDES_DENY",
            ConflictType::OverlappingPatterns => "OVERLAPPING_PATTERNS",
            ConflictType::ContradictoryRules => "CONTRADICTORY_RULES",
            ConflictType::PrecedenceAmbiguity => "PRECEDENCE_AMBIGUITY",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Severity of a conflict. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityImpact {
    Low,
    Medium,
    High,
    Critical,
}

impl SecurityImpact {
    /// Conflicts at `High` or above make a configuration invalid.
    pub fn is_blocking(&self) -> bool {
        *self >= SecurityImpact::High
    }

    pub fn name(&self) -> &'static str {
        match self {
            SecurityImpact::Low => "low",
            SecurityImpact::Medium => "medium",
            SecurityImpact::High => "high",
            SecurityImpact::Critical => "critical",
        }
    }
}

impl fmt::Display for SecurityImpact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Suggested way to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    RemoveAllowRule,
    NarrowAllowRule,
    RemoveNarrowerRule,
    RemoveAskRule,
    RemoveDuplicate,
    ManualReview,
}

/// A rule taking part in a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictingRule {
    pub category: RuleCategory,
    pub pattern: String,
    pub location: RuleLocation,
}

impl From<&NormalizedRule> for ConflictingRule {
    fn from(rule: &NormalizedRule) -> Self {
        Self {
            category: rule.category,
            pattern: rule.original.trim().to_string(),
            location: rule.location(),
        }
    }
}

/// A conflict found between two rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConflict {
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub conflicting_rules: Vec<ConflictingRule>,
    pub resolution: ResolutionStrategy,
    pub security_impact: SecurityImpact,
    pub message: String,
    /// Overlap percentage between the rules (ranking only).
    pub overlap_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Conflict detection ran past its deadline.
#[derive(Debug, Clone, Error)]
#[error("conflict detection exceeded its deadline after {pairs_checked} comparisons")]
pub struct DeadlineExceeded {
    pub pairs_checked: usize,
    /// Conflicts found before the deadline.
    pub partial: Vec<RuleConflict>,
}

/// Category pairs in the order they are checked.
const CATEGORY_PAIRS: [(RuleCategory, RuleCategory); 6] = [
    (RuleCategory::Deny, RuleCategory::Allow),
    (RuleCategory::Allow, RuleCategory::Ask),
    (RuleCategory::Deny, RuleCategory::Ask),
    (RuleCategory::Deny, RuleCategory::Deny),
    (RuleCategory::Allow, RuleCategory::Allow),
    (RuleCategory::Ask, RuleCategory::Ask),
];

/// Pairwise conflict detector.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDetector {
    partial_overlap_threshold: f64,
    strict_zero_bypass: bool,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self {
            partial_overlap_threshold: 30.0,
            strict_zero_bypass: true,
        }
    }
}

impl ConflictDetector {
    pub fn new(partial_overlap_threshold: f64, strict_zero_bypass: bool) -> Self {
        Self {
            partial_overlap_threshold,
            strict_zero_bypass,
        }
    }

    /// Detects all conflicts in a rule set.
    pub fn detect(&self, rules: &RuleSet) -> Vec<RuleConflict> {
        match self.detect_until(rules, None) {
            Ok(conflicts) => conflicts,
            Err(exceeded) => exceeded.partial,
        }
    }

    /// Detects conflicts, giving up once `deadline` has passed.
    ///
    /// The deadline is checked between rows of each category pair, so a
    /// single row of comparisons always completes.
    #[instrument(level = Level::TRACE, skip(self, rules), fields(rules = rules.len()))]
    pub fn detect_until(
        &self,
        rules: &RuleSet,
        deadline: Option<Instant>,
    ) -> Result<Vec<RuleConflict>, DeadlineExceeded> {
        let mut conflicts = Vec::new();
        let mut pairs_checked = 0;

        for (left_category, right_category) in CATEGORY_PAIRS {
            let left = rules.get(left_category);
            let right = rules.get(right_category);
            let same = left_category == right_category;

            for (i, a) in left.iter().enumerate() {
                if let Some(deadline) = deadline
                    && Instant::now() >= deadline
                {
                    conflicts.sort_by(conflict_order);
                    return Err(DeadlineExceeded {
                        pairs_checked,
                        partial: conflicts,
                    });
                }

                let others = if same { &right[i + 1..] } else { right };
                for b in others {
                    pairs_checked += 1;
                    let found = if same {
                        self.check_same_category(a, b)
                    } else {
                        self.check_cross_category(a, b)
                    };
                    if let Some(conflict) = found {
                        debug!(
                            conflict = %conflict.conflict_type,
                            impact = %conflict.security_impact,
                            left = %a.original,
                            right = %b.original,
                            "rule conflict"
                        );
                        conflicts.push(conflict);
                    }
                }
            }
        }

        conflicts.sort_by(conflict_order);
        Ok(conflicts)
    }

    fn check_cross_category(&self, a: &NormalizedRule, b: &NormalizedRule) -> Option<RuleConflict> {
        if a.original.trim() == b.original.trim() {
            return Some(contradictory(a, b));
        }

        match (a.category, b.category) {
            (RuleCategory::Deny, RuleCategory::Allow) => self.check_deny_allow(a, b),
            (RuleCategory::Allow, RuleCategory::Ask) => check_allow_ask(a, b),
            (RuleCategory::Deny, RuleCategory::Ask) => check_deny_ask(a, b),
            _ => None,
        }
    }

    fn check_deny_allow(&self, deny: &NormalizedRule, allow: &NormalizedRule) -> Option<RuleConflict> {
        let analysis = analyze(deny, allow);
        let deny_text = deny.original.trim();
        let allow_text = allow.original.trim();

        let (impact, resolution, message) = match analysis.overlap_type {
            OverlapType::None => return None,
            OverlapType::Exact => (
                SecurityImpact::Critical,
                ResolutionStrategy::RemoveAllowRule,
                format!("allow rule '{allow_text}' matches exactly the requests denied by '{deny_text}'"),
            ),
            OverlapType::Superset => (
                SecurityImpact::Critical,
                ResolutionStrategy::RemoveAllowRule,
                format!("allow rule '{allow_text}' only matches requests denied by '{deny_text}'"),
            ),
            OverlapType::Subset => (
                SecurityImpact::High,
                ResolutionStrategy::NarrowAllowRule,
                format!("allow rule '{allow_text}' is broader than deny rule '{deny_text}' and covers everything it denies"),
            ),
            OverlapType::Partial => {
                let significant = analysis.overlap_percentage >= self.partial_overlap_threshold;
                let impact = if significant || self.strict_zero_bypass {
                    SecurityImpact::High
                } else {
                    SecurityImpact::Medium
                };
                (
                    impact,
                    ResolutionStrategy::ManualReview,
                    format!(
                        "allow rule '{allow_text}' partially overlaps deny rule '{deny_text}' ({:.0}% overlap)",
                        analysis.overlap_percentage
                    ),
                )
            }
        };

        Some(RuleConflict {
            conflict_type: ConflictType::AllowOverridesDeny,
            conflicting_rules: vec![deny.into(), allow.into()],
            resolution,
            security_impact: impact,
            message,
            overlap_percentage: analysis.overlap_percentage,
            suggestion: analysis.suggestions.into_iter().next(),
        })
    }

    fn check_same_category(&self, a: &NormalizedRule, b: &NormalizedRule) -> Option<RuleConflict> {
        // Duplicates are reported by rule-level validation.
        if a.original.trim() == b.original.trim() {
            return None;
        }

        let (narrower, broader) = match classify(a, b) {
            OverlapType::Superset => (b, a),
            OverlapType::Subset | OverlapType::Exact => (a, b),
            OverlapType::Partial | OverlapType::None => return None,
        };
        let narrower_text = narrower.original.trim();
        let broader_text = broader.original.trim();

        Some(RuleConflict {
            conflict_type: ConflictType::OverlappingPatterns,
            conflicting_rules: vec![a.into(), b.into()],
            resolution: ResolutionStrategy::RemoveNarrowerRule,
            security_impact: SecurityImpact::Low,
            message: format!(
                "{} rule '{narrower_text}' is redundant: '{broader_text}' already covers it",
                a.category
            ),
            overlap_percentage: 100.0,
            suggestion: Some(format!(
                "remove '{narrower_text}' (subsumed by '{broader_text}')"
            )),
        })
    }
}

fn contradictory(a: &NormalizedRule, b: &NormalizedRule) -> RuleConflict {
    let text = a.original.trim();
    RuleConflict {
        conflict_type: ConflictType::ContradictoryRules,
        conflicting_rules: vec![a.into(), b.into()],
        resolution: ResolutionStrategy::RemoveDuplicate,
        security_impact: SecurityImpact::Critical,
        message: format!(
            "'{text}' appears in both {} and {} rules",
            a.category, b.category
        ),
        overlap_percentage: 100.0,
        suggestion: Some(format!(
            "keep '{text}' in exactly one of {} or {}",
            a.category, b.category
        )),
    }
}

fn check_allow_ask(allow: &NormalizedRule, ask: &NormalizedRule) -> Option<RuleConflict> {
    match classify(allow, ask) {
        OverlapType::Exact | OverlapType::Superset => {}
        _ => return None,
    }
    let allow_text = allow.original.trim();
    let ask_text = ask.original.trim();
    Some(RuleConflict {
        conflict_type: ConflictType::PrecedenceAmbiguity,
        conflicting_rules: vec![allow.into(), ask.into()],
        resolution: ResolutionStrategy::RemoveAskRule,
        security_impact: SecurityImpact::Medium,
        message: format!(
            "ask rule '{ask_text}' is shadowed by broader allow rule '{allow_text}'; the confirmation may never trigger"
        ),
        overlap_percentage: 100.0,
        suggestion: Some(format!(
            "narrow '{allow_text}' so it excludes '{ask_text}', or remove the ask rule"
        )),
    })
}

fn check_deny_ask(deny: &NormalizedRule, ask: &NormalizedRule) -> Option<RuleConflict> {
    match classify(deny, ask) {
        OverlapType::Exact | OverlapType::Superset => {}
        _ => return None,
    }
    let deny_text = deny.original.trim();
    let ask_text = ask.original.trim();
    Some(RuleConflict {
        conflict_type: ConflictType::PrecedenceAmbiguity,
        conflicting_rules: vec![deny.into(), ask.into()],
        resolution: ResolutionStrategy::RemoveAskRule,
        security_impact: SecurityImpact::Low,
        message: format!(
            "ask rule '{ask_text}' is unreachable: deny rule '{deny_text}' always wins"
        ),
        overlap_percentage: 100.0,
        suggestion: Some(format!("remove '{ask_text}'")),
    })
}

/// Most severe first, then by location of the first rule, then in the order
/// category pairs are compared.
pub(crate) fn conflict_order(a: &RuleConflict, b: &RuleConflict) -> std::cmp::Ordering {
    b.security_impact
        .cmp(&a.security_impact)
        .then_with(|| first_location(a).cmp(&first_location(b)))
        .then_with(|| pair_rank(a).cmp(&pair_rank(b)))
}

fn first_location(conflict: &RuleConflict) -> Option<RuleLocation> {
    conflict.conflicting_rules.first().map(|r| r.location)
}

fn pair_rank(conflict: &RuleConflict) -> (usize, Option<usize>) {
    let [first, second] = conflict.conflicting_rules.as_slice() else {
        return (CATEGORY_PAIRS.len(), None);
    };
    let pair = CATEGORY_PAIRS
        .iter()
        .position(|&pair| pair == (first.category, second.category))
        .unwrap_or(CATEGORY_PAIRS.len());
    (pair, Some(second.location.index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detect(deny: &[&str], allow: &[&str], ask: &[&str]) -> Vec<RuleConflict> {
        ConflictDetector::default().detect(&RuleSet::from_lists(deny, allow, ask))
    }

    #[test]
    fn same_text_in_deny_and_allow_is_contradictory() {
        let conflicts = detect(&["exec"], &["exec"], &[]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::ContradictoryRules);
        assert_eq!(conflicts[0].security_impact, SecurityImpact::Critical);
    }

    #[test]
    fn same_text_in_allow_and_ask_is_contradictory() {
        let conflicts = detect(&[], &["Bash(npm:*)"], &["Bash(npm:*)"]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::ContradictoryRules);
    }

    #[test]
    fn allow_inside_deny_is_critical() {
        let conflicts = detect(&["admin/*"], &["admin/users/read"], &[]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::AllowOverridesDeny);
        assert_eq!(conflicts[0].security_impact, SecurityImpact::Critical);
        assert_eq!(conflicts[0].resolution, ResolutionStrategy::RemoveAllowRule);
        assert_eq!(
            conflicts[0].conflicting_rules[0].location,
            RuleLocation::new(RuleCategory::Deny, 0)
        );
    }

    #[test]
    fn catch_all_deny_covers_tool_allow() {
        let conflicts = detect(&["**"], &["Bash(rm -rf /)"], &[]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::AllowOverridesDeny);
        assert_eq!(conflicts[0].security_impact, SecurityImpact::Critical);

        let conflicts = detect(&["Read(.env)"], &["*"], &[]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::AllowOverridesDeny);
        assert_eq!(conflicts[0].security_impact, SecurityImpact::High);
    }

    #[test]
    fn allow_broader_than_deny_is_high() {
        let conflicts = detect(&["Read(.env)"], &["Read"], &[]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].security_impact, SecurityImpact::High);
        assert_eq!(conflicts[0].resolution, ResolutionStrategy::NarrowAllowRule);
    }

    #[test]
    fn partial_overlap_respects_strict_mode() {
        let rules = RuleSet::from_lists(&["a*b"], &["*ab*"], &[]);

        let strict = ConflictDetector::default().detect(&rules);
        assert_eq!(strict[0].security_impact, SecurityImpact::High);

        let relaxed = ConflictDetector::new(30.0, false).detect(&rules);
        assert_eq!(relaxed[0].security_impact, SecurityImpact::Medium);

        let low_threshold = ConflictDetector::new(0.0, false).detect(&rules);
        assert_eq!(low_threshold[0].security_impact, SecurityImpact::High);
    }

    #[test]
    fn disjoint_rules_have_no_conflicts() {
        assert!(detect(&["*.exe"], &["*.js"], &[]).is_empty());
        assert!(detect(&["Bash(rm:*)"], &["Bash(git:*)"], &["Bash(npm publish:*)"]).is_empty());
    }

    #[test]
    fn redundant_rule_in_same_category() {
        let conflicts = detect(&["a/*", "a/**"], &[], &[]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::OverlappingPatterns);
        assert_eq!(conflicts[0].security_impact, SecurityImpact::Low);
        assert!(conflicts[0].suggestion.as_ref().unwrap().contains("remove 'a/*'"));
    }

    #[test]
    fn duplicates_in_same_category_are_not_conflicts() {
        assert!(detect(&["secrets/**", "secrets/**"], &[], &[]).is_empty());
    }

    #[test]
    fn ask_shadowed_by_allow() {
        let conflicts = detect(&[], &["Bash"], &["Bash(git push:*)"]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::PrecedenceAmbiguity);
        assert_eq!(conflicts[0].security_impact, SecurityImpact::Medium);
    }

    #[test]
    fn ask_unreachable_behind_deny() {
        let conflicts = detect(&["Bash(rm:*)"], &[], &["Bash(rm -rf build)"]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::PrecedenceAmbiguity);
        assert_eq!(conflicts[0].security_impact, SecurityImpact::Low);
    }

    #[test]
    fn conflicts_sorted_by_severity() {
        let conflicts = detect(&["a/*", "a/**"], &["a/b"], &[]);
        assert!(conflicts.len() >= 2);
        assert_eq!(conflicts[0].security_impact, SecurityImpact::Critical);
        assert_eq!(
            conflicts.last().unwrap().conflict_type,
            ConflictType::OverlappingPatterns
        );
    }

    #[test]
    fn expired_deadline_returns_partial() {
        let rules = RuleSet::from_lists(&["a"], &["a"], &[]);
        let past = Instant::now() - Duration::from_millis(1);
        let err = ConflictDetector::default()
            .detect_until(&rules, Some(past))
            .unwrap_err();
        assert_eq!(err.pairs_checked, 0);
        assert!(err.partial.is_empty());
    }

    #[test]
    fn impact_ordering() {
        assert!(SecurityImpact::Critical > SecurityImpact::High);
        assert!(SecurityImpact::High.is_blocking());
        assert!(!SecurityImpact::Medium.is_blocking());
    }

    #[test]
    fn conflict_serializes_with_wire_names() {
        let conflicts = detect(&["exec"], &["exec"], &[]);
        let json = serde_json::to_value(&conflicts[0]).unwrap();
        assert_eq!(json["type"], "CONTRADICTORY_RULES");
        assert_eq!(json["securityImpact"], "critical");
        assert_eq!(json["conflictingRules"][0]["category"], "deny");
    }
}
