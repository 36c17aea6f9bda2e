//! Rule analysis: normalization, overlap, conflicts and statistics.
//!
//! - [`normalize`]: raw rule strings to canonical segment sequences.
//! - [`overlap`]: pairwise containment/intersection of normalized rules.
//! - [`conflict`]: precedence-aware conflict detection across rule lists.
//! - [`stats`]: rule statistics for tooling summaries.

pub mod conflict;
pub mod normalize;
pub mod overlap;
pub mod stats;

pub use conflict::{
    ConflictDetector, ConflictType, ConflictingRule, DeadlineExceeded, ResolutionStrategy,
    RuleConflict, SecurityImpact,
};
pub use normalize::{NormalizeError, NormalizedRule, RuleForm, Segment, normalize};
pub use overlap::{OverlapType, PatternOverlapAnalysis, analyze};
pub use stats::{RuleStatistics, get_rule_statistics};

use crate::types::RuleCategory;

/// Normalized rules of one configuration, grouped by category.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    pub deny: Vec<NormalizedRule>,
    pub allow: Vec<NormalizedRule>,
    pub ask: Vec<NormalizedRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes plain rule lists, silently skipping empty entries.
    pub fn from_lists(deny: &[&str], allow: &[&str], ask: &[&str]) -> Self {
        let mut set = Self::new();
        for (category, list) in [
            (RuleCategory::Deny, deny),
            (RuleCategory::Allow, allow),
            (RuleCategory::Ask, ask),
        ] {
            for (index, raw) in list.iter().enumerate() {
                if let Ok(rule) = normalize(category, index, raw) {
                    set.push(rule);
                }
            }
        }
        set
    }

    pub fn push(&mut self, rule: NormalizedRule) {
        match rule.category {
            RuleCategory::Deny => self.deny.push(rule),
            RuleCategory::Allow => self.allow.push(rule),
            RuleCategory::Ask => self.ask.push(rule),
        }
    }

    pub fn get(&self, category: RuleCategory) -> &[NormalizedRule] {
        match category {
            RuleCategory::Deny => &self.deny,
            RuleCategory::Allow => &self.allow,
            RuleCategory::Ask => &self.ask,
        }
    }

    pub fn len(&self) -> usize {
        self.deny.len() + self.allow.len() + self.ask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &NormalizedRule> {
        self.deny.iter().chain(&self.allow).chain(&self.ask)
    }
}
