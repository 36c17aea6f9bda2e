//! Rule statistics for tooling summaries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Level, instrument};

use super::RuleSet;
use super::normalize::normalize;
use crate::types::RuleCategory;

/// Rule counts per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    pub deny: usize,
    pub allow: usize,
    pub ask: usize,
}

impl CategoryCounts {
    pub fn get(&self, category: RuleCategory) -> usize {
        match category {
            RuleCategory::Deny => self.deny,
            RuleCategory::Allow => self.allow,
            RuleCategory::Ask => self.ask,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Complexity {
    /// Mean length of the trimmed rule text, in characters.
    pub average_pattern_length: f64,
    pub glob_count: usize,
    pub regex_count: usize,
    pub literal_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coverage {
    /// Categories with at least one rule, in precedence order.
    pub categories_used: Vec<RuleCategory>,
    /// Rule counts per tool scope. Bare patterns are not counted here.
    pub per_tool: BTreeMap<String, usize>,
    pub bare_rules: usize,
    /// Share of rules containing a wildcard (0.0 - 1.0).
    pub wildcard_ratio: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleStatistics {
    pub total_rules: usize,
    pub by_category: CategoryCounts,
    pub complexity: Complexity,
    pub coverage: Coverage,
}

/// Computes statistics for a configuration value.
///
/// Entries that are not non-empty strings are ignored; shape problems are the
/// validator's business.
#[instrument(level = Level::TRACE, skip(config))]
pub fn get_rule_statistics(config: &Value) -> RuleStatistics {
    let mut rules = RuleSet::new();
    let permissions = config.get("permissions");

    for category in RuleCategory::ALL {
        let Some(list) = permissions
            .and_then(|p| p.get(category.name()))
            .and_then(Value::as_array)
        else {
            continue;
        };
        for (index, entry) in list.iter().enumerate() {
            if let Some(raw) = entry.as_str()
                && let Ok(rule) = normalize(category, index, raw)
            {
                rules.push(rule);
            }
        }
    }

    RuleStatistics::from_rules(&rules)
}

impl RuleStatistics {
    /// Computes statistics over already normalized rules.
    pub fn from_rules(rules: &RuleSet) -> Self {
        let total_rules = rules.len();
        let by_category = CategoryCounts {
            deny: rules.deny.len(),
            allow: rules.allow.len(),
            ask: rules.ask.len(),
        };

        let mut complexity = Complexity::default();
        let mut coverage = Coverage::default();
        let mut total_length = 0;
        let mut with_wildcards = 0;

        for rule in rules.iter() {
            total_length += rule.original.trim().chars().count();

            if rule.is_regex_like() {
                complexity.regex_count += 1;
            } else if rule.has_wildcards() {
                complexity.glob_count += 1;
            } else {
                complexity.literal_count += 1;
            }

            if rule.has_wildcards() {
                with_wildcards += 1;
            }

            match &rule.tool {
                Some(tool) => *coverage.per_tool.entry(tool.clone()).or_default() += 1,
                None => coverage.bare_rules += 1,
            }
        }

        if total_rules > 0 {
            complexity.average_pattern_length = total_length as f64 / total_rules as f64;
            coverage.wildcard_ratio = with_wildcards as f64 / total_rules as f64;
        }

        coverage.categories_used = RuleCategory::ALL
            .into_iter()
            .filter(|&c| by_category.get(c) > 0)
            .collect();

        Self {
            total_rules,
            by_category,
            complexity,
            coverage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_config() {
        let stats = get_rule_statistics(&json!({}));
        assert_eq!(stats, RuleStatistics::default());
    }

    #[test]
    fn test_counts_and_complexity() {
        let config = json!({
            "permissions": {
                "deny": ["Read(.env)", "Bash(rm:*)", "^secret$"],
                "allow": ["src/**", "Edit"],
                "ask": ["Bash(git push:*)"]
            }
        });
        let stats = get_rule_statistics(&config);

        assert_eq!(stats.total_rules, 6);
        assert_eq!(stats.by_category.deny, 3);
        assert_eq!(stats.by_category.allow, 2);
        assert_eq!(stats.by_category.ask, 1);

        assert_eq!(stats.complexity.regex_count, 1);
        // Bash(rm:*), src/**, Bash(git push:*)
        assert_eq!(stats.complexity.glob_count, 3);
        // Read(.env), Edit
        assert_eq!(stats.complexity.literal_count, 2);
        assert!(stats.complexity.average_pattern_length > 0.0);

        assert_eq!(stats.coverage.per_tool.get("Bash"), Some(&2));
        assert_eq!(stats.coverage.per_tool.get("Read"), Some(&1));
        assert_eq!(stats.coverage.bare_rules, 2);
        assert_eq!(
            stats.coverage.categories_used,
            vec![RuleCategory::Deny, RuleCategory::Ask, RuleCategory::Allow]
        );
        assert!((stats.coverage.wildcard_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ignores_invalid_entries() {
        let config = json!({
            "permissions": { "deny": ["", 42, "exec"], "allow": "not-a-list" }
        });
        let stats = get_rule_statistics(&config);
        assert_eq!(stats.total_rules, 1);
        assert_eq!(stats.coverage.categories_used, vec![RuleCategory::Deny]);
        assert_eq!(stats.complexity.average_pattern_length, 4.0);
    }

    #[test]
    fn test_serializes_camel_case() {
        let stats = get_rule_statistics(&json!({"permissions": {"deny": ["a"]}}));
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["totalRules"], 1);
        assert_eq!(value["byCategory"]["deny"], 1);
        assert!(value["complexity"].get("averagePatternLength").is_some());
    }
}
