//! Translates rule locations between a configuration's own rule order and
//! the canonical order its cache key is derived from.
//!
//! Cache keys ignore the order of rules inside each list, so one cached
//! result serves every ordering of the same rules. Results are stored with
//! canonical locations and translated back into the caller's order on a hit.

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::result::{ValidationErrorKind, ValidationResult};
use crate::cache::CacheKeyGenerator;
use crate::rules::conflict::conflict_order;
use crate::types::{RuleCategory, RuleLocation};

#[derive(Debug, Default)]
pub(crate) struct RuleOrder {
    /// canonical position → index in the configuration
    actual: HashMap<RuleCategory, Vec<usize>>,
    /// index in the configuration → canonical position
    canonical: HashMap<RuleCategory, Vec<usize>>,
}

impl RuleOrder {
    /// Orders each rule list by canonical entry text. Equal entries keep
    /// their relative order, so the n-th duplicate maps to the n-th.
    pub(crate) fn of(keys: &CacheKeyGenerator, config: &Map<String, Value>) -> Self {
        let mut order = Self::default();
        let Some(permissions) = config.get("permissions").and_then(Value::as_object) else {
            return order;
        };

        for category in RuleCategory::ALL {
            let Some(entries) = permissions.get(category.name()).and_then(Value::as_array) else {
                continue;
            };
            let texts: Vec<String> = entries.iter().map(|e| keys.canonical_string(e)).collect();
            let mut actual: Vec<usize> = (0..entries.len()).collect();
            actual.sort_by(|&a, &b| texts[a].cmp(&texts[b]).then(a.cmp(&b)));

            let mut canonical = vec![0; entries.len()];
            for (position, &index) in actual.iter().enumerate() {
                canonical[index] = position;
            }
            order.actual.insert(category, actual);
            order.canonical.insert(category, canonical);
        }
        order
    }

    /// Rewrites locations into canonical positions, for storing.
    pub(crate) fn to_canonical(&self, result: &mut ValidationResult) {
        relocate(result, |location| lookup(&self.canonical, location));
    }

    /// Rewrites canonical positions into this configuration's indices and
    /// puts findings back in the order a fresh validation reports them.
    pub(crate) fn to_actual(&self, result: &mut ValidationResult) {
        relocate(result, |location| lookup(&self.actual, location));
        restore_order(result);
    }
}

fn lookup(table: &HashMap<RuleCategory, Vec<usize>>, location: RuleLocation) -> RuleLocation {
    let index = table
        .get(&location.category)
        .and_then(|positions| positions.get(location.index))
        .copied()
        .unwrap_or(location.index);
    RuleLocation::new(location.category, index)
}

fn relocate(result: &mut ValidationResult, map: impl Fn(RuleLocation) -> RuleLocation) {
    for error in &mut result.errors {
        if let Some(location) = error.location.as_mut() {
            *location = map(*location);
        }
    }
    for warning in &mut result.warnings {
        if let Some(location) = warning.location.as_mut() {
            *location = map(*location);
        }
    }
    for conflict in &mut result.conflicts {
        for rule in &mut conflict.conflicting_rules {
            rule.location = map(rule.location);
        }
    }
}

fn restore_order(result: &mut ValidationResult) {
    for conflict in &mut result.conflicts {
        let rules = &mut conflict.conflicting_rules;
        // Rules of one list are reported lowest index first.
        if rules.len() == 2 && rules[0].category == rules[1].category && rules[0].location > rules[1].location {
            rules.swap(0, 1);
        }
    }
    result.conflicts.sort_by(conflict_order);

    // Structural findings precede per-rule findings for the same rules.
    sort_located_runs(&mut result.errors, |e| {
        e.location
            .map(|location| (e.kind != ValidationErrorKind::InvalidShape, location))
    });
    sort_located_runs(&mut result.warnings, |w| w.location);

    result.suggestions.clear();
    result.finalize();
}

/// Stable-sorts each maximal run of items that have a sort key, leaving
/// unkeyed items in place.
fn sort_located_runs<T, K: Ord>(items: &mut [T], key: impl Fn(&T) -> Option<K>) {
    let mut start = 0;
    while start < items.len() {
        if key(&items[start]).is_none() {
            start += 1;
            continue;
        }
        let mut end = start;
        while end < items.len() && key(&items[end]).is_some() {
            end += 1;
        }
        items[start..end].sort_by_key(|item| key(item));
        start = end;
    }
}
