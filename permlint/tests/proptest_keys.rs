//! Property tests for content-addressed cache keys.
//!
//! Verifies:
//! - Key order, array order and volatile fields never change a key
//! - Any change to rule content changes the key
//! - Operations never share keys

use permlint::cache::{CacheKeyGenerator, Operation};
use proptest::prelude::*;
use serde_json::{Map, Value, json};

// ============================================
// Arbitrary generators
// ============================================

fn arb_rule() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z]{1,6}(/[a-z*]{1,4}){0,2}",
        "(Read|Edit|Bash)\\([a-z]{1,5}(/[a-z*]{1,3}){0,2}\\)",
        Just("Bash(git:*)".to_string()),
    ]
}

fn arb_rules() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(arb_rule(), 0..6)
}

fn config(deny: &[String], allow: &[String], ask: &[String], timestamp: u64) -> Value {
    json!({
        "permissions": {"deny": deny, "allow": allow, "ask": ask},
        "metadata": {"name": "project", "timestamp": timestamp, "id": format!("cfg-{timestamp}")},
    })
}

/// Same content with every object built in reverse key order and every array
/// rotated.
fn permuted(deny: &[String], allow: &[String], ask: &[String], shift: usize, timestamp: u64) -> Value {
    let rotate = |rules: &[String]| -> Vec<String> {
        let mut rotated = rules.to_vec();
        if !rotated.is_empty() {
            let by = shift % rotated.len();
            rotated.rotate_left(by);
        }
        rotated
    };

    let mut permissions = Map::new();
    permissions.insert("ask".into(), json!(rotate(ask)));
    permissions.insert("allow".into(), json!(rotate(allow)));
    permissions.insert("deny".into(), json!(rotate(deny)));

    let mut metadata = Map::new();
    metadata.insert("id".into(), json!("another-id"));
    metadata.insert("timestamp".into(), json!(timestamp));
    metadata.insert("name".into(), json!("project"));

    let mut root = Map::new();
    root.insert("metadata".into(), Value::Object(metadata));
    root.insert("permissions".into(), Value::Object(permissions));
    Value::Object(root)
}

// ============================================
// Properties
// ============================================

proptest! {
    #[test]
    fn key_ignores_order_and_volatile_fields(
        deny in arb_rules(),
        allow in arb_rules(),
        ask in arb_rules(),
        shift in 0usize..8,
        t1 in any::<u64>(),
        t2 in any::<u64>(),
    ) {
        let keys = CacheKeyGenerator::new();
        let a = keys.generate(&Operation::Validation, &config(&deny, &allow, &ask, t1));
        let b = keys.generate(&Operation::Validation, &permuted(&deny, &allow, &ask, shift, t2));
        prop_assert_eq!(a, b);
    }

    #[test]
    fn key_changes_with_rule_content(
        deny in arb_rules(),
        allow in arb_rules(),
        extra in arb_rule(),
    ) {
        prop_assume!(!deny.contains(&extra));
        let keys = CacheKeyGenerator::new();

        let mut widened = deny.clone();
        widened.push(extra);

        let a = keys.generate(&Operation::Validation, &config(&deny, &allow, &[], 0));
        let b = keys.generate(&Operation::Validation, &config(&widened, &allow, &[], 0));
        prop_assert_ne!(a, b);
    }

    #[test]
    fn moving_a_rule_between_categories_changes_the_key(rule in arb_rule()) {
        let keys = CacheKeyGenerator::new();
        let rules = vec![rule];
        let as_deny = keys.generate(&Operation::Validation, &config(&rules, &[], &[], 0));
        let as_allow = keys.generate(&Operation::Validation, &config(&[], &rules, &[], 0));
        prop_assert_ne!(as_deny, as_allow);
    }

    #[test]
    fn operations_never_share_keys(deny in arb_rules()) {
        let keys = CacheKeyGenerator::new();
        let value = config(&deny, &[], &[], 0);
        let full = keys.generate(&Operation::Validation, &value);
        let syntax = keys.generate(&Operation::ValidationSyntax, &value);
        prop_assert!(full.starts_with(&Operation::Validation.prefix()));
        prop_assert!(syntax.starts_with(&Operation::ValidationSyntax.prefix()));
        prop_assert_ne!(full, syntax);
    }
}
