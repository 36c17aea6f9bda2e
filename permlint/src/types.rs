//! Configuration data model.
//!
//! A configuration declares three rule lists (`deny`, `allow`, `ask`) under a
//! `permissions` object, plus free-form metadata. The validator consumes the
//! decoded JSON value directly; the typed [`Configuration`] is a convenience
//! for building and inspecting configurations from Rust.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The rule list a pattern belongs to.
///
/// Precedence is `Deny > Ask > Allow`: when several rules match the same
/// operation, the category with the higher precedence decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    /// Operation is refused.
    Deny,
    /// Operation requires user confirmation.
    Ask,
    /// Operation is granted without confirmation.
    Allow,
}

impl RuleCategory {
    /// All categories in order of precedence (highest first).
    pub const ALL: [RuleCategory; 3] = [RuleCategory::Deny, RuleCategory::Ask, RuleCategory::Allow];

    /// Returns the JSON field name for this category.
    pub fn name(&self) -> &'static str {
        match self {
            RuleCategory::Deny => "deny",
            RuleCategory::Ask => "ask",
            RuleCategory::Allow => "allow",
        }
    }

    /// Higher value wins when rules of different categories match.
    pub fn precedence(&self) -> u8 {
        match self {
            RuleCategory::Deny => 3,
            RuleCategory::Ask => 2,
            RuleCategory::Allow => 1,
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RuleCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deny" => Ok(RuleCategory::Deny),
            "ask" => Ok(RuleCategory::Ask),
            "allow" => Ok(RuleCategory::Allow),
            other => Err(format!("unknown rule category '{other}'")),
        }
    }
}

/// Where a rule lives inside a configuration (`permissions.<category>[index]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleLocation {
    pub category: RuleCategory,
    pub index: usize,
}

impl RuleLocation {
    pub fn new(category: RuleCategory, index: usize) -> Self {
        Self { category, index }
    }
}

impl fmt::Display for RuleLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "permissions.{}[{}]", self.category, self.index)
    }
}

/// Keys inside `permissions` that are not rule lists but are still valid.
pub const KNOWN_PERMISSION_FIELDS: &[&str] = &[
    "defaultMode",
    "additionalDirectories",
    "disableBypassPermissionsMode",
];

/// The three rule lists of a configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    /// Patterns that are refused.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deny: Vec<String>,

    /// Patterns that are granted without confirmation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow: Vec<String>,

    /// Patterns that require confirmation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ask: Vec<String>,

    /// Default permission mode used by the assistant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<String>,

    /// Extra directories the assistant may access.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_directories: Vec<String>,
}

impl Permissions {
    /// Returns the rule list for a category.
    pub fn rules(&self, category: RuleCategory) -> &[String] {
        match category {
            RuleCategory::Deny => &self.deny,
            RuleCategory::Ask => &self.ask,
            RuleCategory::Allow => &self.allow,
        }
    }

    /// Returns true if no rule list has entries.
    pub fn is_empty(&self) -> bool {
        self.deny.is_empty() && self.allow.is_empty() && self.ask.is_empty()
    }

    /// Total number of rules across all categories.
    pub fn len(&self) -> usize {
        self.deny.len() + self.allow.len() + self.ask.len()
    }
}

/// A permission configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    #[serde(default)]
    pub permissions: Permissions,

    /// Free-form metadata; volatile fields here never affect cache keys.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Configuration {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a deny rule.
    pub fn deny(mut self, pattern: impl Into<String>) -> Self {
        self.permissions.deny.push(pattern.into());
        self
    }

    /// Adds an allow rule.
    pub fn allow(mut self, pattern: impl Into<String>) -> Self {
        self.permissions.allow.push(pattern.into());
        self
    }

    /// Adds an ask rule.
    pub fn ask(mut self, pattern: impl Into<String>) -> Self {
        self.permissions.ask.push(pattern.into());
        self
    }

    /// Sets a metadata field.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Converts the configuration to the JSON value the validator consumes.
    pub fn to_value(&self) -> Value {
        // Serializing plain strings and maps cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Decodes a configuration from a JSON value.
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        Configuration::deserialize(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_precedence() {
        assert!(RuleCategory::Deny.precedence() > RuleCategory::Ask.precedence());
        assert!(RuleCategory::Ask.precedence() > RuleCategory::Allow.precedence());
        assert_eq!(RuleCategory::ALL[0], RuleCategory::Deny);
    }

    #[test]
    fn test_category_round_trip_names() {
        for category in RuleCategory::ALL {
            assert_eq!(category.name().parse::<RuleCategory>().unwrap(), category);
        }
        assert!("maybe".parse::<RuleCategory>().is_err());
    }

    #[test]
    fn test_location_display() {
        let loc = RuleLocation::new(RuleCategory::Allow, 3);
        assert_eq!(loc.to_string(), "permissions.allow[3]");
    }

    #[test]
    fn test_configuration_builder_to_value() {
        let config = Configuration::new()
            .deny("Read(.env)")
            .allow("Bash(git:*)")
            .with_metadata("owner", "platform");

        let value = config.to_value();
        assert_eq!(value["permissions"]["deny"], json!(["Read(.env)"]));
        assert_eq!(value["permissions"]["allow"], json!(["Bash(git:*)"]));
        assert_eq!(value["metadata"]["owner"], json!("platform"));
        assert!(value["permissions"].get("ask").is_none());
    }

    #[test]
    fn test_configuration_from_settings_file_shape() {
        let value = json!({
            "permissions": {
                "allow": ["Edit"],
                "deny": ["Bash(rm:*)"],
                "defaultMode": "acceptEdits"
            }
        });
        let config = Configuration::from_value(&value).unwrap();
        assert_eq!(config.permissions.len(), 2);
        assert_eq!(config.permissions.default_mode.as_deref(), Some("acceptEdits"));
        assert_eq!(config.permissions.rules(RuleCategory::Deny), ["Bash(rm:*)"]);
    }
}
