//! Content-addressed cache keys.
//!
//! A key is derived from the semantic content of a JSON value: object keys are
//! sorted, arrays are sorted by the canonical form of their elements, and
//! volatile fields (timestamps, ids, signatures) are dropped at every depth.
//! The canonical text is hashed with SHA-256 and prefixed with a namespace,
//! version and operation:
//!
//! ```text
//! permlint:v1:validation:3f1c9a0b7d2e4c61a8f0b5d3e9c7a2f1
//! ```
//!
//! Two values that differ only in key order, array order or volatile fields
//! share a key; different operations never share one.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{PermlintError, Result};

/// Fields ignored when deriving a key.
pub const VOLATILE_FIELDS: &[&str] = &[
    "timestamp",
    "createdAt",
    "updatedAt",
    "lastModified",
    "signature",
    "hash",
    "id",
    "_id",
];

pub const KEY_NAMESPACE: &str = "permlint";
pub const KEY_VERSION: &str = "v1";

/// Hex characters of the digest kept in a key.
const DIGEST_LEN: usize = 32;

/// Kind of cached computation; part of every key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Full validation with conflict detection.
    Validation,
    /// Validation without conflict detection.
    ValidationSyntax,
    /// Rule statistics.
    Statistics,
    /// Parsed configuration content.
    Config,
    /// Rendered templates.
    Template,
    Custom(CustomOperation),
}

impl Operation {
    const BUILT_IN: [Operation; 5] = [
        Operation::Validation,
        Operation::ValidationSyntax,
        Operation::Statistics,
        Operation::Config,
        Operation::Template,
    ];

    /// A caller-defined operation. See [`CustomOperation::new`].
    pub fn custom(name: impl Into<String>) -> Result<Self> {
        CustomOperation::new(name).map(Operation::Custom)
    }

    pub fn name(&self) -> &str {
        match self {
            Operation::Validation => "validation",
            Operation::ValidationSyntax => "validation-syntax",
            Operation::Statistics => "statistics",
            Operation::Config => "config",
            Operation::Template => "template",
            Operation::Custom(custom) => custom.as_str(),
        }
    }

    /// Key prefix shared by every key of this operation.
    pub fn prefix(&self) -> String {
        format!("{KEY_NAMESPACE}:{KEY_VERSION}:{}:", self.name())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name of a caller-defined operation.
///
/// The name becomes a key segment, so it may not contain `:` or the pattern
/// wildcards `*` and `?`, and may not equal a built-in operation name.
/// Otherwise its keys could be matched by another operation's prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CustomOperation(String);

impl CustomOperation {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("name is empty")
        } else if name.contains([':', '*', '?']) {
            Some("name may not contain ':', '*' or '?'")
        } else if Operation::BUILT_IN.iter().any(|op| op.name() == name) {
            Some("name is reserved for a built-in operation")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(PermlintError::InvalidOperation {
                name,
                reason: reason.to_string(),
            }),
            None => Ok(Self(name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CustomOperation {
    type Error = PermlintError;

    fn try_from(name: String) -> Result<Self> {
        Self::new(name)
    }
}

impl From<CustomOperation> for String {
    fn from(custom: CustomOperation) -> Self {
        custom.0
    }
}

/// Derives cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyGenerator {
    volatile_fields: Vec<String>,
}

impl Default for CacheKeyGenerator {
    fn default() -> Self {
        Self {
            volatile_fields: VOLATILE_FIELDS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl CacheKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treats an additional field name as volatile.
    pub fn with_volatile_field(mut self, field: impl Into<String>) -> Self {
        self.volatile_fields.push(field.into());
        self
    }

    /// Key for `value` under `operation`.
    pub fn generate(&self, operation: &Operation, value: &Value) -> String {
        let canonical = self.canonical_string(value);
        let digest = format!("{:x}", Sha256::digest(canonical.as_bytes()));
        format!("{}{}", operation.prefix(), &digest[..DIGEST_LEN])
    }

    /// Canonical text form of `value`.
    pub fn canonical_string(&self, value: &Value) -> String {
        self.canonicalize(value).to_string()
    }

    /// Returns `value` with volatile fields removed, object keys sorted and
    /// arrays sorted by canonical element text.
    pub fn canonicalize(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map
                    .keys()
                    .filter(|k| !self.is_volatile(k))
                    .collect();
                keys.sort();
                // serde_json's default map keeps keys sorted; insert in order
                // so the output is sorted either way.
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), self.canonicalize(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                let mut canonical: Vec<(String, Value)> = items
                    .iter()
                    .map(|item| {
                        let c = self.canonicalize(item);
                        (c.to_string(), c)
                    })
                    .collect();
                canonical.sort_by(|a, b| a.0.cmp(&b.0));
                Value::Array(canonical.into_iter().map(|(_, v)| v).collect())
            }
            other => other.clone(),
        }
    }

    fn is_volatile(&self, key: &str) -> bool {
        self.volatile_fields.iter().any(|f| f == key)
    }
}
