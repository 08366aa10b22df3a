//! Structured `key: value` fields embedded in issue descriptions.
//!
//! Older beads carry hook and attachment data only in their description text:
//!
//! ```text
//! role_type: polecat
//! hook_bead: gt-42
//! agent_state: working
//! ```
//!
//! Lookups go through [`resolve`]: first-class field, else description field,
//! else absent.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static FIELD_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_-]*):\s*(.*?)\s*$").expect("valid field regex")
});

/// Fields parsed out of a description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescriptionFields {
    values: BTreeMap<String, String>,
}

impl DescriptionFields {
    /// Parse every `key: value` line. Later lines win over earlier ones.
    /// Empty values and the literal `null` are treated as absent.
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in text.lines() {
            if let Some(caps) = FIELD_LINE.captures(line) {
                let value = caps[2].trim();
                if value.is_empty() || value == "null" {
                    continue;
                }
                values.insert(caps[1].to_lowercase(), value.to_string());
            }
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Resolve a field: the first-class value if non-empty, else the parsed one.
pub fn resolve(first_class: Option<&str>, fields: &DescriptionFields, key: &str) -> Option<String> {
    first_class
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| fields.get(key))
        .map(str::to_string)
}

/// Remove every line defining `key` from a description.
pub fn remove_field(text: &str, key: &str) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| match FIELD_LINE.captures(line) {
            Some(caps) => !caps[1].eq_ignore_ascii_case(key),
            None => true,
        })
        .collect();
    kept.join("\n")
}
