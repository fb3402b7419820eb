use serde::Serialize;
use serde_json::Value as JsonValue;

use super::rules::Rule;

/// Authenticated caller as seen by the storage core: an id and its normalized rules.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub rules: Vec<Rule>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self { user_id: user_id.into(), rules }
    }

    /// Build from the raw rule list handed over by the identity source.
    pub fn from_raw_rules(user_id: impl Into<String>, raw: &[JsonValue]) -> Self {
        Self::new(user_id, Rule::normalize_all(raw))
    }
}
