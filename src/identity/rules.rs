//! Permission rules and the evaluator.
//!
//! Rules arrive in two shapes: the field form
//! `{namespace, collection, key, methods}` and the legacy positional form
//! `[namespace, collection, key, methods]`. Both are normalized once into `Rule`;
//! a rule that cannot be normalized grants nothing and is dropped.
//!
//! Scoping is three-level: namespace, then collection, then *field key*. A `None`
//! scope is a wildcard.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    Set,
    Remove,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Set => "set",
            Verb::Remove => "remove",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "get" => Some(Verb::Get),
            "set" => Some(Verb::Set),
            "remove" => Some(Verb::Remove),
            _ => None,
        }
    }
}

impl Display for Verb {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Rule as received from the identity source, before normalization.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawRule {
    Positional(Vec<JsonValue>),
    Fields(serde_json::Map<String, JsonValue>),
    Other(JsonValue),
}

/// Canonical permission rule. `None` scopes match any value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub namespace: Option<String>,
    pub collection: Option<String>,
    pub key: Option<String>,
    pub methods: Vec<Verb>,
}

/// `null`, `""` and omission are wildcards; any other non-string makes the rule malformed.
fn scope(v: Option<&JsonValue>) -> Result<Option<String>, ()> {
    match v {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.is_empty() => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(()),
    }
}

/// Methods must be an array of strings; unknown verbs are ignored.
fn methods(v: Option<&JsonValue>) -> Option<Vec<Verb>> {
    let arr = v?.as_array()?;
    let mut out = Vec::with_capacity(arr.len());
    for m in arr {
        let s = m.as_str()?;
        if let Some(verb) = Verb::parse(s) {
            if !out.contains(&verb) { out.push(verb); }
        }
    }
    Some(out)
}

impl Rule {
    pub fn new(namespace: Option<&str>, collection: Option<&str>, key: Option<&str>, methods: &[Verb]) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            collection: collection.map(str::to_string),
            key: key.map(str::to_string),
            methods: methods.to_vec(),
        }
    }

    /// Normalize a raw rule. `None` means the rule contributes no permissions.
    pub fn normalize(raw: &RawRule) -> Option<Rule> {
        let (ns, col, key, meth) = match raw {
            RawRule::Fields(obj) => (
                obj.get("namespace").or_else(|| obj.get("app")),
                obj.get("collection").or_else(|| obj.get("collectionName")),
                obj.get("key"),
                obj.get("methods"),
            ),
            RawRule::Positional(items) if items.len() == 4 => (Some(&items[0]), Some(&items[1]), Some(&items[2]), Some(&items[3])),
            _ => return None,
        };
        Some(Rule {
            namespace: scope(ns).ok()?,
            collection: scope(col).ok()?,
            key: scope(key).ok()?,
            methods: methods(meth)?,
        })
    }

    /// Normalize a JSON rule list, dropping entries that grant nothing.
    pub fn normalize_all(raw: &[JsonValue]) -> Vec<Rule> {
        raw.iter()
            .filter_map(|v| serde_json::from_value::<RawRule>(v.clone()).ok())
            .filter_map(|r| Rule::normalize(&r))
            .collect()
    }

    pub fn grants(&self, target: &AccessTarget<'_>, verb: Verb) -> bool {
        fn hit(scope: &Option<String>, v: Option<&str>) -> bool {
            match scope {
                None => true,
                Some(s) => v == Some(s.as_str()),
            }
        }
        hit(&self.namespace, target.namespace)
            && hit(&self.collection, target.collection)
            && hit(&self.key, target.field_key)
            && self.methods.contains(&verb)
    }
}

/// What an operation touches, as seen by the evaluator. A `None` field means the
/// request does not pin that dimension, so only a wildcard rule can cover it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessTarget<'a> {
    pub namespace: Option<&'a str>,
    pub collection: Option<&'a str>,
    pub field_key: Option<&'a str>,
}

impl<'a> From<&'a crate::storage::ItemAddress> for AccessTarget<'a> {
    fn from(a: &'a crate::storage::ItemAddress) -> Self {
        Self { namespace: Some(&a.namespace), collection: Some(&a.collection), field_key: Some(&a.field_key) }
    }
}

/// True when any rule grants `verb` on `target`.
pub fn authorize(rules: &[Rule], target: &AccessTarget<'_>, verb: Verb) -> bool {
    rules.iter().any(|r| r.grants(target, verb))
}

#[cfg(test)]
#[path = "rules_tests.rs"]
mod rules_tests;
