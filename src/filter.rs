//!
//! kvgate filter expansion
//! ------------------------
//! Request bodies address items through five fields, each of which may be a single
//! value or an array. This module turns such a body into concrete item filters by
//! zipping parallel arrays position by position (never a cross product), and also
//! builds the non-zipped membership query used when at most one field varies.
//!
//! Everything here is pure: no storage, no HTTP, no permissions.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::error::{AppError, AppResult};
use crate::storage::{ItemAddress, Match, Predicate};

/// The addressable fields of a request body, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Namespace,
    Collection,
    CollectionKey,
    FieldKey,
    Value,
}

impl Field {
    pub const ALL: [Field; 5] = [Field::Namespace, Field::Collection, Field::CollectionKey, Field::FieldKey, Field::Value];

    pub fn name(self) -> &'static str {
        match self {
            Field::Namespace => "namespace",
            Field::Collection => "collection",
            Field::CollectionKey => "collectionKey",
            Field::FieldKey => "fieldKey",
            Field::Value => "value",
        }
    }

    /// Older clients use these names; the canonical name wins when both are sent.
    fn legacy_name(self) -> Option<&'static str> {
        match self {
            Field::Namespace => Some("app"),
            Field::Collection => Some("collectionName"),
            Field::FieldKey => Some("key"),
            Field::CollectionKey | Field::Value => None,
        }
    }
}

/// One request field as sent by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldInput {
    /// Present but explicitly `null`: excluded from every filter.
    Null,
    Scalar(JsonValue),
    Sequence(Vec<JsonValue>),
}

impl FieldInput {
    pub fn from_json(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => FieldInput::Null,
            JsonValue::Array(items) => FieldInput::Sequence(items),
            other => FieldInput::Scalar(other),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FieldInput::Null => 0,
            FieldInput::Scalar(_) => 1,
            FieldInput::Sequence(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_multi(&self) -> bool { matches!(self, FieldInput::Sequence(items) if items.len() > 1) }

    fn at(&self, i: usize) -> Option<&JsonValue> {
        match self {
            FieldInput::Null => None,
            FieldInput::Scalar(v) => Some(v),
            FieldInput::Sequence(items) if items.len() == 1 => items.first(),
            FieldInput::Sequence(items) => items.get(i),
        }
    }
}

/// Parsed request body: only the fields the caller actually sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestBody {
    fields: BTreeMap<Field, FieldInput>,
}

impl RequestBody {
    pub fn from_json(body: &JsonValue) -> AppResult<Self> {
        let Some(obj) = body.as_object() else {
            return Err(AppError::user("bad_body", "request body must be a JSON object"));
        };
        let mut fields = BTreeMap::new();
        for f in Field::ALL {
            let raw = obj.get(f.name()).or_else(|| f.legacy_name().and_then(|n| obj.get(n)));
            if let Some(v) = raw {
                fields.insert(f, FieldInput::from_json(v.clone()));
            }
        }
        Ok(Self { fields })
    }

    pub fn is_empty(&self) -> bool { self.fields.is_empty() }

    /// No field constrains anything: the body is empty or every field is `null`.
    pub fn is_unconstrained(&self) -> bool {
        self.fields.values().all(|v| matches!(v, FieldInput::Null))
    }

    /// Some field was sent as `[]`.
    pub fn has_empty_sequence(&self) -> bool {
        self.fields.values().any(|v| matches!(v, FieldInput::Sequence(items) if items.is_empty()))
    }

    /// Fields sent as arrays with more than one element.
    pub fn multi_valued_fields(&self) -> Vec<Field> {
        self.fields.iter().filter(|(_, v)| v.is_multi()).map(|(f, _)| *f).collect()
    }
}

/// One concrete combination produced by the zip. Absent fields are `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub namespace: Option<String>,
    pub collection: Option<String>,
    pub collection_key: Option<String>,
    pub field_key: Option<String>,
    pub value: Option<JsonValue>,
}

impl Filter {
    /// Full address when all four addressing fields are set.
    pub fn address(&self) -> Option<ItemAddress> {
        Some(ItemAddress {
            namespace: self.namespace.clone()?,
            collection: self.collection.clone()?,
            collection_key: self.collection_key.clone()?,
            field_key: self.field_key.clone()?,
        })
    }

    /// Equality predicate on every field the filter carries.
    pub fn to_predicate(&self) -> Predicate {
        Predicate {
            namespace: self.namespace.clone().map(Match::Eq),
            collection: self.collection.clone().map(Match::Eq),
            collection_key: self.collection_key.clone().map(Match::Eq),
            field_key: self.field_key.clone().map(Match::Eq),
            value: self.value.clone().map(Match::Eq),
        }
    }

    fn assign(&mut self, field: Field, v: &JsonValue) -> AppResult<()> {
        match field {
            Field::Namespace => self.namespace = Some(address_part(field, v)?),
            Field::Collection => self.collection = Some(address_part(field, v)?),
            Field::CollectionKey => self.collection_key = Some(address_part(field, v)?),
            Field::FieldKey => self.field_key = Some(address_part(field, v)?),
            Field::Value => self.value = Some(v.clone()),
        }
        Ok(())
    }
}

/// Addressing fields are strings; numbers and booleans are accepted in their text form.
fn address_part(field: Field, v: &JsonValue) -> AppResult<String> {
    match v {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Bool(b) => Ok(b.to_string()),
        _ => Err(AppError::user(
            "bad_field".to_string(),
            format!("'{}' entries must be strings, got {}", field.name(), v),
        )),
    }
}

/// Length every multi-valued field must share, validated.
fn broadcast_len(body: &RequestBody) -> AppResult<usize> {
    let max_len = body.fields.values().filter(|v| v.len() > 1).map(FieldInput::len).max().unwrap_or(1);
    if let Some((f, v)) = body.fields.iter().find(|(_, v)| v.len() > 1 && v.len() != max_len) {
        return Err(AppError::user(
            "inconsistent_lengths".to_string(),
            format!(
                "Inconsistent array lengths. All array fields must be length 1 or length {} ('{}' has length {}).",
                max_len, f.name(), v.len()
            ),
        ));
    }
    Ok(max_len)
}

/// Zip the body into `L` filters, `L` being the shared length of its array fields.
///
/// Returns an empty list when the body has no recognised fields or when any field
/// is an empty array (there is nothing to pair it with).
pub fn expand(body: &RequestBody) -> AppResult<Vec<Filter>> {
    let len = broadcast_len(body)?;
    if body.is_empty() { return Ok(Vec::new()); }
    if body.has_empty_sequence() { return Ok(Vec::new()); }
    let mut filters = Vec::with_capacity(len);
    for i in 0..len {
        let mut filter = Filter::default();
        for (field, input) in body.fields.iter() {
            if let Some(v) = input.at(i) {
                filter.assign(*field, v)?;
            }
        }
        filters.push(filter);
    }
    Ok(filters)
}

fn address_match(field: Field, input: &FieldInput) -> AppResult<Option<Match<String>>> {
    Ok(match input {
        FieldInput::Null => None,
        FieldInput::Scalar(v) => Some(Match::Eq(address_part(field, v)?)),
        FieldInput::Sequence(items) if items.len() == 1 => Some(Match::Eq(address_part(field, &items[0])?)),
        FieldInput::Sequence(items) => Some(Match::In(items.iter().map(|v| address_part(field, v)).collect::<AppResult<_>>()?)),
    })
}

/// Single predicate for bodies where at most one field varies: equality on the
/// single-valued fields, membership on the multi-valued (or empty) one.
pub fn membership_predicate(body: &RequestBody) -> AppResult<Predicate> {
    let mut p = Predicate::default();
    for (field, input) in body.fields.iter() {
        match field {
            Field::Namespace => p.namespace = address_match(*field, input)?,
            Field::Collection => p.collection = address_match(*field, input)?,
            Field::CollectionKey => p.collection_key = address_match(*field, input)?,
            Field::FieldKey => p.field_key = address_match(*field, input)?,
            Field::Value => {
                p.value = match input {
                    FieldInput::Null => None,
                    FieldInput::Scalar(v) => Some(Match::Eq(v.clone())),
                    FieldInput::Sequence(items) if items.len() == 1 => Some(Match::Eq(items[0].clone())),
                    FieldInput::Sequence(items) => Some(Match::In(items.clone())),
                }
            }
        }
    }
    Ok(p)
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod filter_tests;
