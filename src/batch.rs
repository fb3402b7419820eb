//!
//! kvgate batch operations
//! ------------------------
//! `set`, `get` and `remove` over a parsed request body. Each one builds its filters,
//! authorizes *every* address before touching the store (collecting all denials rather
//! than stopping at the first), and only then executes.
//!
//! `get` and `remove` zip the body only when two or more fields are multi-valued;
//! otherwise they issue a single query with set membership on the one varying field.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::error::{AppError, AppResult, DeniedItem};
use crate::filter::{expand, membership_predicate, RequestBody};
use crate::identity::{authorize, AccessTarget, Principal, Verb};
use crate::storage::{ItemStore, Match, Predicate, Query, UpsertResult};

/// `namespace -> collection -> {collectionKey, fieldKey -> value}`.
pub type Nested = BTreeMap<String, BTreeMap<String, serde_json::Map<String, JsonValue>>>;

/// Reserved slot in each collection bucket of a `get` response.
pub const COLLECTION_KEY_SLOT: &str = "collectionKey";

/// Concrete values a dimension can take. An unconstrained dimension and an empty
/// membership set are both checked as the unpinned target, so only wildcard rules cover them.
fn candidates(m: &Option<Match<String>>) -> Vec<Option<&str>> {
    match m {
        Some(m) if !m.values().is_empty() => m.values().iter().map(|s| Some(s.as_str())).collect(),
        _ => vec![None],
    }
}

/// Every concrete address a predicate can reach that the principal may not `verb`.
/// Membership lists are expanded so each listed value is checked on its own.
fn denied_for(principal: &Principal, p: &Predicate, verb: Verb, out: &mut Vec<DeniedItem>) {
    for ns in candidates(&p.namespace) {
        for col in candidates(&p.collection) {
            for fk in candidates(&p.field_key) {
                let target = AccessTarget { namespace: ns, collection: col, field_key: fk };
                if authorize(&principal.rules, &target, verb) { continue; }
                for ck in candidates(&p.collection_key) {
                    let item = DeniedItem {
                        namespace: ns.map(str::to_string),
                        collection: col.map(str::to_string),
                        collection_key: ck.map(str::to_string),
                        field_key: fk.map(str::to_string),
                    };
                    if !out.contains(&item) { out.push(item); }
                }
            }
        }
    }
}

/// Authorize every predicate; fail with the complete denial list if anything is refused.
fn authorize_all<'a>(principal: &Principal, preds: impl IntoIterator<Item = &'a Predicate>, verb: Verb) -> AppResult<()> {
    let mut denied = Vec::new();
    for p in preds { denied_for(principal, p, verb, &mut denied); }
    if denied.is_empty() { return Ok(()); }
    info!(target: "kvgate::batch", user = %principal.user_id, verb = %verb, denied = denied.len(), "permission denied");
    Err(AppError::forbidden(
        "forbidden".to_string(),
        format!("You do not have '{}' permission for some items.", verb),
        denied,
    ))
}

/// Zip when two or more fields vary, else one membership query.
/// Returns the query and whether it was zipped.
pub fn build_query(body: &RequestBody) -> AppResult<(Query, bool)> {
    if body.multi_valued_fields().len() > 1 {
        let preds = expand(body)?.iter().map(|f| f.to_predicate()).collect();
        Ok((Query { any_of: preds }, true))
    } else {
        Ok((Query::single(membership_predicate(body)?), false))
    }
}

/// Upsert every zipped filter. All-or-nothing with respect to permissions.
pub fn set_items(store: &ItemStore, principal: &Principal, body: &RequestBody) -> AppResult<UpsertResult> {
    let filters = expand(body)?;
    if filters.is_empty() {
        return Err(AppError::user(
            "missing_fields",
            "All fields (namespace, collection, collectionKey, fieldKey, value) must contain values.",
        ));
    }
    let mut items = Vec::with_capacity(filters.len());
    for (i, f) in filters.iter().enumerate() {
        match (f.address(), f.value.clone()) {
            (Some(addr), Some(value)) => items.push((addr, value)),
            _ => {
                return Err(AppError::user(
                    "missing_fields".to_string(),
                    format!("item {} is missing one of namespace, collection, collectionKey, fieldKey, value", i),
                ))
            }
        }
    }
    let preds: Vec<Predicate> = filters.iter().map(|f| f.to_predicate()).collect();
    authorize_all(principal, &preds, Verb::Set)?;
    let res = store.bulk_upsert(items);
    debug!(target: "kvgate::batch", user = %principal.user_id, items = filters.len(), affected = res.affected(), "set");
    Ok(res)
}

/// Look up matching items and fold them into the nested response shape.
pub fn get_items(store: &ItemStore, principal: &Principal, body: &RequestBody) -> AppResult<Nested> {
    let (query, zipped) = build_query(body)?;
    authorize_all(principal, &query.any_of, Verb::Get)?;
    let found = store.find(&query);
    debug!(target: "kvgate::batch", user = %principal.user_id, zipped, predicates = query.any_of.len(), hits = found.len(), "get");

    let mut out = Nested::new();
    for e in found {
        let bucket = out.entry(e.address.namespace).or_default().entry(e.address.collection).or_default();
        // First collection key seen wins; later ones only overwrite field slots.
        bucket.entry(COLLECTION_KEY_SLOT).or_insert_with(|| JsonValue::String(e.address.collection_key));
        bucket.insert(e.address.field_key, e.value);
    }
    Ok(out)
}

/// Delete every matching item. Matching nothing is not an error.
pub fn remove_items(store: &ItemStore, principal: &Principal, body: &RequestBody) -> AppResult<usize> {
    // Lengths are validated first so mismatched arrays report as such.
    let (query, zipped) = build_query(body)?;
    if body.is_unconstrained() || body.has_empty_sequence() || query.any_of.is_empty() {
        return Err(AppError::user("no_combinations", "No valid combinations for removal."));
    }
    authorize_all(principal, &query.any_of, Verb::Remove)?;
    let removed = store.delete_many(&query);
    debug!(target: "kvgate::batch", user = %principal.user_id, zipped, removed, "remove");
    Ok(removed)
}

#[cfg(test)]
#[path = "batch_tests.rs"]
mod batch_tests;
