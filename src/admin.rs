//! Administrative escape hatch: wipe every item and every identity record.
//! Gated by a static shared secret, not by permission rules.

use serde::Serialize;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::identity::{IdentityDirectory, SessionManager};
use crate::storage::ItemStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearOutcome {
    pub deleted_items: usize,
    pub deleted_identities: usize,
    pub revoked_sessions: usize,
}

/// Byte-wise comparison that does not stop at the first mismatch.
fn secrets_match(expected: &str, provided: &str) -> bool {
    let (a, b) = (expected.as_bytes(), provided.as_bytes());
    if a.len() != b.len() { return false; }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check the shared secret. An unset or empty configured secret disables the operation.
pub fn check_secret(configured: Option<&str>, provided: Option<&str>) -> AppResult<()> {
    match (configured, provided) {
        (Some(expected), Some(given)) if !expected.is_empty() && secrets_match(expected, given) => Ok(()),
        _ => Err(AppError::auth("clear_all_denied", "Authentication Failed.")),
    }
}

/// Best-effort full wipe: items first, then identities, then live sessions.
pub fn clear_all(store: &ItemStore, identities: &IdentityDirectory, sessions: &SessionManager) -> AppResult<ClearOutcome> {
    let deleted_items = store.clear()?;
    let deleted_identities = identities.clear()?;
    let revoked_sessions = sessions.revoke_all();
    warn!(target: "kvgate::admin", deleted_items, deleted_identities, revoked_sessions, "bulk clear executed");
    Ok(ClearOutcome { deleted_items, deleted_identities, revoked_sessions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityRecord, Principal};
    use crate::storage::ItemAddress;
    use serde_json::json;

    #[test]
    fn secret_gate() {
        assert!(check_secret(Some("s3cret"), Some("s3cret")).is_ok());
        assert_eq!(check_secret(Some("s3cret"), Some("s3cre")).unwrap_err().http_status(), 401);
        assert!(check_secret(Some("s3cret"), None).is_err());
        assert!(check_secret(None, Some("")).is_err());
        assert!(check_secret(Some(""), Some("")).is_err());
    }

    #[test]
    fn clear_all_wipes_items_identities_and_sessions() {
        let store = ItemStore::in_memory();
        store.bulk_upsert(vec![(ItemAddress::new("a", "b", "c", "d"), json!(1))]);
        let ids = IdentityDirectory::in_memory();
        ids.insert(IdentityRecord { user_id: "u".into(), token: None, rules: vec![] }).unwrap();
        let sm = SessionManager::default();
        sm.issue(Principal::new("u", vec![])).unwrap();

        let out = clear_all(&store, &ids, &sm).unwrap();
        assert_eq!(out, ClearOutcome { deleted_items: 1, deleted_identities: 1, revoked_sessions: 1 });
        assert!(store.is_empty() && ids.is_empty());
        assert_eq!(sm.active(), 0);
    }
}
