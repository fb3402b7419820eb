//! User/identity records: who exists and which raw rules they carry.
//! Loaded from `identities.json` in the data directory; the bulk-clear path wipes it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use super::principal::Principal;
use super::session::SessionManager;

pub const IDENTITIES_FILE: &str = "identities.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    #[serde(alias = "id")]
    pub user_id: String,
    /// Pre-shared bearer token registered at startup, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, alias = "access")]
    pub rules: Vec<JsonValue>,
}

impl IdentityRecord {
    pub fn principal(&self) -> Principal { Principal::from_raw_rules(self.user_id.clone(), &self.rules) }
}

#[derive(Clone, Default)]
pub struct IdentityDirectory {
    path: Option<PathBuf>,
    records: Arc<RwLock<BTreeMap<String, IdentityRecord>>>,
}

impl IdentityDirectory {
    pub fn in_memory() -> Self { Self::default() }

    /// Open the directory file under `dir`, creating nothing until the first save.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(IDENTITIES_FILE);
        let s = Self { path: Some(path.clone()), ..Self::default() };
        if path.exists() {
            let recs = read_records(&path)?;
            s.extend(recs);
        }
        Ok(s)
    }

    /// Merge records from an external seed file and persist the result.
    pub fn import(&self, file: impl AsRef<Path>) -> Result<usize> {
        let recs = read_records(file.as_ref())?;
        let n = recs.len();
        self.extend(recs);
        self.save()?;
        info!(target: "kvgate::identity", imported = n, file = %file.as_ref().display(), "identities imported");
        Ok(n)
    }

    fn extend(&self, recs: Vec<IdentityRecord>) {
        let mut w = self.records.write();
        for r in recs { w.insert(r.user_id.clone(), r); }
    }

    pub fn insert(&self, rec: IdentityRecord) -> Result<()> {
        self.records.write().insert(rec.user_id.clone(), rec);
        self.save()
    }

    pub fn get(&self, user_id: &str) -> Option<IdentityRecord> { self.records.read().get(user_id).cloned() }

    /// Record whose pre-shared token equals `token`.
    pub fn find_by_token(&self, token: &str) -> Option<IdentityRecord> {
        if token.is_empty() { return None; }
        self.records.read().values().find(|r| r.token.as_deref() == Some(token)).cloned()
    }

    pub fn len(&self) -> usize { self.records.read().len() }

    pub fn is_empty(&self) -> bool { self.records.read().is_empty() }

    /// Register every record that carries a token with the session manager.
    pub fn register_sessions(&self, sessions: &SessionManager) -> usize {
        let mut n = 0;
        for rec in self.records.read().values() {
            match &rec.token {
                Some(t) if !t.is_empty() => {
                    sessions.issue_with_token(rec.principal(), t.clone());
                    n += 1;
                }
                _ => warn!(target: "kvgate::identity", user = %rec.user_id, "identity has no token; it cannot authenticate"),
            }
        }
        n
    }

    /// Drop every record. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let n = {
            let mut w = self.records.write();
            let n = w.len();
            w.clear();
            n
        };
        self.save()?;
        Ok(n)
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else { return Ok(()); };
        let recs: Vec<IdentityRecord> = self.records.read().values().cloned().collect();
        let bytes = serde_json::to_vec_pretty(&recs)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

fn read_records(path: &Path) -> Result<Vec<IdentityRecord>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading identities from {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing identities in {}", path.display()))
}
