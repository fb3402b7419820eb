//! Snapshot persistence for `ItemStore`: bincode-encoded, written to a temp file and
//! renamed into place. Values are stored as serialized JSON bytes since bincode cannot
//! round-trip `serde_json::Value` directly.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::{Entry, ItemAddress, ItemStore, StoreError, StoreResult};

const SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_FILE: &str = "items.snapshot";

#[derive(Serialize, Deserialize)]
struct SnapEntry {
    namespace: String,
    collection: String,
    collection_key: String,
    field_key: String,
    value: Vec<u8>,
    created_ms: i64,
    updated_ms: i64,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    created_ms: i64,
    entries: Vec<SnapEntry>,
}

fn from_millis(ms: i64) -> DateTime<Utc> { DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default() }

impl ItemStore {
    fn snapshot_path(&self) -> Option<PathBuf> { self.dir.as_ref().map(|d| d.join(SNAPSHOT_FILE)) }

    /// Write the current contents to disk. No-op for in-memory stores.
    pub fn save_snapshot(&self) -> StoreResult<()> {
        let Some(path) = self.snapshot_path() else { return Ok(()); };
        let _guard = self.save_lock.lock();
        let res = self.write_snapshot(&path);
        if res.is_err() { self.mark_dirty(); }
        res
    }

    fn write_snapshot(&self, path: &Path) -> StoreResult<()> {
        let entries = {
            let r = self.map.read();
            let mut out = Vec::with_capacity(r.len());
            for (addr, ent) in r.iter() {
                out.push(SnapEntry {
                    namespace: addr.namespace.clone(),
                    collection: addr.collection.clone(),
                    collection_key: addr.collection_key.clone(),
                    field_key: addr.field_key.clone(),
                    value: serde_json::to_vec(&ent.value)?,
                    created_ms: ent.created_at.timestamp_millis(),
                    updated_ms: ent.updated_at.timestamp_millis(),
                });
            }
            // Cleared under the read lock so a concurrent write re-marks it afterwards.
            *self.dirty.lock() = false;
            out
        };
        let count = entries.len();
        let snap = Snapshot { version: SNAPSHOT_VERSION, created_ms: Utc::now().timestamp_millis(), entries };
        let bytes = bincode::serialize(&snap).map_err(|e| StoreError::Encode(e.to_string()))?;
        let tmp = path.with_extension("snapshot.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        tracing::debug!(target: "kvgate::store", entries = count, path = %path.display(), "snapshot saved");
        Ok(())
    }

    /// Replace in-memory contents with the on-disk snapshot, if any.
    pub fn load_snapshot(&self) -> StoreResult<()> {
        let Some(path) = self.snapshot_path() else { return Ok(()); };
        if !path.exists() { return Ok(()); }
        let bytes = std::fs::read(&path)?;
        let snap: Snapshot = bincode::deserialize(&bytes).map_err(|e| StoreError::Decode(e.to_string()))?;
        if snap.version != SNAPSHOT_VERSION {
            return Err(StoreError::Decode(format!("unsupported snapshot version {}", snap.version)));
        }
        let mut w = self.map.write();
        w.clear();
        for e in snap.entries.into_iter() {
            let value: JsonValue = serde_json::from_slice(&e.value)?;
            let addr = ItemAddress { namespace: e.namespace, collection: e.collection, collection_key: e.collection_key, field_key: e.field_key };
            w.insert(addr, Entry { value, created_at: from_millis(e.created_ms), updated_at: from_millis(e.updated_ms) });
        }
        Ok(())
    }
}
