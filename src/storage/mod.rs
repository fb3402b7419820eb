//!
//! kvgate storage engine
//! ----------------------
//! In-memory item store keyed by the four-part item address
//! `(namespace, collection, collectionKey, fieldKey)`. The map key *is* the address,
//! so at most one entity exists per address and writes always overwrite in place.
//!
//! Key responsibilities:
//! - Bulk upsert with created/modified accounting.
//! - Lookup and deletion by a logical OR of field predicates.
//! - Optional periodic snapshotting to `<data dir>/items.snapshot` (see `snapshot`).
//!
//! `ItemStore` is cheap to clone; clones share the same map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

mod snapshot;

/// Errors raised by the storage engine. In-memory operations cannot fail; these all
/// come from snapshot persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encode error: {0}")]
    Encode(String),
    #[error("snapshot decode error: {0}")]
    Decode(String),
    #[error("value serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Unique address of one stored value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemAddress {
    pub namespace: String,
    pub collection: String,
    pub collection_key: String,
    pub field_key: String,
}

impl ItemAddress {
    pub fn new(namespace: impl Into<String>, collection: impl Into<String>, collection_key: impl Into<String>, field_key: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), collection: collection.into(), collection_key: collection_key.into(), field_key: field_key.into() }
    }
}

/// A stored value together with its address and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    #[serde(flatten)]
    pub address: ItemAddress,
    pub value: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Entry {
    value: JsonValue,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Equality or set membership on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Match<T> {
    Eq(T),
    In(Vec<T>),
}

impl<T: PartialEq> Match<T> {
    pub fn matches(&self, v: &T) -> bool {
        match self {
            Match::Eq(x) => x == v,
            Match::In(xs) => xs.contains(v),
        }
    }

    /// Candidate values, for callers that need to enumerate what a predicate can hit.
    pub fn values(&self) -> &[T] {
        match self {
            Match::Eq(x) => std::slice::from_ref(x),
            Match::In(xs) => xs.as_slice(),
        }
    }
}

/// Conjunction over fields; `None` leaves a field unconstrained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    pub namespace: Option<Match<String>>,
    pub collection: Option<Match<String>>,
    pub collection_key: Option<Match<String>>,
    pub field_key: Option<Match<String>>,
    pub value: Option<Match<JsonValue>>,
}

impl Predicate {
    fn matches(&self, addr: &ItemAddress, value: &JsonValue) -> bool {
        fn ok<T: PartialEq>(m: &Option<Match<T>>, v: &T) -> bool { m.as_ref().map(|m| m.matches(v)).unwrap_or(true) }
        ok(&self.namespace, &addr.namespace)
            && ok(&self.collection, &addr.collection)
            && ok(&self.collection_key, &addr.collection_key)
            && ok(&self.field_key, &addr.field_key)
            && ok(&self.value, value)
    }

    /// Single namespace this predicate is pinned to, used to narrow the scan range.
    fn pinned_namespace(&self) -> Option<&str> {
        match &self.namespace {
            Some(Match::Eq(ns)) => Some(ns.as_str()),
            _ => None,
        }
    }
}

/// Logical OR of predicates. An empty query matches nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub any_of: Vec<Predicate>,
}

impl Query {
    pub fn single(p: Predicate) -> Self { Self { any_of: vec![p] } }

    pub fn matches(&self, addr: &ItemAddress, value: &JsonValue) -> bool {
        self.any_of.iter().any(|p| p.matches(addr, value))
    }
}

/// Created vs. modified counts from a bulk upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertResult {
    pub created: usize,
    pub modified: usize,
}

impl UpsertResult {
    pub fn affected(&self) -> usize { self.created + self.modified }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PersistenceSettings {
    /// Enable periodic snapshotting to disk
    #[serde(default)]
    pub enabled: bool,
    /// Interval in milliseconds between snapshots
    #[serde(default = "PersistenceSettings::default_interval_ms")]
    pub interval_ms: u64,
}

impl PersistenceSettings {
    fn default_interval_ms() -> u64 { 5_000 }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self { enabled: false, interval_ms: Self::default_interval_ms() }
    }
}

/// The item store.
#[derive(Clone)]
pub struct ItemStore {
    dir: Option<PathBuf>,
    settings: PersistenceSettings,
    map: Arc<RwLock<BTreeMap<ItemAddress, Entry>>>,
    /// Set on every mutation, cleared by a successful snapshot.
    dirty: Arc<Mutex<bool>>,
    persist_started: Arc<Mutex<bool>>,
    /// Serializes snapshot writers; they share one temp file.
    save_lock: Arc<Mutex<()>>,
}

impl ItemStore {
    /// Volatile store with no backing directory.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            settings: PersistenceSettings::default(),
            map: Arc::new(RwLock::new(BTreeMap::new())),
            dirty: Arc::new(Mutex::new(false)),
            persist_started: Arc::new(Mutex::new(false)),
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Open a store under `dir`, loading its snapshot if one exists.
    pub fn open(dir: impl AsRef<Path>, settings: PersistenceSettings) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let s = Self { dir: Some(dir), settings, ..Self::in_memory() };
        s.load_snapshot()?;
        info!(target: "kvgate::store", items = s.len(), persistence = s.settings.enabled, "item store opened");
        Ok(s)
    }

    pub fn dir(&self) -> Option<&Path> { self.dir.as_deref() }

    pub fn len(&self) -> usize { self.map.read().len() }

    pub fn is_empty(&self) -> bool { self.map.read().is_empty() }

    fn mark_dirty(&self) { *self.dirty.lock() = true; }

    /// Upsert every `(address, value)` pair in order. A write whose value equals the
    /// stored one counts as neither created nor modified.
    pub fn bulk_upsert(&self, items: Vec<(ItemAddress, JsonValue)>) -> UpsertResult {
        let now = Utc::now();
        let mut out = UpsertResult::default();
        let mut w = self.map.write();
        for (addr, value) in items {
            match w.get_mut(&addr) {
                Some(ent) if ent.value == value => {}
                Some(ent) => {
                    ent.value = value;
                    ent.updated_at = now;
                    out.modified += 1;
                }
                None => {
                    w.insert(addr, Entry { value, created_at: now, updated_at: now });
                    out.created += 1;
                }
            }
        }
        drop(w);
        if out.affected() > 0 { self.mark_dirty(); }
        debug!(target: "kvgate::store", created = out.created, modified = out.modified, "bulk_upsert");
        out
    }

    /// Scan candidates for one predicate, restricted to a namespace range when pinned.
    fn scan<'a>(map: &'a BTreeMap<ItemAddress, Entry>, p: &'a Predicate) -> Box<dyn Iterator<Item = (&'a ItemAddress, &'a Entry)> + 'a> {
        match p.pinned_namespace() {
            Some(ns) => {
                let start = ItemAddress::new(ns, "", "", "");
                Box::new(map.range(start..).take_while(move |(a, _)| a.namespace == ns))
            }
            None => Box::new(map.iter()),
        }
    }

    /// Entities matching the query, in address order, each reported once.
    pub fn find(&self, query: &Query) -> Vec<Entity> {
        let r = self.map.read();
        let mut hits: BTreeMap<&ItemAddress, &Entry> = BTreeMap::new();
        for p in query.any_of.iter() {
            for (addr, ent) in Self::scan(&r, p) {
                if p.matches(addr, &ent.value) { hits.insert(addr, ent); }
            }
        }
        hits.into_iter()
            .map(|(addr, ent)| Entity { address: addr.clone(), value: ent.value.clone(), created_at: ent.created_at, updated_at: ent.updated_at })
            .collect()
    }

    /// Delete every entity matching the query. Returns the number removed.
    pub fn delete_many(&self, query: &Query) -> usize {
        let mut w = self.map.write();
        let before = w.len();
        w.retain(|addr, ent| !query.matches(addr, &ent.value));
        let removed = before - w.len();
        drop(w);
        if removed > 0 { self.mark_dirty(); }
        debug!(target: "kvgate::store", removed, "delete_many");
        removed
    }

    /// Remove everything. Persists the empty state right away when backed by disk.
    pub fn clear(&self) -> StoreResult<usize> {
        let removed = {
            let mut w = self.map.write();
            let n = w.len();
            w.clear();
            n
        };
        self.mark_dirty();
        if self.dir.is_some() { self.save_snapshot()?; }
        warn!(target: "kvgate::store", removed, "item store cleared");
        Ok(removed)
    }

    /// Spawn the background snapshot thread once, if persistence is enabled.
    pub fn ensure_persistence_loop(&self) {
        let mut started = self.persist_started.lock();
        if *started { return; }
        *started = true;
        drop(started);
        if !self.settings.enabled || self.dir.is_none() || self.settings.interval_ms == 0 { return; }
        let interval = Duration::from_millis(self.settings.interval_ms);
        let this = self.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            if !*this.dirty.lock() { continue; }
            if let Err(e) = this.save_snapshot() {
                tracing::error!(target: "kvgate::store", "snapshot failed: {e}");
            }
        });
    }
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod storage_tests;
