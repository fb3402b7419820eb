use super::*;
use serde_json::json;

fn addr(ns: &str, col: &str, ck: &str, fk: &str) -> ItemAddress { ItemAddress::new(ns, col, ck, fk) }

fn eq(s: &str) -> Option<Match<String>> { Some(Match::Eq(s.to_string())) }

#[test]
fn upsert_never_duplicates_an_address() {
    let store = ItemStore::in_memory();
    let a = addr("app", "quizzes", "q1", "data");
    let r1 = store.bulk_upsert(vec![(a.clone(), json!({"a": 1}))]);
    assert_eq!(r1, UpsertResult { created: 1, modified: 0 });
    let r2 = store.bulk_upsert(vec![(a.clone(), json!({"a": 1}))]);
    assert_eq!(r2.affected(), 0, "identical value is neither created nor modified");
    let r3 = store.bulk_upsert(vec![(a.clone(), json!({"a": 2}))]);
    assert_eq!(r3, UpsertResult { created: 0, modified: 1 });
    assert_eq!(store.len(), 1);
    let found = store.find(&Query::single(Predicate { namespace: eq("app"), ..Default::default() }));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value, json!({"a": 2}));
    assert!(found[0].updated_at >= found[0].created_at);
}

#[test]
fn find_or_of_predicates_reports_each_entity_once() {
    let store = ItemStore::in_memory();
    store.bulk_upsert(vec![
        (addr("app", "c", "k", "f1"), json!(1)),
        (addr("app", "c", "k", "f2"), json!(2)),
        (addr("other", "c", "k", "f1"), json!(3)),
    ]);
    let q = Query { any_of: vec![
        Predicate { field_key: eq("f1"), ..Default::default() },
        Predicate { namespace: eq("app"), ..Default::default() },
    ] };
    let found = store.find(&q);
    assert_eq!(found.len(), 3);
    // address order: "app" before "other"
    assert_eq!(found[0].address, addr("app", "c", "k", "f1"));
    assert_eq!(found[2].address.namespace, "other");
}

#[test]
fn namespace_range_scan_does_not_leak_neighbours() {
    let store = ItemStore::in_memory();
    store.bulk_upsert(vec![
        (addr("a", "c", "k", "f"), json!(1)),
        (addr("ab", "c", "k", "f"), json!(2)),
        (addr("b", "c", "k", "f"), json!(3)),
    ]);
    let found = store.find(&Query::single(Predicate { namespace: eq("a"), ..Default::default() }));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].value, json!(1));
}

#[test]
fn value_and_membership_predicates() {
    let store = ItemStore::in_memory();
    store.bulk_upsert(vec![
        (addr("app", "c", "k", "x"), json!("red")),
        (addr("app", "c", "k", "y"), json!("blue")),
        (addr("app", "c", "k", "z"), json!("red")),
    ]);
    let by_value = store.find(&Query::single(Predicate { value: Some(Match::Eq(json!("red"))), ..Default::default() }));
    assert_eq!(by_value.len(), 2);
    let by_keys = store.find(&Query::single(Predicate {
        field_key: Some(Match::In(vec!["x".into(), "y".into()])),
        ..Default::default()
    }));
    assert_eq!(by_keys.len(), 2);
    let none = store.find(&Query::single(Predicate { field_key: Some(Match::In(vec![])), ..Default::default() }));
    assert!(none.is_empty());
}

#[test]
fn empty_query_matches_nothing() {
    let store = ItemStore::in_memory();
    store.bulk_upsert(vec![(addr("app", "c", "k", "f"), json!(1))]);
    assert!(store.find(&Query::default()).is_empty());
    assert_eq!(store.delete_many(&Query::default()), 0);
}

#[test]
fn delete_many_counts_removed() {
    let store = ItemStore::in_memory();
    store.bulk_upsert(vec![
        (addr("app", "c", "k1", "f"), json!(1)),
        (addr("app", "c", "k2", "f"), json!(2)),
        (addr("app", "d", "k1", "f"), json!(3)),
    ]);
    let removed = store.delete_many(&Query::single(Predicate { collection: eq("c"), ..Default::default() }));
    assert_eq!(removed, 2);
    assert_eq!(store.len(), 1);
    assert_eq!(store.delete_many(&Query::single(Predicate { collection: eq("c"), ..Default::default() })), 0);
}

#[test]
fn snapshot_roundtrip_and_clear() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ItemStore::open(tmp.path(), PersistenceSettings::default()).unwrap();
    store.bulk_upsert(vec![
        (addr("app", "c", "k", "obj"), json!({"nested": [1, 2, {"x": null}]})),
        (addr("app", "c", "k", "num"), json!(3.5)),
    ]);
    store.save_snapshot().unwrap();

    let reopened = ItemStore::open(tmp.path(), PersistenceSettings::default()).unwrap();
    assert_eq!(reopened.len(), 2);
    let found = reopened.find(&Query::single(Predicate { field_key: eq("obj"), ..Default::default() }));
    assert_eq!(found[0].value, json!({"nested": [1, 2, {"x": null}]}));

    assert_eq!(reopened.clear().unwrap(), 2);
    let after_clear = ItemStore::open(tmp.path(), PersistenceSettings::default()).unwrap();
    assert!(after_clear.is_empty());
}

#[test]
fn corrupt_snapshot_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("items.snapshot"), b"not a snapshot").unwrap();
    match ItemStore::open(tmp.path(), PersistenceSettings::default()) {
        Err(StoreError::Decode(_)) => {}
        Err(e) => panic!("unexpected error kind: {e}"),
        Ok(_) => panic!("corrupt snapshot must not load"),
    }
}

#[test]
fn concurrent_snapshots_leave_a_loadable_file() {
    let tmp = tempfile::tempdir().unwrap();
    let store = ItemStore::open(tmp.path(), PersistenceSettings::default()).unwrap();
    store.bulk_upsert((0..500).map(|i| (addr("app", "c", "k", &format!("f{i}")), json!({"i": i}))).collect());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let s = store.clone();
            std::thread::spawn(move || { for _ in 0..5 { s.save_snapshot().unwrap(); } })
        })
        .collect();
    for h in handles { h.join().unwrap(); }

    let reopened = ItemStore::open(tmp.path(), PersistenceSettings::default()).unwrap();
    assert_eq!(reopened.len(), 500);
}

#[test]
fn failed_snapshot_stays_dirty() {
    let tmp = tempfile::tempdir().unwrap();
    let data = tmp.path().join("data");
    let store = ItemStore::open(&data, PersistenceSettings::default()).unwrap();
    store.bulk_upsert(vec![(addr("app", "c", "k", "f"), json!(1))]);
    std::fs::remove_dir_all(&data).unwrap();

    assert!(matches!(store.save_snapshot(), Err(StoreError::Io(_))));
    assert!(*store.dirty.lock(), "a failed write must be retried by the persistence loop");

    std::fs::create_dir_all(&data).unwrap();
    store.save_snapshot().unwrap();
    assert!(!*store.dirty.lock());
}
