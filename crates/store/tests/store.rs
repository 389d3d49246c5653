#![forbid(unsafe_code)]

mod common;

use std::sync::Arc;

use common::{cm, key, labeled, rv};
use k8s_openapi::api::core::v1::ConfigMap;
use lookout_store::{Indexer, Store, StoreError, Upsert, NAMESPACE_INDEX};

#[test]
fn upsert_reports_previous_object() {
    let store = Store::new();
    assert!(matches!(store.upsert(key("ns", "a"), cm("ns", "a", "1")), Upsert::Inserted));
    match store.upsert(key("ns", "a"), cm("ns", "a", "2")) {
        Upsert::Replaced(old) => assert_eq!(rv(&old), "1"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(rv(&store.get(&key("ns", "a")).unwrap()), "2");
}

#[test]
fn older_version_is_rejected() {
    let store = Store::new();
    store.upsert(key("ns", "a"), cm("ns", "a", "10"));
    match store.upsert(key("ns", "a"), cm("ns", "a", "9")) {
        Upsert::Stale(cached) => assert_eq!(rv(&cached), "10"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(rv(&store.get(&key("ns", "a")).unwrap()), "10");
}

#[test]
fn unordered_versions_use_arrival_order() {
    let store = Store::new();
    store.upsert(key("ns", "a"), cm("ns", "a", "b7"));
    assert!(matches!(store.upsert(key("ns", "a"), cm("ns", "a", "a3")), Upsert::Replaced(_)));
}

#[test]
fn snapshots_do_not_change_after_writes() {
    let store = Store::new();
    store.upsert(key("ns", "a"), cm("ns", "a", "1"));
    let before = store.list();
    let held = store.get(&key("ns", "a")).unwrap();
    store.upsert(key("ns", "a"), cm("ns", "a", "2"));
    store.delete(&key("ns", "a"));
    assert_eq!(before.len(), 1);
    assert_eq!(rv(&before[0]), "1");
    assert_eq!(rv(&held), "1");
    assert!(store.is_empty());
}

#[test]
fn delete_returns_last_state() {
    let store = Store::new();
    store.upsert(key("ns", "a"), cm("ns", "a", "3"));
    let gone = store.delete(&key("ns", "a")).unwrap();
    assert_eq!(rv(&gone), "3");
    assert!(store.delete(&key("ns", "a")).is_none());
    assert!(!store.contains(&key("ns", "a")));
}

#[test]
fn epoch_moves_on_every_mutation() {
    let store = Store::new();
    let rx = store.subscribe_epoch();
    store.upsert(key("ns", "a"), cm("ns", "a", "1"));
    store.upsert(key("ns", "a"), cm("ns", "a", "2"));
    store.upsert(key("ns", "a"), cm("ns", "a", "1"));
    store.delete(&key("ns", "a"));
    assert_eq!(store.epoch(), 3);
    assert_eq!(*rx.borrow(), 3);
}

#[test]
fn namespace_index_tracks_moves() {
    let store = Store::new();
    store.upsert(key("ns1", "a"), cm("ns1", "a", "1"));
    store.upsert(key("ns2", "b"), cm("ns2", "b", "1"));
    assert_eq!(store.index_values(NAMESPACE_INDEX).unwrap(), vec!["ns1".to_string(), "ns2".to_string()]);
    store.delete(&key("ns2", "b"));
    assert_eq!(store.index_values(NAMESPACE_INDEX).unwrap(), vec!["ns1".to_string()]);
    assert_eq!(store.by_index(NAMESPACE_INDEX, "ns2").unwrap().len(), 0);
}

#[test]
fn custom_index_is_backfilled_and_maintained() {
    let store = Store::new();
    store.upsert(key("ns", "a"), labeled("ns", "a", "1", &[("app", "web")]));
    store.add_indexer(
        "app",
        Arc::new(|o: &ConfigMap| o.metadata.labels.as_ref().and_then(|l| l.get("app").cloned()).into_iter().collect::<Vec<String>>()),
    );
    assert_eq!(store.by_index("app", "web").unwrap().len(), 1);

    store.upsert(key("ns", "a"), labeled("ns", "a", "2", &[("app", "db")]));
    assert!(store.by_index("app", "web").unwrap().is_empty());
    assert_eq!(store.by_index("app", "db").unwrap().len(), 1);
    assert_eq!(store.by_index("nope", "x").unwrap_err(), StoreError::UnknownIndex("nope".into()));
}

#[test]
fn indexer_filters_by_selectors() {
    let store = Store::new();
    store.upsert(key("ns1", "a"), labeled("ns1", "a", "1", &[("app", "web"), ("tier", "front")]));
    store.upsert(key("ns1", "b"), labeled("ns1", "b", "1", &[("app", "db")]));
    store.upsert(key("ns2", "c"), labeled("ns2", "c", "1", &[("app", "web")]));
    let idx = Indexer::new(store);

    let web = idx.list_by_labels(&"app=web".parse().unwrap());
    assert_eq!(web.len(), 2);
    let front = idx.list_by_labels(&"app in (web),tier".parse().unwrap());
    assert_eq!(front.len(), 1);
    assert_eq!(idx.list_by_labels(&"".parse().unwrap()).len(), 3);

    let by_ns = idx.list_by_fields(&"metadata.namespace=ns2".parse().unwrap());
    assert_eq!(by_ns.len(), 1);
    assert_eq!(idx.list_namespace("ns1").len(), 2);
    assert!(idx.get_by_name(Some("ns1"), "b").is_some());
    assert!(idx.get_by_name(None, "b").is_none());

    let mut keys: Vec<String> = idx.keys().into_iter().map(|k| k.to_string()).collect();
    keys.sort();
    assert_eq!(keys, vec!["ns1/a", "ns1/b", "ns2/c"]);
}
