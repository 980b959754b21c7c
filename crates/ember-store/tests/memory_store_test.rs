// Integration tests for the in-memory backend through the Reference API.

#![allow(clippy::unwrap_used)]

use indexmap::IndexMap;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use ember_store::{EventKind, MemoryStore, StoreEvent};

fn pairs(entries: &[(&str, Value)]) -> IndexMap<String, Value> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

async fn next_event(sub: &mut ember_store::Subscription) -> StoreEvent {
    sub.recv().await.unwrap().unwrap()
}

// ── Reads and writes ────────────────────────────────────────────────

#[tokio::test]
async fn set_and_read_roundtrip() {
    let store = MemoryStore::new();
    let user = store.root().child("users/alice").unwrap();

    user.set(json!({"name": "Alice", "age": 30})).await.unwrap();
    assert_eq!(
        user.once_value().await.unwrap(),
        Some(json!({"name": "Alice", "age": 30}))
    );
    assert_eq!(
        user.child("name").unwrap().once_value().await.unwrap(),
        Some(json!("Alice"))
    );
}

#[tokio::test]
async fn nulls_and_empty_objects_are_pruned() {
    let store = MemoryStore::new();
    let root = store.root();
    let loc = root.child("config").unwrap();

    loc.set(json!({"a": null, "b": {}})).await.unwrap();
    assert_eq!(loc.once_value().await.unwrap(), None);

    loc.set(json!({"a": 1, "b": null})).await.unwrap();
    assert_eq!(loc.once_value().await.unwrap(), Some(json!({"a": 1})));
}

#[tokio::test]
async fn update_applies_all_pairs_atomically() {
    let store = MemoryStore::new();
    let user = store.root().child("users/bob").unwrap();
    user.set(json!({"name": "Bob", "age": 40})).await.unwrap();

    user.update(pairs(&[
        ("name", json!("Robert")),
        ("age", json!(null)),
        ("address/city", json!("Springfield")),
    ]))
    .await
    .unwrap();

    assert_eq!(
        user.once_value().await.unwrap(),
        Some(json!({"name": "Robert", "address": {"city": "Springfield"}}))
    );
}

#[tokio::test]
async fn update_rejects_invalid_keys_without_writing() {
    let store = MemoryStore::new();
    let user = store.root().child("users/bob").unwrap();
    user.set(json!({"name": "Bob"})).await.unwrap();

    let result = user
        .update(pairs(&[("name", json!("Robert")), ("", json!(1))]))
        .await;
    assert!(result.is_err());

    // Nothing was applied.
    assert_eq!(
        user.once_value().await.unwrap(),
        Some(json!({"name": "Bob"}))
    );
}

#[tokio::test]
async fn remove_deletes_subtree() {
    let store = MemoryStore::new();
    let root = store.root();
    root.child("a/b/c").unwrap().set(json!(1)).await.unwrap();
    root.child("a/b").unwrap().remove().await.unwrap();
    assert_eq!(root.child("a").unwrap().once_value().await.unwrap(), None);
}

// ── Reference navigation ────────────────────────────────────────────

#[test]
fn reference_navigation_and_identity() {
    let store = MemoryStore::new();
    let root = store.root();

    assert_eq!(root.path(), "/");
    assert_eq!(root.key(), None);
    assert!(root.parent().is_none());

    let child = root.child("users/alice").unwrap();
    assert_eq!(child.path(), "/users/alice");
    assert_eq!(child.key(), Some("alice"));
    assert_eq!(child.parent().unwrap().path(), "/users");
    assert_eq!(child.tree_root(), root);

    // Same path on the same backend compares equal.
    assert_eq!(child, root.child("users").unwrap().child("alice").unwrap());

    // Same path on a different backend does not.
    let other = MemoryStore::new();
    assert_ne!(child, other.root().child("users/alice").unwrap());

    assert!(root.child("").is_err());
    assert!(root.child("a//b").is_err());
}

// ── Subscriptions ───────────────────────────────────────────────────

#[tokio::test]
async fn value_subscription_delivers_initial_snapshot_even_when_absent() {
    let store = MemoryStore::new();
    let loc = store.root().child("missing").unwrap();

    let mut sub = loc.subscribe(EventKind::Value);
    let event = next_event(&mut sub).await;
    assert_eq!(event.kind, EventKind::Value);
    assert_eq!(event.value, None);
}

#[tokio::test]
async fn value_subscription_tracks_changes() {
    let store = MemoryStore::new();
    let loc = store.root().child("counter").unwrap();
    let mut sub = loc.subscribe(EventKind::Value);
    assert_eq!(next_event(&mut sub).await.value, None);

    loc.set(json!(1)).await.unwrap();
    assert_eq!(next_event(&mut sub).await.value, Some(json!(1)));

    loc.set(json!(2)).await.unwrap();
    assert_eq!(next_event(&mut sub).await.value, Some(json!(2)));

    loc.remove().await.unwrap();
    assert_eq!(next_event(&mut sub).await.value, None);
}

#[tokio::test]
async fn value_subscription_sees_descendant_writes() {
    let store = MemoryStore::new();
    let loc = store.root().child("doc").unwrap();
    let mut sub = loc.subscribe(EventKind::Value);
    let _ = next_event(&mut sub).await;

    loc.child("nested/leaf")
        .unwrap()
        .set(json!(true))
        .await
        .unwrap();
    assert_eq!(
        next_event(&mut sub).await.value,
        Some(json!({"nested": {"leaf": true}}))
    );
}

#[tokio::test]
async fn child_added_replays_existing_children_then_tracks_new_ones() {
    let store = MemoryStore::new();
    let coll = store.root().child("items").unwrap();
    coll.set(json!({"a": 1, "b": 2})).await.unwrap();

    let mut sub = coll.subscribe(EventKind::ChildAdded);
    let first = next_event(&mut sub).await;
    let second = next_event(&mut sub).await;
    assert_eq!(first.key.as_deref(), Some("a"));
    assert_eq!(first.value, Some(json!(1)));
    assert_eq!(second.key.as_deref(), Some("b"));

    coll.child("c").unwrap().set(json!(3)).await.unwrap();
    let third = next_event(&mut sub).await;
    assert_eq!(third.key.as_deref(), Some("c"));
    assert_eq!(third.value, Some(json!(3)));
}

#[tokio::test]
async fn child_removed_carries_last_value() {
    let store = MemoryStore::new();
    let coll = store.root().child("items").unwrap();
    coll.set(json!({"a": 1, "b": 2})).await.unwrap();

    let mut sub = coll.subscribe(EventKind::ChildRemoved);
    coll.child("a").unwrap().remove().await.unwrap();

    let event = next_event(&mut sub).await;
    assert_eq!(event.kind, EventKind::ChildRemoved);
    assert_eq!(event.key.as_deref(), Some("a"));
    assert_eq!(event.value, Some(json!(1)));
}

#[tokio::test]
async fn dropped_subscription_stops_receiving() {
    let store = MemoryStore::new();
    let loc = store.root().child("x").unwrap();
    let sub = loc.subscribe(EventKind::Value);
    drop(sub);

    // The write must not panic or leak a watcher.
    loc.set(json!(1)).await.unwrap();
}

// ── Transactions ────────────────────────────────────────────────────

#[tokio::test]
async fn transaction_commits_when_absent() {
    let store = MemoryStore::new();
    let loc = store.root().child("session").unwrap();

    let result = loc
        .transaction(|current| match current {
            None => Some(json!({"owner": "alice"})),
            Some(_) => None,
        })
        .await
        .unwrap();

    assert!(result.committed);
    assert_eq!(result.snapshot, Some(json!({"owner": "alice"})));
}

#[tokio::test]
async fn conflicting_transactions_have_one_winner() {
    let store = MemoryStore::new();
    let loc = store.root().child("session").unwrap();

    let create = |name: &'static str| {
        let loc = loc.clone();
        async move {
            loc.transaction(move |current| match current {
                None => Some(json!({"owner": name})),
                Some(_) => None,
            })
            .await
            .unwrap()
        }
    };

    let (a, b) = tokio::join!(create("alice"), create("bob"));
    assert_ne!(a.committed, b.committed);

    // Both observe the single committed value.
    assert_eq!(a.snapshot, b.snapshot);
    assert_eq!(loc.once_value().await.unwrap(), a.snapshot);
}

// ── Push ids ────────────────────────────────────────────────────────

#[tokio::test]
async fn push_writes_under_generated_key() {
    let store = MemoryStore::new();
    let coll = store.root().child("log").unwrap();

    let first = coll.push(json!("one")).await.unwrap();
    let second = coll.push(json!("two")).await.unwrap();

    assert_ne!(first.key(), second.key());
    assert!(second.key().unwrap() > first.key().unwrap());
    assert_eq!(first.once_value().await.unwrap(), Some(json!("one")));

    let parent = coll.once_value().await.unwrap().unwrap();
    assert_eq!(parent.as_object().unwrap().len(), 2);
}
