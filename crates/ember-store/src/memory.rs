// ── In-memory realtime tree store ──
//
// A complete backend with the observable semantics of a replicated
// key-tree: null-pruned values, serialized per-watcher deliveries,
// child diffing, and single-winner transactions. One mutex guards the
// tree and the watcher registry; watchers are notified from a diff of
// the tree before and after each mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::backend::{
    EventKind, StoreBackend, StoreEvent, TransactionResult, TransactionUpdate,
};
use crate::error::StoreError;
use crate::push_id::PushIdState;
use crate::reference::Reference;
use crate::value;

/// In-process store backend.
///
/// Construct with [`MemoryStore::new`] and hand out [`Reference`]s via
/// [`root`](MemoryStore::root).
pub struct MemoryStore {
    state: Mutex<StoreState>,
    push_state: Mutex<PushIdState>,
    next_watch_id: AtomicU64,
}

struct StoreState {
    root: Option<Value>,
    watchers: Vec<Watcher>,
}

struct Watcher {
    id: u64,
    path: String,
    kind: EventKind,
    tx: mpsc::UnboundedSender<Result<StoreEvent, StoreError>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StoreState {
                root: None,
                watchers: Vec::new(),
            }),
            push_state: Mutex::new(PushIdState::default()),
            next_watch_id: AtomicU64::new(1),
        })
    }

    /// A reference to the root of the tree.
    pub fn root(self: &Arc<Self>) -> Reference {
        Reference::root(Arc::clone(self) as Arc<dyn StoreBackend>)
    }

    fn locked(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a mutation to the tree and notify every watcher whose view
    /// changed. Watchers with a dropped receiver are swept here.
    fn mutate(&self, apply: impl FnOnce(&mut Option<Value>)) {
        let mut state = self.locked();
        let before = state.root.clone();
        apply(&mut state.root);
        let after = state.root.clone();
        state.watchers.retain(|watcher| notify(watcher, before.as_ref(), after.as_ref()));
    }
}

/// Deliver the relevant events for one mutation to one watcher.
/// Returns false if the watcher's receiver is gone.
fn notify(watcher: &Watcher, before: Option<&Value>, after: Option<&Value>) -> bool {
    let old = value::value_at(before, &watcher.path);
    let new = value::value_at(after, &watcher.path);
    if old == new {
        return !watcher.tx.is_closed();
    }

    match watcher.kind {
        EventKind::Value => watcher
            .tx
            .send(Ok(StoreEvent {
                kind: EventKind::Value,
                key: None,
                value: new.cloned(),
            }))
            .is_ok(),
        EventKind::ChildAdded => {
            let old_keys = value::child_keys(old);
            for key in value::child_keys(new) {
                if !old_keys.contains(&key) {
                    let child = new.and_then(|v| v.get(&key)).cloned();
                    let sent = watcher.tx.send(Ok(StoreEvent {
                        kind: EventKind::ChildAdded,
                        key: Some(key),
                        value: child,
                    }));
                    if sent.is_err() {
                        return false;
                    }
                }
            }
            true
        }
        EventKind::ChildRemoved => {
            let new_keys = value::child_keys(new);
            for key in value::child_keys(old) {
                if !new_keys.contains(&key) {
                    let child = old.and_then(|v| v.get(&key)).cloned();
                    let sent = watcher.tx.send(Ok(StoreEvent {
                        kind: EventKind::ChildRemoved,
                        key: Some(key),
                        value: child,
                    }));
                    if sent.is_err() {
                        return false;
                    }
                }
            }
            true
        }
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let state = self.locked();
        Ok(value::value_at(state.root.as_ref(), path).cloned())
    }

    async fn set(&self, path: &str, new_value: Value) -> Result<(), StoreError> {
        debug!(path, "set");
        self.mutate(|root| value::write_at(root, path, value::prune(new_value)));
        Ok(())
    }

    async fn update(&self, path: &str, pairs: IndexMap<String, Value>) -> Result<(), StoreError> {
        // Validate every key before touching the tree so the write is
        // all-or-nothing.
        let mut writes = Vec::with_capacity(pairs.len());
        for (child, new_value) in pairs {
            writes.push((value::join(path, &child)?, value::prune(new_value)));
        }
        debug!(path, count = writes.len(), "update");
        self.mutate(|root| {
            for (child_path, new_value) in writes {
                value::write_at(root, &child_path, new_value);
            }
        });
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        debug!(path, "remove");
        self.mutate(|root| value::write_at(root, path, None));
        Ok(())
    }

    async fn transaction(
        &self,
        path: &str,
        update: &TransactionUpdate,
    ) -> Result<TransactionResult, StoreError> {
        // The whole transaction runs under the tree lock, so conflicting
        // concurrent callers are fully serialized: the second caller's
        // update function sees the first one's committed value.
        let mut committed = false;
        self.mutate(|root| {
            let current = value::value_at(root.as_ref(), path).cloned();
            if let Some(proposed) = update(current.as_ref()) {
                value::write_at(root, path, value::prune(proposed));
                committed = true;
            }
        });
        let snapshot = {
            let state = self.locked();
            value::value_at(state.root.as_ref(), path).cloned()
        };
        debug!(path, committed, "transaction");
        Ok(TransactionResult {
            committed,
            snapshot,
        })
    }

    fn watch(
        &self,
        path: &str,
        kind: EventKind,
    ) -> (u64, mpsc::UnboundedReceiver<Result<StoreEvent, StoreError>>) {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.locked();
        let current = value::value_at(state.root.as_ref(), path);

        // Initial deliveries: a value watcher always sees one snapshot,
        // even when the location is absent; a child-added watcher sees
        // one delivery per existing child.
        match kind {
            EventKind::Value => {
                let _ = tx.send(Ok(StoreEvent {
                    kind: EventKind::Value,
                    key: None,
                    value: current.cloned(),
                }));
            }
            EventKind::ChildAdded => {
                for key in value::child_keys(current) {
                    let child = current.and_then(|v| v.get(&key)).cloned();
                    let _ = tx.send(Ok(StoreEvent {
                        kind: EventKind::ChildAdded,
                        key: Some(key),
                        value: child,
                    }));
                }
            }
            EventKind::ChildRemoved => {}
        }

        debug!(path, %kind, id, "watch");
        state.watchers.push(Watcher {
            id,
            path: path.to_owned(),
            kind,
            tx,
        });
        (id, rx)
    }

    fn unwatch(&self, id: u64) {
        let mut state = self.locked();
        state.watchers.retain(|w| w.id != id);
    }

    fn generate_id(&self) -> String {
        self.push_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_id()
    }
}
