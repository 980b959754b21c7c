// ── Reference ──
//
// A cheap, cloneable handle to one location in the tree. Holds the
// backend and a normalized absolute path; all store interaction a model
// ever performs goes through one of these.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::backend::{EventKind, StoreBackend, Subscription, TransactionResult};
use crate::error::StoreError;
use crate::value;

/// Handle to a location in a hierarchical JSON tree store.
///
/// References are the unit of identity for synchronized entities: two
/// references are equal when they name the same path on the same backend.
#[derive(Clone)]
pub struct Reference {
    backend: Arc<dyn StoreBackend>,
    path: String,
}

impl Reference {
    /// A reference to the root of a backend's tree.
    pub fn root(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            path: value::ROOT.to_owned(),
        }
    }

    /// A reference to a location below this one. `name` may span multiple
    /// levels (`"a/b"`); empty segments are rejected.
    pub fn child(&self, name: &str) -> Result<Self, StoreError> {
        Ok(Self {
            backend: Arc::clone(&self.backend),
            path: value::join(&self.path, name)?,
        })
    }

    /// The parent location, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        value::parent(&self.path).map(|p| Self {
            backend: Arc::clone(&self.backend),
            path: p.to_owned(),
        })
    }

    /// A reference to the root of this reference's tree.
    pub fn tree_root(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            path: value::ROOT.to_owned(),
        }
    }

    /// The last path segment, or `None` at the root.
    pub fn key(&self) -> Option<&str> {
        value::key(&self.path)
    }

    /// The absolute path of this reference.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Allocate a unique, time-ordered child key. Synchronous -- no
    /// round trip is needed to obtain the key itself.
    pub fn generate_id(&self) -> String {
        self.backend.generate_id()
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// One-shot read of the current value (`None` if absent).
    pub async fn once_value(&self) -> Result<Option<Value>, StoreError> {
        self.backend.read(&self.path).await
    }

    /// Open a durable subscription for `kind` events at this location.
    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        let (id, rx) = self.backend.watch(&self.path, kind);
        Subscription::new(id, Arc::clone(&self.backend), rx)
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Replace the value at this location.
    pub async fn set(&self, new_value: Value) -> Result<(), StoreError> {
        self.backend.set(&self.path, new_value).await
    }

    /// Atomically apply multiple child writes in one commit.
    pub async fn update(&self, pairs: IndexMap<String, Value>) -> Result<(), StoreError> {
        self.backend.update(&self.path, pairs).await
    }

    /// Remove the value at this location.
    pub async fn remove(&self) -> Result<(), StoreError> {
        self.backend.remove(&self.path).await
    }

    /// Run a conditional transaction at this location. The update
    /// function sees the current value and returns `Some(new)` to commit
    /// or `None` to leave the location untouched.
    pub async fn transaction<F>(&self, update: F) -> Result<TransactionResult, StoreError>
    where
        F: Fn(Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.backend.transaction(&self.path, &update).await
    }

    /// Write a value under a freshly generated key, returning the new
    /// child reference.
    pub async fn push(&self, new_value: Value) -> Result<Self, StoreError> {
        let child = self.child(&self.generate_id())?;
        child.set(new_value).await?;
        Ok(child)
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.backend, &other.backend) && self.path == other.path
    }
}

impl Eq for Reference {}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference").field("path", &self.path).finish()
    }
}
