// ── Storage backend contract ──
//
// The single seam between the model layer and a concrete store. Every
// remote interaction is a method here; the model layer suspends at this
// boundary and resumes on delivery.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::StoreError;

/// The three structurally significant event kinds a location can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The value at the subscribed location changed (initial snapshot
    /// included -- an absent value still produces a delivery).
    Value,
    /// A child appeared under the subscribed location.
    ChildAdded,
    /// A child vanished from under the subscribed location.
    ChildRemoved,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value => write!(f, "value"),
            Self::ChildAdded => write!(f, "child_added"),
            Self::ChildRemoved => write!(f, "child_removed"),
        }
    }
}

/// One delivery on a subscription.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub kind: EventKind,
    /// The child key, for `ChildAdded` / `ChildRemoved` deliveries.
    pub key: Option<String>,
    /// The value at the subscribed location (`Value`) or the child's
    /// value (`ChildAdded`: new value; `ChildRemoved`: last value).
    pub value: Option<Value>,
}

/// Outcome of a conditional transaction.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    /// Whether this caller's update function actually committed.
    pub committed: bool,
    /// The value at the location after the transaction settled.
    pub snapshot: Option<Value>,
}

/// Update function for [`StoreBackend::transaction`]: receives the current
/// value (`None` if absent) and returns `Some(new)` to commit or `None`
/// to leave the location untouched.
pub type TransactionUpdate = dyn Fn(Option<&Value>) -> Option<Value> + Send + Sync;

/// What a concrete store must provide.
///
/// All writes observe null-pruning: storing `null` (or an object that
/// prunes to nothing) at a location is indistinguishable from removing it.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// One-shot read of the value at `path`.
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value at `path`.
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Atomically apply multiple child writes under `path` in one commit.
    /// Partial application must never be observable.
    async fn update(&self, path: &str, pairs: IndexMap<String, Value>) -> Result<(), StoreError>;

    /// Remove the value at `path`.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    /// Run a conditional transaction at `path`. At most one of a set of
    /// conflicting concurrent callers commits.
    async fn transaction(
        &self,
        path: &str,
        update: &TransactionUpdate,
    ) -> Result<TransactionResult, StoreError>;

    /// Open a durable subscription at `path`. Deliveries for one watcher
    /// are serialized; a `Value` watcher receives its current snapshot
    /// immediately, and a `ChildAdded` watcher receives one delivery per
    /// existing child.
    fn watch(
        &self,
        path: &str,
        kind: EventKind,
    ) -> (u64, mpsc::UnboundedReceiver<Result<StoreEvent, StoreError>>);

    /// Cancel a subscription previously opened with [`watch`](Self::watch).
    fn unwatch(&self, id: u64);

    /// Allocate a unique, time-ordered child key. Synchronous.
    fn generate_id(&self) -> String;
}

/// A live subscription handle. Dropping it cancels the subscription.
pub struct Subscription {
    id: u64,
    backend: Arc<dyn StoreBackend>,
    rx: mpsc::UnboundedReceiver<Result<StoreEvent, StoreError>>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        backend: Arc<dyn StoreBackend>,
        rx: mpsc::UnboundedReceiver<Result<StoreEvent, StoreError>>,
    ) -> Self {
        Self { id, backend, rx }
    }

    /// Wait for the next delivery. `None` means the backend is gone and
    /// no further deliveries will arrive.
    pub async fn recv(&mut self) -> Option<Result<StoreEvent, StoreError>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.backend.unwatch(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
