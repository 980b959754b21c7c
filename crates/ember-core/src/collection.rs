// ── Synchronized collection ──
//
// A collection mirrors a keyed set of uniform members. Loading is
// value-first: the initial snapshot is read in full before the child
// subscriptions open, so `count` and `keys` are never observed
// half-populated. Members are instantiated lazily per access.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::join_all;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use ember_store::{EventKind, Reference};

use crate::compiled::FieldKind;
use crate::entity::Entity;
use crate::error::CoreError;
use crate::model::{Model, ModelInner};
use crate::triggers::TriggerBus;

/// A member's value as seen through the generic accessor.
#[derive(Clone)]
pub enum Member {
    Primitive(Value),
    Entity(Entity),
}

impl Member {
    pub fn as_primitive(&self) -> Option<&Value> {
        match self {
            Self::Primitive(value) => Some(value),
            Self::Entity(_) => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Entity(entity) => Some(entity),
            Self::Primitive(_) => None,
        }
    }
}

/// Callback for membership changes; receives the affected key.
pub type KeyCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct CollectionShared {
    /// Shape of every member; `None` for an untyped primitive collection.
    member: Option<FieldKind>,
    child_added: Mutex<Option<KeyCallback>>,
    child_removed: Mutex<Option<KeyCallback>>,
}

/// A synchronized keyed set of uniform members.
///
/// Cheap to clone; all clones share one synchronized state. Construction
/// must happen inside a tokio runtime.
#[derive(Clone)]
pub struct Collection {
    model: Model,
    shared: Arc<CollectionShared>,
}

impl Collection {
    /// An untyped collection of primitive values at `reference`.
    pub fn new(reference: Reference, bus: Arc<TriggerBus>) -> Self {
        Self::build(reference, bus, None)
    }

    pub(crate) fn build(
        reference: Reference,
        bus: Arc<TriggerBus>,
        member: Option<FieldKind>,
    ) -> Self {
        let collection = Self {
            model: Model::build(reference, bus, None),
            shared: Arc::new(CollectionShared {
                member,
                child_added: Mutex::new(None),
                child_removed: Mutex::new(None),
            }),
        };
        collection.spawn_collection_monitor();
        collection.model.spawn_load_chain();
        collection
    }

    /// Read the initial snapshot, then track membership through child
    /// subscriptions. Replayed children are deduplicated against the
    /// snapshot.
    fn spawn_collection_monitor(&self) {
        let reference = self.model.reference().clone();
        let weak_model = Arc::downgrade(self.model.inner());
        let weak_shared = Arc::downgrade(&self.shared);
        let task = tokio::spawn(async move {
            match reference.once_value().await {
                Ok(value) => {
                    let Some(inner) = weak_model.upgrade() else {
                        return;
                    };
                    inner.apply_snapshot(value);
                }
                Err(err) => {
                    if let Some(inner) = weak_model.upgrade() {
                        inner.fail_load(err.to_string());
                    }
                    return;
                }
            }
            let mut added = reference.subscribe(EventKind::ChildAdded);
            let mut removed = reference.subscribe(EventKind::ChildRemoved);
            loop {
                let event = tokio::select! {
                    event = added.recv() => event,
                    event = removed.recv() => event,
                };
                let Some(Ok(event)) = event else { break };
                let (Some(inner), Some(shared)) = (weak_model.upgrade(), weak_shared.upgrade())
                else {
                    break;
                };
                let Some(key) = event.key else { continue };
                match event.kind {
                    EventKind::ChildAdded => {
                        handle_child_added(&inner, &shared, &key, event.value);
                    }
                    EventKind::ChildRemoved => {
                        handle_child_removed(&inner, &shared, &key);
                    }
                    EventKind::Value => {}
                }
            }
        });
        self.model.inner().push_task(task);
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn reference(&self) -> &Reference {
        self.model.reference()
    }

    /// The last path segment, or `None` at the tree root.
    pub fn key(&self) -> Option<&str> {
        self.model.key()
    }

    /// The number of members. Zero for an absent collection.
    pub fn count(&self) -> Result<usize, CoreError> {
        self.model.inner().ensure_loaded()?;
        Ok(self.model.inner().locked_state().child_count)
    }

    /// The member keys, in snapshot order.
    pub fn keys(&self) -> Result<Vec<String>, CoreError> {
        self.model.inner().ensure_loaded()?;
        let state = self.model.inner().locked_state();
        Ok(state
            .storage
            .as_ref()
            .and_then(Value::as_object)
            .map_or_else(Vec::new, |map| map.keys().cloned().collect()))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool, CoreError> {
        self.model.inner().ensure_loaded()?;
        let state = self.model.inner().locked_state();
        Ok(state.storage.as_ref().and_then(|s| s.get(key)).is_some())
    }

    /// Whether the collection currently has any members.
    pub fn exists(&self) -> Result<bool, CoreError> {
        Ok(self.count()? > 0)
    }

    /// Whether unsaved buffered writes exist.
    pub fn has_changes(&self) -> bool {
        self.model.has_changes()
    }

    /// Resolve once the initial snapshot is applied.
    pub async fn when_loaded(&self) -> Result<Self, CoreError> {
        self.model.when_loaded().await?;
        Ok(self.clone())
    }

    // ── Member access ───────────────────────────────────────────────

    /// The member at `key`, primitive or entity.
    pub fn get(&self, key: &str) -> Result<Member, CoreError> {
        match &self.shared.member {
            Some(FieldKind::Entity(_)) => Ok(Member::Entity(self.get_model(key)?)),
            _ => Ok(Member::Primitive(self.get_primitive(key)?)),
        }
    }

    /// The primitive member at `key`. Absent keys are an error; use
    /// [`contains_key`](Self::contains_key) to probe.
    pub fn get_primitive(&self, key: &str) -> Result<Value, CoreError> {
        self.model.inner().ensure_loaded()?;
        if matches!(self.shared.member, Some(FieldKind::Entity(_))) {
            return Err(CoreError::NotAPrimitive {
                key: key.to_owned(),
            });
        }
        let state = self.model.inner().locked_state();
        state
            .storage
            .as_ref()
            .and_then(|s| s.get(key))
            .cloned()
            .ok_or_else(|| CoreError::NoSuchKey {
                key: key.to_owned(),
            })
    }

    /// A live entity for the member at `key`. Each call instantiates a
    /// fresh entity; await [`fetch`](Self::fetch) to get it loaded.
    pub fn get_model(&self, key: &str) -> Result<Entity, CoreError> {
        self.model.inner().ensure_loaded()?;
        if !self.contains_key(key)? {
            return Err(CoreError::NoSuchKey {
                key: key.to_owned(),
            });
        }
        self.member_entity_at(key)
    }

    fn member_entity_at(&self, key: &str) -> Result<Entity, CoreError> {
        match &self.shared.member {
            Some(FieldKind::Entity(member_type)) => {
                let child = self.model.reference().child(key)?;
                member_type.instantiate(child, Arc::clone(self.model.bus()))
            }
            _ => Err(CoreError::NotAModel {
                key: key.to_owned(),
            }),
        }
    }

    /// The loaded entity for the member at `key`.
    pub async fn fetch(&self, key: &str) -> Result<Entity, CoreError> {
        let entity = self.get_model(key)?;
        entity.when_loaded().await
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Buffer a primitive member write under `key`. New keys are
    /// admitted; nothing reaches the store until `save`.
    pub fn set(&self, key: &str, value: Value) -> Result<&Self, CoreError> {
        if matches!(self.shared.member, Some(FieldKind::Entity(_))) {
            return Err(CoreError::NotAPrimitive {
                key: key.to_owned(),
            });
        }
        self.model.buffer_change(key, value)?;
        Ok(self)
    }

    /// Commit the buffered change set in one atomic write.
    pub async fn save(&self) -> Result<Self, CoreError> {
        self.model.save().await?;
        Ok(self.clone())
    }

    /// Apply `pairs` to the store immediately in one atomic write.
    pub async fn update(&self, pairs: IndexMap<String, Value>) -> Result<Self, CoreError> {
        self.model.update(pairs).await?;
        Ok(self.clone())
    }

    /// Create a new member under a generated time-ordered key,
    /// optionally writing `values` into it. Returns the loaded member.
    pub async fn create(
        &self,
        values: Option<IndexMap<String, Value>>,
    ) -> Result<Entity, CoreError> {
        self.model.inner().ensure_loaded()?;
        let key = self.model.reference().generate_id();
        debug!(path = self.model.reference().path(), %key, "create member");
        let entity = self.member_entity_at(&key)?.when_loaded().await?;
        if let Some(values) = values {
            entity.update(values).await?;
        }
        Ok(entity)
    }

    /// Fetch the member at `key`, creating it transactionally from
    /// `values` when absent. Concurrent callers converge on a single
    /// created member. With no `values`, an absent member stays absent.
    pub async fn fetch_or_create(
        &self,
        key: &str,
        values: Option<IndexMap<String, Value>>,
    ) -> Result<Entity, CoreError> {
        self.model.inner().ensure_loaded()?;
        let entity = self.member_entity_at(key)?.when_loaded().await?;
        if let Some(values) = values {
            entity.initialize_values(values).await?;
        }
        Ok(entity)
    }

    /// Remove the member at `key`. Removing an absent member is a no-op.
    /// The member's last value rides the `ChildRemoved` trigger fired
    /// against this collection.
    pub async fn remove(&self, key: &str) -> Result<(), CoreError> {
        self.model.inner().ensure_loaded()?;
        let captured = {
            let state = self.model.inner().locked_state();
            state.storage.as_ref().and_then(|s| s.get(key)).cloned()
        };
        let Some(captured) = captured else {
            return Ok(());
        };
        debug!(path = self.model.reference().path(), %key, "remove member");
        let mut pairs = IndexMap::new();
        pairs.insert(key.to_owned(), Value::Null);
        self.model.update(pairs).await?;
        self.model
            .bus()
            .child_removed(
                Some(self.model.reference().clone()),
                Some(key.to_owned()),
                Some(captured),
            )
            .await?;
        Ok(())
    }

    /// Invoke `callback` for every member concurrently and wait for all
    /// invocations. The first error is returned after all have settled.
    pub async fn for_each<F, Fut>(&self, callback: F) -> Result<(), CoreError>
    where
        F: Fn(Member, String) -> Fut,
        Fut: Future<Output = Result<(), CoreError>>,
    {
        let keys = self.keys()?;
        let callback = &callback;
        let mut invocations = Vec::with_capacity(keys.len());
        for key in keys {
            invocations.push(async move {
                let member = match &self.shared.member {
                    Some(FieldKind::Entity(_)) => Member::Entity(self.fetch(&key).await?),
                    _ => Member::Primitive(self.get_primitive(&key)?),
                };
                callback(member, key).await
            });
        }
        let mut first_error = None;
        for result in join_all(invocations).await {
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ── Observation ─────────────────────────────────────────────────

    /// Install (or with `None`, remove) a callback invoked when a new
    /// member appears.
    pub fn on_child_added(&self, callback: Option<KeyCallback>) {
        *self
            .shared
            .child_added
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Install (or with `None`, remove) a callback invoked when a member
    /// vanishes.
    pub fn on_child_removed(&self, callback: Option<KeyCallback>) {
        *self
            .shared
            .child_removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Stop monitoring and remove trigger registrations. Idempotent.
    pub fn dispose(&self) {
        self.model.dispose();
    }

    pub(crate) fn model(&self) -> &Model {
        &self.model
    }
}

fn handle_child_added(
    inner: &Arc<ModelInner>,
    shared: &CollectionShared,
    key: &str,
    value: Option<Value>,
) {
    let Some(value) = value else { return };
    let callback = {
        let mut state = inner.locked_state();
        let known = state.storage.as_ref().and_then(|s| s.get(key)).is_some();
        if known {
            return;
        }
        let mut map = match state.storage.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert(key.to_owned(), value);
        state.child_count = map.len();
        state.storage = Some(Value::Object(map));
        shared
            .child_added
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    };
    if let Some(callback) = callback {
        callback(key);
    }
}

fn handle_child_removed(inner: &Arc<ModelInner>, shared: &CollectionShared, key: &str) {
    let callback = {
        let mut state = inner.locked_state();
        let mut map = match state.storage.take() {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if map.remove(key).is_none() {
            state.storage = if map.is_empty() {
                None
            } else {
                Some(Value::Object(map))
            };
            return;
        }
        state.child_count = map.len();
        // A collection with no members holds no value at all.
        state.storage = if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        };
        shared
            .child_removed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    };
    if let Some(callback) = callback {
        callback(key);
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("path", &self.model.reference().path())
            .finish()
    }
}
