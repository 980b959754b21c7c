// ── Synchronized model ──
//
// A model mirrors one object-shaped location in the tree. Construction
// opens a value subscription and spawns the load chain; once every nested
// entity has its first snapshot the model flips to loaded and the
// synchronous accessors open up. Writes are buffered in a change set and
// committed atomically on save.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ember_store::{EventKind, Reference, StoreError, value::prune};

use crate::compiled::{EntityType, FieldKind};
use crate::entity::Entity;
use crate::error::CoreError;
use crate::triggers::{ContextId, TriggerBus, TriggerHandler, TriggerKind};

/// A field's value as seen through the generic accessor.
#[derive(Clone)]
pub enum FieldValue {
    /// A primitive field; `None` when declared but currently absent.
    Primitive(Option<Value>),
    /// A nested synchronized entity.
    Entity(Entity),
}

impl FieldValue {
    pub fn as_primitive(&self) -> Option<&Value> {
        match self {
            Self::Primitive(value) => value.as_ref(),
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

#[derive(Clone, Debug)]
enum LoadPhase {
    Pending,
    Ready,
    Failed { reason: String },
}

/// Callback for snapshot deliveries; receives the new value.
pub type ValueCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

pub(crate) struct ModelState {
    /// Latest snapshot from the store, merged with committed local writes.
    pub(crate) storage: Option<Value>,
    /// Buffered writes awaiting `save`.
    changes: IndexMap<String, Value>,
    pub(crate) child_count: usize,
    loaded: bool,
}

pub(crate) struct ModelInner {
    reference: Reference,
    bus: Arc<TriggerBus>,
    context: ContextId,
    entity_type: Option<Arc<EntityType>>,
    state: Mutex<ModelState>,
    phase: watch::Sender<LoadPhase>,
    /// Flips to true on the first snapshot delivery; the load chain
    /// task waits on it before checking nested entities.
    first_seen: watch::Sender<bool>,
    subordinates: Mutex<IndexMap<String, Entity>>,
    value_callback: Mutex<Option<ValueCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ModelInner {
    pub(crate) fn locked_state(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locked_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push_task(&self, task: JoinHandle<()>) {
        self.locked_tasks().push(task);
    }

    /// Apply one snapshot delivery and notify the change callback.
    pub(crate) fn apply_snapshot(&self, new_value: Option<Value>) {
        let callback = {
            let mut state = self.locked_state();
            state.child_count = count_children(new_value.as_ref());
            state.storage = new_value.clone();
            self.value_callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        };
        self.first_seen.send_replace(true);
        if let Some(callback) = callback {
            callback(new_value);
        }
    }

    /// Record a load failure. Ignored once the model is already loaded.
    pub(crate) fn fail_load(&self, reason: String) {
        warn!(path = self.reference.path(), %reason, "load failed");
        self.phase.send_if_modified(|phase| {
            if matches!(phase, LoadPhase::Pending) {
                *phase = LoadPhase::Failed { reason };
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn ensure_loaded(&self) -> Result<(), CoreError> {
        if self.locked_state().loaded {
            Ok(())
        } else {
            Err(CoreError::NotLoaded {
                path: self.reference.path().to_owned(),
            })
        }
    }
}

impl Drop for ModelInner {
    fn drop(&mut self) {
        for task in self.locked_tasks().drain(..) {
            task.abort();
        }
    }
}

fn count_children(value: Option<&Value>) -> usize {
    value.and_then(Value::as_object).map_or(0, Map::len)
}

/// A synchronized object at one location in the tree.
///
/// Cheap to clone; all clones share one synchronized state. Construction
/// must happen inside a tokio runtime (background tasks are spawned).
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl Model {
    /// An untyped model at `reference`. Keys present in the loaded data
    /// are readable and writable through the generic accessors; nothing
    /// is declared.
    pub fn new(reference: Reference, bus: Arc<TriggerBus>) -> Self {
        let model = Self::build(reference, bus, None);
        model.start_monitoring();
        model
    }

    /// Assemble the shared state without starting any task. Typed
    /// construction adds subordinates before monitoring starts.
    pub(crate) fn build(
        reference: Reference,
        bus: Arc<TriggerBus>,
        entity_type: Option<Arc<EntityType>>,
    ) -> Self {
        let context = bus.allocate_context();
        Self {
            inner: Arc::new(ModelInner {
                reference,
                bus,
                context,
                entity_type,
                state: Mutex::new(ModelState {
                    storage: None,
                    changes: IndexMap::new(),
                    child_count: 0,
                    loaded: false,
                }),
                phase: watch::Sender::new(LoadPhase::Pending),
                first_seen: watch::Sender::new(false),
                subordinates: Mutex::new(IndexMap::new()),
                value_callback: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn add_subordinate(&self, name: &str, entity: Entity) {
        self.inner
            .subordinates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), entity);
    }

    pub(crate) fn start_monitoring(&self) {
        self.spawn_value_monitor();
        self.spawn_load_chain();
    }

    /// Keep the local snapshot in step with the store. The task holds
    /// only a weak handle, so dropping every `Model` clone tears it down.
    fn spawn_value_monitor(&self) {
        let mut subscription = self.inner.reference.subscribe(EventKind::Value);
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                match subscription.recv().await {
                    Some(Ok(event)) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.apply_snapshot(event.value);
                    }
                    Some(Err(err)) => {
                        if let Some(inner) = weak.upgrade() {
                            inner.fail_load(err.to_string());
                        }
                        break;
                    }
                    None => {
                        if let Some(inner) = weak.upgrade() {
                            inner.fail_load(StoreError::Disconnected.to_string());
                        }
                        break;
                    }
                }
            }
        });
        self.inner.locked_tasks().push(task);
    }

    /// Flip to loaded once this model has its first snapshot and every
    /// nested entity reports loaded.
    pub(crate) fn spawn_load_chain(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut first_rx = self.inner.first_seen.subscribe();
        let subordinates: Vec<Entity> = self
            .inner
            .subordinates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let task = tokio::spawn(async move {
            loop {
                if *first_rx.borrow_and_update() {
                    break;
                }
                if first_rx.changed().await.is_err() {
                    return;
                }
            }
            for subordinate in &subordinates {
                if let Err(err) = subordinate.when_loaded().await {
                    if let Some(inner) = weak.upgrade() {
                        inner.fail_load(err.to_string());
                    }
                    return;
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.locked_state().loaded = true;
                debug!(path = inner.reference.path(), "loaded");
                inner.phase.send_if_modified(|phase| {
                    if matches!(phase, LoadPhase::Pending) {
                        *phase = LoadPhase::Ready;
                        true
                    } else {
                        false
                    }
                });
            }
        });
        self.inner.locked_tasks().push(task);
    }

    pub(crate) fn inner(&self) -> &Arc<ModelInner> {
        &self.inner
    }

    pub(crate) fn bus(&self) -> &Arc<TriggerBus> {
        &self.inner.bus
    }

    // ── Introspection ───────────────────────────────────────────────

    pub fn reference(&self) -> &Reference {
        &self.inner.reference
    }

    /// The last path segment, or `None` at the tree root.
    pub fn key(&self) -> Option<&str> {
        self.inner.reference.key()
    }

    /// Whether the location currently holds data.
    pub fn exists(&self) -> Result<bool, CoreError> {
        self.inner.ensure_loaded()?;
        Ok(self.inner.locked_state().storage.is_some())
    }

    /// Whether unsaved buffered writes exist.
    pub fn has_changes(&self) -> bool {
        !self.inner.locked_state().changes.is_empty()
    }

    /// Resolve once the model and every nested entity finished the
    /// initial load. Multiple callers may wait concurrently; the outcome
    /// is remembered.
    pub async fn when_loaded(&self) -> Result<Self, CoreError> {
        let mut phase_rx = self.inner.phase.subscribe();
        loop {
            let phase = phase_rx.borrow_and_update().clone();
            match phase {
                LoadPhase::Ready => return Ok(self.clone()),
                LoadPhase::Failed { reason } => {
                    return Err(CoreError::Transport(StoreError::SubscriptionCancelled {
                        path: self.inner.reference.path().to_owned(),
                        reason,
                    }));
                }
                LoadPhase::Pending => {
                    if phase_rx.changed().await.is_err() {
                        return Err(CoreError::Transport(StoreError::Disconnected));
                    }
                }
            }
        }
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// The value of a field, primitive or nested.
    pub fn get(&self, key: &str) -> Result<FieldValue, CoreError> {
        if let Some(entity_type) = &self.inner.entity_type {
            if matches!(entity_type.field(key), Some(FieldKind::Entity(_))) {
                return Ok(FieldValue::Entity(self.get_model(key)?));
            }
        }
        Ok(FieldValue::Primitive(self.get_primitive(key)?))
    }

    /// The primitive value at `key`. `Ok(None)` when the key is declared
    /// by the schema but currently absent; undeclared keys must be
    /// present in the loaded data.
    pub fn get_primitive(&self, key: &str) -> Result<Option<Value>, CoreError> {
        self.inner.ensure_loaded()?;
        let declared = match self.inner.entity_type.as_deref().map(|t| t.field(key)) {
            Some(Some(FieldKind::Entity(_))) => {
                return Err(CoreError::NotAPrimitive {
                    key: key.to_owned(),
                });
            }
            Some(Some(FieldKind::Primitive(_))) => true,
            Some(None) | None => false,
        };
        let state = self.inner.locked_state();
        if let Some(value) = state.storage.as_ref().and_then(|s| s.get(key)) {
            return Ok(Some(value.clone()));
        }
        if declared {
            Ok(None)
        } else {
            Err(CoreError::NoSuchKey {
                key: key.to_owned(),
            })
        }
    }

    /// The nested entity at `key`. Only keys a schema declares as
    /// entities resolve here.
    pub fn get_model(&self, key: &str) -> Result<Entity, CoreError> {
        self.inner.ensure_loaded()?;
        let Some(entity_type) = &self.inner.entity_type else {
            return Err(CoreError::NotAModel {
                key: key.to_owned(),
            });
        };
        match entity_type.field(key) {
            Some(FieldKind::Entity(_)) => self
                .inner
                .subordinates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned()
                .ok_or_else(|| CoreError::NoSuchKey {
                    key: key.to_owned(),
                }),
            Some(FieldKind::Primitive(_)) => Err(CoreError::NotAModel {
                key: key.to_owned(),
            }),
            None => Err(CoreError::NoSuchKey {
                key: key.to_owned(),
            }),
        }
    }

    // ── Writes ──────────────────────────────────────────────────────

    /// Buffer a primitive write. Nothing reaches the store until `save`.
    /// Returns `&self` so writes chain.
    pub fn set(&self, key: &str, value: Value) -> Result<&Self, CoreError> {
        self.inner.ensure_loaded()?;
        let declared = match self.inner.entity_type.as_deref().map(|t| t.field(key)) {
            Some(Some(FieldKind::Entity(_))) => {
                return Err(CoreError::NotAPrimitive {
                    key: key.to_owned(),
                });
            }
            Some(Some(FieldKind::Primitive(_))) => true,
            Some(None) | None => false,
        };
        let mut state = self.inner.locked_state();
        if !declared && state.storage.as_ref().and_then(|s| s.get(key)).is_none() {
            return Err(CoreError::NoSuchKey {
                key: key.to_owned(),
            });
        }
        state.changes.insert(key.to_owned(), value);
        Ok(self)
    }

    /// Buffer a write without key validation. Collections admit new keys.
    pub(crate) fn buffer_change(&self, key: &str, value: Value) -> Result<(), CoreError> {
        self.inner.ensure_loaded()?;
        self.inner
            .locked_state()
            .changes
            .insert(key.to_owned(), value);
        Ok(())
    }

    /// Commit the buffered change set in one atomic write, then clear
    /// it. Saving with no buffered changes is a no-op.
    pub async fn save(&self) -> Result<Self, CoreError> {
        let pending = self.inner.locked_state().changes.clone();
        if pending.is_empty() {
            return Ok(self.clone());
        }
        self.commit_update(pending, true).await?;
        Ok(self.clone())
    }

    /// Apply `pairs` to the store immediately in one atomic write,
    /// bypassing the change buffer. Keys may span levels (`"a/b"`).
    pub async fn update(&self, pairs: IndexMap<String, Value>) -> Result<Self, CoreError> {
        if !pairs.is_empty() {
            self.commit_update(pairs, false).await?;
        }
        Ok(self.clone())
    }

    async fn commit_update(
        &self,
        pairs: IndexMap<String, Value>,
        clear_changes: bool,
    ) -> Result<(), CoreError> {
        let inner = &self.inner;
        let (old_values, old_count, old_storage) = {
            let state = inner.locked_state();
            let old_values: IndexMap<String, Option<Value>> = pairs
                .keys()
                .map(|k| {
                    let old = state.storage.as_ref().and_then(|s| s.get(k)).cloned();
                    (k.clone(), old)
                })
                .collect();
            (old_values, state.child_count, state.storage.clone())
        };

        inner.reference.update(pairs.clone()).await?;

        // Fold the committed pairs into the cache so the synchronous
        // accessors observe the write before the echo delivery arrives.
        let (new_count, new_storage) = {
            let mut state = inner.locked_state();
            for (key, value) in &pairs {
                apply_committed(&mut state, key, prune(value.clone()));
            }
            (state.child_count, state.storage.clone())
        };

        let mut emissions = Vec::new();
        for (key, value) in &pairs {
            let new_value = prune(value.clone());
            let old_value = old_values.get(key).cloned().flatten();
            if old_value != new_value {
                emissions.push(inner.bus.value_changed(
                    Some(inner.reference.child(key)?),
                    old_value,
                    new_value,
                ));
            }
        }
        let mut first_error = None;
        for result in join_all(emissions).await {
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        // Coming into or out of existence is a child event on the parent.
        let key = inner.reference.key().map(ToOwned::to_owned);
        if old_count == 0 && new_count > 0 {
            debug!(path = inner.reference.path(), "created");
            inner
                .bus
                .child_added(inner.reference.parent(), key, new_storage)
                .await?;
        } else if old_count > 0 && new_count == 0 {
            debug!(path = inner.reference.path(), "removed");
            inner
                .bus
                .child_removed(inner.reference.parent(), key, old_storage)
                .await?;
        }

        if clear_changes {
            inner.locked_state().changes.clear();
        }
        Ok(())
    }

    /// Create the object transactionally: commits `values` only when the
    /// location is currently absent. Returns whether this call created
    /// it. Either way the local cache is refreshed from the settled
    /// value, so the accessors reflect the winner immediately.
    pub async fn initialize_values(
        &self,
        values: IndexMap<String, Value>,
    ) -> Result<bool, CoreError> {
        let inner = &self.inner;
        let mut object = Map::new();
        for (key, value) in values {
            if let Some(pruned) = prune(value) {
                object.insert(key, pruned);
            }
        }
        let proposed = Value::Object(object);
        let result = inner
            .reference
            .transaction(move |current| match current {
                None => Some(proposed.clone()),
                Some(_) => None,
            })
            .await?;

        {
            let mut state = inner.locked_state();
            state.child_count = count_children(result.snapshot.as_ref());
            state.storage = result.snapshot.clone();
        }

        if result.committed {
            debug!(path = inner.reference.path(), "initialized");
            let key = inner.reference.key().map(ToOwned::to_owned);
            inner
                .bus
                .child_added(inner.reference.parent(), key, result.snapshot)
                .await?;
        }
        Ok(result.committed)
    }

    // ── Observation ─────────────────────────────────────────────────

    /// Install (or with `None`, remove) a callback invoked with each
    /// snapshot the store delivers for this location.
    pub fn on_value_changed(&self, callback: Option<ValueCallback>) {
        *self
            .inner
            .value_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Register a trigger handler owned by this model; `dispose` removes
    /// it along with everything else registered through this method.
    pub fn on_trigger(&self, pattern: Regex, kind: TriggerKind, handler: TriggerHandler) {
        self.inner
            .bus
            .register(pattern, kind, self.inner.context, handler);
    }

    /// Stop monitoring, remove this model's trigger registrations, and
    /// dispose every nested entity. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(path = self.inner.reference.path(), "dispose");
        for task in self.inner.locked_tasks().drain(..) {
            task.abort();
        }
        self.inner.bus.unregister_context(self.inner.context);
        let subordinates: Vec<Entity> = self
            .inner
            .subordinates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for subordinate in subordinates {
            subordinate.dispose();
        }
    }
}

/// Merge one committed child write into the cached snapshot. Keys that
/// span levels are left for the echo delivery to reconcile.
fn apply_committed(state: &mut ModelState, key: &str, new_value: Option<Value>) {
    if key.contains('/') {
        return;
    }
    let mut map = match state.storage.take() {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    match new_value {
        Some(value) => {
            map.insert(key.to_owned(), value);
        }
        None => {
            map.remove(key);
        }
    }
    state.child_count = map.len();
    state.storage = if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    };
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("path", &self.inner.reference.path())
            .finish()
    }
}
