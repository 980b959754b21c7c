// ── Trigger bus ──
//
// Path-pattern observers for structural mutations. Handlers register a
// regex over absolute paths plus an event kind; mutations that go through
// the model layer fire matching handlers and await their completion
// before the mutation's future resolves.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use ember_store::Reference;

use crate::error::CoreError;

/// Opaque owner tag for a group of registrations, so an entity can remove
/// everything it registered in one call on dispose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

/// The mutation categories a handler can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    ValueChanged,
    ChildAdded,
    ChildRemoved,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValueChanged => write!(f, "value_changed"),
            Self::ChildAdded => write!(f, "child_added"),
            Self::ChildRemoved => write!(f, "child_removed"),
        }
    }
}

/// What a fired handler receives.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    /// Absolute path of the mutated location.
    pub path: String,
    pub kind: TriggerKind,
    /// Capture groups extracted from the registered pattern, in order.
    pub captures: Vec<Option<String>>,
    /// The affected child's key, for child events fired against a parent.
    pub child_key: Option<String>,
    /// Previous value for `ValueChanged`; the affected entity's value for
    /// child events.
    pub old_value: Option<Value>,
    /// New value, for `ValueChanged`.
    pub new_value: Option<Value>,
}

/// The asynchronous half of a handler's work.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send>>;

/// A trigger handler. The synchronous call validates and may refuse the
/// mutation by returning `Err`; the returned future carries any follow-up
/// work the mutation must wait for. Handlers with nothing asynchronous to
/// do return [`done`].
pub type TriggerHandler = Arc<dyn Fn(TriggerEvent) -> Result<HandlerFuture, CoreError> + Send + Sync>;

/// An already-complete [`HandlerFuture`].
pub fn done() -> Result<HandlerFuture, CoreError> {
    Ok(Box::pin(async { Ok(()) }))
}

struct Registration {
    pattern: Regex,
    kind: TriggerKind,
    context: ContextId,
    handler: TriggerHandler,
}

/// Registry and dispatcher for trigger handlers.
///
/// One bus is shared by every entity of a connected object graph; it is
/// injected at construction rather than reached through global state, so
/// independent graphs (and tests) never observe each other's handlers.
#[derive(Default)]
pub struct TriggerBus {
    registrations: Mutex<Vec<Registration>>,
    next_context: AtomicU64,
}

impl TriggerBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a fresh owner tag for registrations.
    pub fn allocate_context(&self) -> ContextId {
        ContextId(self.next_context.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a handler for mutations of `kind` at paths matching
    /// `pattern`. The pattern is matched against absolute paths such as
    /// `/users/alice/name`.
    pub fn register(
        &self,
        pattern: Regex,
        kind: TriggerKind,
        context: ContextId,
        handler: TriggerHandler,
    ) {
        debug!(pattern = %pattern, %kind, "register trigger");
        self.locked().push(Registration {
            pattern,
            kind,
            context,
            handler,
        });
    }

    /// Remove every registration owned by `context`.
    pub fn unregister_context(&self, context: ContextId) {
        self.locked().retain(|r| r.context != context);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locked().len()
    }

    fn locked(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Fire all handlers matching a mutation and await their futures.
    ///
    /// A `None` reference short-circuits to `Ok` (a mutation at the tree
    /// root has no parent to fire against). A handler that fails
    /// synchronously aborts dispatch: later handlers do not run, but
    /// futures already obtained from earlier handlers still complete
    /// before the error is returned. Handler futures run concurrently;
    /// the first error among them is returned after all have settled.
    pub async fn trigger(
        &self,
        reference: Option<Reference>,
        kind: TriggerKind,
        child_key: Option<String>,
        old_value: Option<Value>,
        new_value: Option<Value>,
    ) -> Result<(), CoreError> {
        let Some(reference) = reference else {
            return Ok(());
        };
        let path = reference.path().to_owned();

        let matched: Vec<(TriggerHandler, TriggerEvent)> = {
            let registrations = self.locked();
            registrations
                .iter()
                .filter(|r| r.kind == kind)
                .filter_map(|r| {
                    r.pattern.captures(&path).map(|caps| {
                        let captures = caps
                            .iter()
                            .skip(1)
                            .map(|m| m.map(|m| m.as_str().to_owned()))
                            .collect();
                        let event = TriggerEvent {
                            path: path.clone(),
                            kind,
                            captures,
                            child_key: child_key.clone(),
                            old_value: old_value.clone(),
                            new_value: new_value.clone(),
                        };
                        (Arc::clone(&r.handler), event)
                    })
                })
                .collect()
        };
        if matched.is_empty() {
            return Ok(());
        }
        debug!(%path, %kind, handlers = matched.len(), "trigger");

        let mut futures = Vec::with_capacity(matched.len());
        let mut refused = None;
        for (handler, event) in matched {
            match handler(event) {
                Ok(future) => futures.push(future),
                Err(err) => {
                    warn!(%path, %kind, error = %err, "trigger handler refused mutation");
                    refused = Some(err);
                    break;
                }
            }
        }
        let mut first_error = None;
        for result in join_all(futures).await {
            if let Err(err) = result {
                warn!(%path, %kind, error = %err, "trigger handler failed");
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = refused {
            return Err(err);
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Fire `ValueChanged` at `reference`.
    pub async fn value_changed(
        &self,
        reference: Option<Reference>,
        old_value: Option<Value>,
        new_value: Option<Value>,
    ) -> Result<(), CoreError> {
        self.trigger(reference, TriggerKind::ValueChanged, None, old_value, new_value)
            .await
    }

    /// Fire `ChildAdded` at `reference` (the parent of the new entity).
    pub async fn child_added(
        &self,
        reference: Option<Reference>,
        child_key: Option<String>,
        value: Option<Value>,
    ) -> Result<(), CoreError> {
        self.trigger(reference, TriggerKind::ChildAdded, child_key, value, None)
            .await
    }

    /// Fire `ChildRemoved` at `reference` (the parent of the removed
    /// entity). `value` is the entity's last observed value.
    pub async fn child_removed(
        &self,
        reference: Option<Reference>,
        child_key: Option<String>,
        value: Option<Value>,
    ) -> Result<(), CoreError> {
        self.trigger(reference, TriggerKind::ChildRemoved, child_key, value, None)
            .await
    }
}
