//! Schema-driven synchronized objects over a realtime JSON tree store.
//!
//! ember-core keeps plain Rust handles in step with a remote hierarchical
//! store: a [`Model`] mirrors one object-shaped location, a [`Collection`]
//! mirrors a keyed set of uniform members, and both stay current through
//! the store's push notifications. A [`Schema`] describes an entity's
//! shape declaratively; [`compile`] turns it into a shared [`EntityType`]
//! whose [`instantiate`](EntityType::instantiate) wires up the whole
//! nested graph at a location.
//!
//! Mutations flow through a [`TriggerBus`]: handlers register a path
//! pattern plus an event kind, and every mutation performed through the
//! model layer fires the matching handlers and awaits them before its
//! own future resolves.
//!
//! ```
//! use ember_core::{compile, Entity, PrimitiveKind, Schema, TriggerBus};
//! use ember_store::MemoryStore;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), ember_core::CoreError> {
//! let store = MemoryStore::new();
//! let bus = TriggerBus::new();
//!
//! let user_type = compile(
//!     Schema::new()
//!         .field("name", PrimitiveKind::String)
//!         .field("address", Schema::new().field("city", PrimitiveKind::String)),
//! )?;
//!
//! let entity = user_type.instantiate(store.root().child("users/alice")?, bus)?;
//! let Entity::Model(alice) = entity.when_loaded().await? else {
//!     unreachable!()
//! };
//! alice.set("name", json!("Alice"))?.save().await?;
//! # Ok(())
//! # }
//! ```

pub mod collection;
pub mod compiled;
pub mod entity;
pub mod error;
pub mod model;
pub mod schema;
pub mod triggers;

// ── Primary re-exports ──────────────────────────────────────────────
pub use collection::{Collection, KeyCallback, Member};
pub use compiled::{EntityType, FieldKind, TypeSource, compile};
pub use entity::Entity;
pub use error::CoreError;
pub use model::{FieldValue, Model, ValueCallback};
pub use schema::{COLLECTION_MARKER, FieldSpec, PrimitiveKind, Schema};
pub use triggers::{
    ContextId, HandlerFuture, TriggerBus, TriggerEvent, TriggerHandler, TriggerKind, done,
};

// The storage boundary is part of this crate's public surface.
pub use ember_store::{MemoryStore, Reference, StoreBackend, StoreError};
