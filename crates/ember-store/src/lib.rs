//! Storage boundary for the ember object-mapping layer.
//!
//! This crate owns the low-level contract between ember's model engine and
//! a hierarchical JSON tree store with realtime push notifications:
//!
//! - **[`Reference`]** — Cheaply cloneable handle to one location in the
//!   tree. Child navigation, key/path introspection, one-shot reads,
//!   durable subscriptions, writes, and conditional transactions.
//!
//! - **[`StoreBackend`]** — The trait a concrete store implements. All
//!   remote interaction flows through it; the model layer never sees
//!   anything else.
//!
//! - **[`MemoryStore`]** — A complete in-process backend with the same
//!   observable semantics a replicated store provides: null-pruned values,
//!   per-subscription serialized deliveries, child-added/child-removed
//!   diffing, and at-most-one-winner transactions. Used by tests and by
//!   consumers who want the model layer over local state.
//!
//! Values are `serde_json::Value` throughout. A location never holds an
//! explicit `null` or an empty object -- both normalize to "no value"
//! (see [`value::prune`]), matching the null-pruning behavior of the
//! remote stores this crate fronts.

pub mod backend;
pub mod error;
pub mod memory;
pub mod push_id;
pub mod reference;
pub mod value;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backend::{EventKind, StoreBackend, StoreEvent, Subscription, TransactionResult};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use reference::Reference;
