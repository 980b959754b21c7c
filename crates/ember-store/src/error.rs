// ── Storage-layer error types ──
//
// Everything a backend can report. The model layer wraps these without
// reinterpretation -- retry policy is a caller concern.

use thiserror::Error;

/// Unified error type for the storage boundary.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A path or child name that cannot address a location in the tree.
    #[error("invalid path: {path}")]
    InvalidPath { path: String },

    /// A durable subscription was cancelled by the store (authorization
    /// revoked, transport lost) before or after delivering data.
    #[error("subscription cancelled at {path}: {reason}")]
    SubscriptionCancelled { path: String, reason: String },

    /// A write was refused by the store.
    #[error("write rejected at {path}: {reason}")]
    WriteRejected { path: String, reason: String },

    /// The backend is gone (dropped, shut down, disconnected).
    #[error("store disconnected")]
    Disconnected,
}
