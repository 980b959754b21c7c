// ── Core error types ──

use ember_store::StoreError;
use thiserror::Error;

/// Unified error type for the model layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The entity was constructed against a location that cannot exist.
    #[error("invalid reference: {reason}")]
    InvalidReference { reason: String },

    /// A synchronous accessor was called before the entity (and its
    /// nested entities) finished the initial load.
    #[error("entity at {path} is not loaded yet")]
    NotLoaded { path: String },

    /// The key is neither declared by the schema nor present in the
    /// loaded data.
    #[error("no such key: {key}")]
    NoSuchKey { key: String },

    /// A model accessor was used on a key that holds a primitive value.
    #[error("{key} does not refer to a model")]
    NotAModel { key: String },

    /// A primitive accessor was used on a key that holds a nested entity.
    #[error("{key} does not refer to a primitive value")]
    NotAPrimitive { key: String },

    /// A schema definition that cannot be compiled.
    #[error("invalid schema for {field}: {reason}")]
    InvalidSchema { field: String, reason: String },

    /// The storage boundary failed.
    #[error(transparent)]
    Transport(StoreError),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidPath { path } => Self::InvalidReference {
                reason: format!("invalid path: {path}"),
            },
            other => Self::Transport(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn invalid_path_becomes_invalid_reference() {
        let err = CoreError::from(StoreError::InvalidPath {
            path: "/a//b".to_owned(),
        });
        assert!(matches!(err, CoreError::InvalidReference { .. }));
    }

    #[test]
    fn other_store_errors_are_transport() {
        let err = CoreError::from(StoreError::Disconnected);
        assert!(matches!(err, CoreError::Transport(StoreError::Disconnected)));
    }
}
