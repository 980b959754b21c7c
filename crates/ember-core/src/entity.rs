// ── Entity ──
//
// The closed union of synchronized shapes. Nested fields and collection
// members are handed out as entities; callers downcast to the shape the
// schema declares.

use indexmap::IndexMap;
use serde_json::Value;

use ember_store::Reference;

use crate::collection::Collection;
use crate::error::CoreError;
use crate::model::Model;

/// A synchronized model or collection.
#[derive(Clone, Debug)]
pub enum Entity {
    Model(Model),
    Collection(Collection),
}

impl Entity {
    pub fn as_model(&self) -> Option<&Model> {
        match self {
            Self::Model(model) => Some(model),
            Self::Collection(_) => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Self::Collection(collection) => Some(collection),
            Self::Model(_) => None,
        }
    }

    pub fn reference(&self) -> &Reference {
        match self {
            Self::Model(model) => model.reference(),
            Self::Collection(collection) => collection.reference(),
        }
    }

    /// The last path segment, or `None` at the tree root.
    pub fn key(&self) -> Option<&str> {
        self.reference().key()
    }

    pub fn exists(&self) -> Result<bool, CoreError> {
        match self {
            Self::Model(model) => model.exists(),
            Self::Collection(collection) => collection.exists(),
        }
    }

    pub fn has_changes(&self) -> bool {
        match self {
            Self::Model(model) => model.has_changes(),
            Self::Collection(collection) => collection.has_changes(),
        }
    }

    /// Resolve once the entity (and everything nested in it) finished
    /// the initial load.
    pub async fn when_loaded(&self) -> Result<Self, CoreError> {
        match self {
            Self::Model(model) => {
                model.when_loaded().await?;
            }
            Self::Collection(collection) => {
                collection.when_loaded().await?;
            }
        }
        Ok(self.clone())
    }

    /// Commit buffered writes.
    pub async fn save(&self) -> Result<Self, CoreError> {
        match self {
            Self::Model(model) => {
                model.save().await?;
            }
            Self::Collection(collection) => {
                collection.save().await?;
            }
        }
        Ok(self.clone())
    }

    /// Apply `pairs` in one atomic write.
    pub async fn update(&self, pairs: IndexMap<String, Value>) -> Result<Self, CoreError> {
        match self {
            Self::Model(model) => {
                model.update(pairs).await?;
            }
            Self::Collection(collection) => {
                collection.update(pairs).await?;
            }
        }
        Ok(self.clone())
    }

    /// Create the entity transactionally when absent. Returns whether
    /// this call created it.
    pub async fn initialize_values(
        &self,
        values: IndexMap<String, Value>,
    ) -> Result<bool, CoreError> {
        match self {
            Self::Model(model) => model.initialize_values(values).await,
            Self::Collection(collection) => collection.model().initialize_values(values).await,
        }
    }

    pub fn dispose(&self) {
        match self {
            Self::Model(model) => model.dispose(),
            Self::Collection(collection) => collection.dispose(),
        }
    }
}

impl From<Model> for Entity {
    fn from(model: Model) -> Self {
        Self::Model(model)
    }
}

impl From<Collection> for Entity {
    fn from(collection: Collection) -> Self {
        Self::Collection(collection)
    }
}
