// ── Compiled entity types ──
//
// `compile` walks a schema once and produces an immutable dispatch table
// shared by every instance of the type. Field lookups at runtime are a
// single map probe; no per-instance accessor machinery exists.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, warn};

use ember_store::Reference;

use crate::collection::Collection;
use crate::entity::Entity;
use crate::error::CoreError;
use crate::model::Model;
use crate::schema::{COLLECTION_MARKER, FieldSpec, PrimitiveKind, Schema};
use crate::triggers::TriggerBus;

/// Method names the model and collection surfaces reserve. A schema field
/// with one of these names still compiles, but no typed accessor path is
/// generated for it; callers reach it through the generic accessors.
const RESERVED_NAMES: &[&str] = &[
    "key",
    "exists",
    "get",
    "set",
    "save",
    "update",
    "remove",
    "create",
    "fetch",
    "count",
    "keys",
    "dispose",
];

/// What one compiled field resolves to.
#[derive(Clone, Debug)]
pub enum FieldKind {
    Primitive(PrimitiveKind),
    Entity(Arc<EntityType>),
}

#[derive(Debug)]
struct ModelField {
    kind: FieldKind,
    /// False when the field name clashed with a reserved surface name.
    dedicated: bool,
}

#[derive(Debug)]
enum Shape {
    Model { fields: IndexMap<String, ModelField> },
    Collection { member: FieldKind },
}

/// An immutable, compiled entity type. Instances are created with
/// [`EntityType::instantiate`]; the type itself is shared via `Arc` and
/// may appear as a field of other types.
#[derive(Debug)]
pub struct EntityType {
    shape: Shape,
}

/// Input to [`compile`]: either a schema or a type that has already been
/// compiled. Compiling an already-compiled type returns it unchanged.
pub enum TypeSource {
    Schema(Schema),
    Compiled(Arc<EntityType>),
}

impl From<Schema> for TypeSource {
    fn from(schema: Schema) -> Self {
        Self::Schema(schema)
    }
}

impl From<Arc<EntityType>> for TypeSource {
    fn from(compiled: Arc<EntityType>) -> Self {
        Self::Compiled(compiled)
    }
}

/// Compile a schema into an [`EntityType`].
pub fn compile(source: impl Into<TypeSource>) -> Result<Arc<EntityType>, CoreError> {
    match source.into() {
        TypeSource::Compiled(compiled) => Ok(compiled),
        TypeSource::Schema(schema) => compile_schema(&schema),
    }
}

fn compile_schema(schema: &Schema) -> Result<Arc<EntityType>, CoreError> {
    if schema.is_collection() {
        compile_collection(schema)
    } else {
        compile_model(schema)
    }
}

fn compile_field(spec: &FieldSpec) -> Result<FieldKind, CoreError> {
    Ok(match spec {
        FieldSpec::Primitive(kind) => FieldKind::Primitive(*kind),
        FieldSpec::Nested(schema) => FieldKind::Entity(compile_schema(schema)?),
        FieldSpec::Compiled(compiled) => FieldKind::Entity(Arc::clone(compiled)),
    })
}

fn compile_model(schema: &Schema) -> Result<Arc<EntityType>, CoreError> {
    let mut fields = IndexMap::with_capacity(schema.len());
    for (name, spec) in schema.iter() {
        if name.is_empty() {
            return Err(CoreError::InvalidSchema {
                field: name.clone(),
                reason: "field names must be non-empty".to_owned(),
            });
        }
        let dedicated = !RESERVED_NAMES.contains(&name.as_str());
        if !dedicated {
            warn!(
                field = %name,
                "schema field shadows a reserved method name; only the generic accessors reach it"
            );
        }
        fields.insert(
            name.clone(),
            ModelField {
                kind: compile_field(spec)?,
                dedicated,
            },
        );
    }
    debug!(fields = fields.len(), "compiled model type");
    Ok(Arc::new(EntityType {
        shape: Shape::Model { fields },
    }))
}

fn compile_collection(schema: &Schema) -> Result<Arc<EntityType>, CoreError> {
    let member = schema
        .member_spec()
        .ok_or_else(|| CoreError::InvalidSchema {
            field: COLLECTION_MARKER.to_owned(),
            reason: "collection schema lost its member spec".to_owned(),
        })?;
    if schema.len() > 1 {
        warn!("collection schema declares fields besides the member spec; they are ignored");
    }
    debug!("compiled collection type");
    Ok(Arc::new(EntityType {
        shape: Shape::Collection {
            member: compile_field(member)?,
        },
    }))
}

impl EntityType {
    pub fn is_collection(&self) -> bool {
        matches!(self.shape, Shape::Collection { .. })
    }

    /// The compiled field for `name`, for model types.
    pub(crate) fn field(&self, name: &str) -> Option<&FieldKind> {
        match &self.shape {
            Shape::Model { fields } => fields.get(name).map(|f| &f.kind),
            Shape::Collection { .. } => None,
        }
    }

    /// Whether `name` compiled to a typed accessor path, as opposed to
    /// shadowing a reserved method name.
    pub fn has_dedicated_accessor(&self, name: &str) -> bool {
        match &self.shape {
            Shape::Model { fields } => fields.get(name).is_some_and(|f| f.dedicated),
            Shape::Collection { .. } => false,
        }
    }

    /// The member shape, for collection types.
    pub fn member(&self) -> Option<&FieldKind> {
        match &self.shape {
            Shape::Collection { member } => Some(member),
            Shape::Model { .. } => None,
        }
    }

    /// Create a live entity of this type at `reference`. Nested entity
    /// fields are instantiated eagerly at their child locations; loading
    /// starts immediately.
    pub fn instantiate(
        self: &Arc<Self>,
        reference: Reference,
        bus: Arc<TriggerBus>,
    ) -> Result<Entity, CoreError> {
        match &self.shape {
            Shape::Model { fields } => {
                let model = Model::build(reference, bus.clone(), Some(Arc::clone(self)));
                for (name, field) in fields {
                    if let FieldKind::Entity(child_type) = &field.kind {
                        let child_ref = model.reference().child(name)?;
                        let child = child_type.instantiate(child_ref, bus.clone())?;
                        model.add_subordinate(name, child);
                    }
                }
                model.start_monitoring();
                Ok(Entity::Model(model))
            }
            Shape::Collection { member } => Ok(Entity::Collection(Collection::build(
                reference,
                bus,
                Some(member.clone()),
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compile_is_idempotent() {
        let schema = Schema::new().field("name", PrimitiveKind::String);
        let first = compile(schema).unwrap();
        let second = compile(Arc::clone(&first)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn collection_marker_switches_shape() {
        let model = compile(Schema::new().field("name", PrimitiveKind::String)).unwrap();
        assert!(!model.is_collection());

        let coll = compile(Schema::collection_of(PrimitiveKind::Boolean)).unwrap();
        assert!(coll.is_collection());
        assert!(matches!(
            coll.member(),
            Some(FieldKind::Primitive(PrimitiveKind::Boolean))
        ));
    }

    #[test]
    fn reserved_names_lose_their_dedicated_accessor() {
        let schema = Schema::from_json(&json!({
            "save": "string",
            "name": "string",
        }))
        .unwrap();
        let compiled = compile(schema).unwrap();
        assert!(!compiled.has_dedicated_accessor("save"));
        assert!(compiled.has_dedicated_accessor("name"));
        // The field itself still compiled and is reachable generically.
        assert!(matches!(
            compiled.field("save"),
            Some(FieldKind::Primitive(PrimitiveKind::String))
        ));
    }

    #[test]
    fn precompiled_types_embed_in_other_schemas() {
        let address = compile(Schema::new().field("city", PrimitiveKind::String)).unwrap();
        let user = compile(
            Schema::new()
                .field("name", PrimitiveKind::String)
                .field("address", address),
        )
        .unwrap();
        assert!(matches!(user.field("address"), Some(FieldKind::Entity(_))));
    }
}
