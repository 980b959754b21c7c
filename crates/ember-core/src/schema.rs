// ── Schema definitions ──
//
// A schema is a declarative description of an entity's shape: which keys
// hold primitives, which hold nested models, and which locations are
// keyed collections. Schemas are plain data; `compile` turns them into
// dispatch tables.

use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

use crate::compiled::EntityType;
use crate::error::CoreError;

/// Field name that marks a schema as a collection. The field's spec
/// describes the shape of every member.
pub const COLLECTION_MARKER: &str = "$id";

/// The primitive value categories a schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    String,
    Number,
    Boolean,
}

impl PrimitiveKind {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }
}

/// What one schema field declares.
#[derive(Clone, Debug)]
pub enum FieldSpec {
    /// The key holds a primitive JSON value.
    Primitive(PrimitiveKind),
    /// The key holds a nested entity described inline.
    Nested(Schema),
    /// The key holds a nested entity of an already-compiled type.
    Compiled(Arc<EntityType>),
}

impl From<PrimitiveKind> for FieldSpec {
    fn from(kind: PrimitiveKind) -> Self {
        Self::Primitive(kind)
    }
}

impl From<Schema> for FieldSpec {
    fn from(schema: Schema) -> Self {
        Self::Nested(schema)
    }
}

impl From<Arc<EntityType>> for FieldSpec {
    fn from(compiled: Arc<EntityType>) -> Self {
        Self::Compiled(compiled)
    }
}

/// An ordered set of field declarations.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    fields: IndexMap<String, FieldSpec>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field declaration. Builder style:
    ///
    /// ```
    /// use ember_core::{PrimitiveKind, Schema};
    ///
    /// let user = Schema::new()
    ///     .field("name", PrimitiveKind::String)
    ///     .field("age", PrimitiveKind::Number);
    /// ```
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, spec: impl Into<FieldSpec>) -> Self {
        self.fields.insert(name.into(), spec.into());
        self
    }

    /// A collection schema whose members all share `member`'s shape.
    pub fn collection_of(member: impl Into<FieldSpec>) -> Self {
        Self::new().field(COLLECTION_MARKER, member)
    }

    /// Parse a schema from its JSON notation: primitive fields are tagged
    /// with `"string"` / `"number"` / `"boolean"`, nested entities are
    /// nested objects, and a `"$id"` field marks a collection.
    ///
    /// ```
    /// use ember_core::Schema;
    /// use serde_json::json;
    ///
    /// let user = Schema::from_json(&json!({
    ///     "name": "string",
    ///     "address": { "city": "string" },
    ///     "tags": { "$id": "string" },
    /// }))?;
    /// # Ok::<(), ember_core::CoreError>(())
    /// ```
    pub fn from_json(definition: &Value) -> Result<Self, CoreError> {
        let Value::Object(map) = definition else {
            return Err(CoreError::InvalidSchema {
                field: "<root>".to_owned(),
                reason: "schema definition must be an object".to_owned(),
            });
        };
        let mut schema = Self::new();
        for (name, spec) in map {
            let parsed = match spec {
                Value::String(tag) => {
                    PrimitiveKind::from_tag(tag)
                        .map(FieldSpec::Primitive)
                        .ok_or_else(|| CoreError::InvalidSchema {
                            field: name.clone(),
                            reason: format!("unknown primitive tag {tag:?}"),
                        })?
                }
                nested @ Value::Object(_) => FieldSpec::Nested(Self::from_json(nested)?),
                other => {
                    return Err(CoreError::InvalidSchema {
                        field: name.clone(),
                        reason: format!("expected a type tag or nested object, got {other}"),
                    });
                }
            };
            schema.fields.insert(name.clone(), parsed);
        }
        Ok(schema)
    }

    pub(crate) fn is_collection(&self) -> bool {
        self.fields.contains_key(COLLECTION_MARKER)
    }

    pub(crate) fn member_spec(&self) -> Option<&FieldSpec> {
        self.fields.get(COLLECTION_MARKER)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &FieldSpec)> {
        self.fields.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.fields.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_primitive_tags() {
        let schema = Schema::from_json(&json!({
            "name": "string",
            "age": "number",
            "active": "boolean",
        }))
        .unwrap();
        assert_eq!(schema.len(), 3);
        assert!(!schema.is_collection());
        assert!(matches!(
            schema.iter().next().unwrap().1,
            FieldSpec::Primitive(PrimitiveKind::String)
        ));
    }

    #[test]
    fn parses_nested_objects_and_collections() {
        let schema = Schema::from_json(&json!({
            "address": { "city": "string" },
            "tags": { "$id": "string" },
        }))
        .unwrap();
        let nested: Vec<_> = schema.iter().collect();
        assert!(matches!(nested[0].1, FieldSpec::Nested(s) if !s.is_collection()));
        assert!(matches!(nested[1].1, FieldSpec::Nested(s) if s.is_collection()));
    }

    #[test]
    fn rejects_unknown_tags() {
        let err = Schema::from_json(&json!({"x": "float"})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSchema { field, .. } if field == "x"));
    }

    #[test]
    fn rejects_non_object_definitions() {
        assert!(Schema::from_json(&json!([1, 2])).is_err());
        assert!(Schema::from_json(&json!({"x": 3})).is_err());
    }
}
