//! Resource schema registry
//!
//! The compiler does not define resource kinds. A [`SchemaRegistry`] supplies,
//! per kind, its configuration fields and the attributes a node of that kind
//! exports once applied. The compiler only consults it as a lookup table.

use crate::error::{Error, Result};
use crate::stack::{NodeKey, ResourceNode};
use crate::value::{Literal, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Type of a configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Bool,
    List,
    Map,
    #[default]
    Any,
}

impl FieldType {
    fn name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Bool => "bool",
            FieldType::List => "list",
            FieldType::Map => "map",
            FieldType::Any => "any",
        }
    }

    /// Whether a value is acceptable. References are unknown until apply and always accepted.
    fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (FieldType::Any, _) | (_, Value::Ref(_)) | (_, Value::Literal(Literal::Null)) => true,
            (FieldType::String, Value::Literal(Literal::String(_)))
            | (FieldType::Number, Value::Literal(Literal::Number(_)))
            | (FieldType::Bool, Value::Literal(Literal::Bool(_)))
            | (FieldType::List, Value::List(_))
            | (FieldType::Map, Value::Map(_)) => true,
            _ => false,
        }
    }
}

/// A configuration field of a resource kind
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(default, rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

/// Fields and exported attributes of one resource kind
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub attributes: BTreeSet<String>,
}

impl ResourceSchema {
    /// Add a field
    pub fn field(mut self, name: &str, field_type: FieldType, required: bool) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldSpec {
                field_type,
                required,
            },
        );
        self
    }

    /// Add an exported attribute
    pub fn attribute(mut self, name: &str) -> Self {
        self.attributes.insert(name.to_string());
        self
    }
}

/// Lookup table from resource kind to schema
pub trait SchemaRegistry: Send + Sync {
    /// Schema for `kind`, if registered
    fn schema(&self, kind: &str) -> Option<&ResourceSchema>;

    /// Whether kinds without a schema are rejected
    fn is_strict(&self) -> bool {
        true
    }
}

/// Map-backed registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticRegistry {
    kinds: BTreeMap<String, ResourceSchema>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind, replacing any previous schema
    pub fn register(mut self, kind: &str, schema: ResourceSchema) -> Self {
        self.kinds.insert(kind.to_string(), schema);
        self
    }

    pub fn from_kinds(kinds: BTreeMap<String, ResourceSchema>) -> Self {
        Self { kinds }
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

impl SchemaRegistry for StaticRegistry {
    fn schema(&self, kind: &str) -> Option<&ResourceSchema> {
        self.kinds.get(kind)
    }
}

/// Registry that accepts every kind, field and attribute
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenRegistry;

impl SchemaRegistry for OpenRegistry {
    fn schema(&self, _kind: &str) -> Option<&ResourceSchema> {
        None
    }

    fn is_strict(&self) -> bool {
        false
    }
}

/// Validate a node's configuration against its kind
pub fn validate_node(
    registry: &dyn SchemaRegistry,
    key: &NodeKey,
    node: &ResourceNode,
) -> Result<()> {
    let Some(schema) = registry.schema(&node.kind) else {
        if registry.is_strict() {
            return Err(Error::UnknownKind {
                node: key.clone(),
                kind: node.kind.clone(),
            });
        }
        return Ok(());
    };

    let Some(config) = node.config.as_map() else {
        return Err(Error::SchemaViolation {
            node: key.clone(),
            field: "<root>".to_string(),
            message: "configuration must be a map".to_string(),
        });
    };

    for (name, spec) in &schema.fields {
        match config.get(name) {
            None if spec.required => {
                return Err(Error::SchemaViolation {
                    node: key.clone(),
                    field: name.clone(),
                    message: "is required".to_string(),
                });
            }
            Some(value) if !spec.field_type.accepts(value) => {
                return Err(Error::SchemaViolation {
                    node: key.clone(),
                    field: name.clone(),
                    message: format!("must be a {}", spec.field_type.name()),
                });
            }
            _ => {}
        }
    }

    if let Some(unknown) = config.keys().find(|k| !schema.fields.contains_key(*k)) {
        return Err(Error::SchemaViolation {
            node: key.clone(),
            field: unknown.clone(),
            message: format!("is not a field of '{}'", node.kind),
        });
    }

    Ok(())
}

/// Whether `attribute` can be read from `target`
///
/// Exported attributes come from the schema; a node's own configuration keys
/// are always readable.
pub fn exports(registry: &dyn SchemaRegistry, target: &ResourceNode, attribute: &str) -> bool {
    let configured = target
        .config
        .as_map()
        .is_some_and(|m| m.contains_key(attribute));
    if configured {
        return true;
    }
    match registry.schema(&target.kind) {
        Some(schema) => schema.attributes.contains(attribute),
        None => !registry.is_strict(),
    }
}
