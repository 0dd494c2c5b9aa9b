//! Configuration values and deferred references
//!
//! A node's configuration is a tree of [`Value`]s whose leaves are either
//! literals or [`Reference`]s. References are resolved late: the compiler only
//! scans them to derive dependency edges, the executor substitutes them once
//! the values they point at exist.

use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::collections::BTreeMap;
use std::fmt;

/// Shape of a remote state output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputShape {
    /// A single string
    Scalar,
    /// A list of strings
    List,
}

impl fmt::Display for OutputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputShape::Scalar => write!(f, "string"),
            OutputShape::List => write!(f, "list"),
        }
    }
}

/// A persisted stack output: a string or a list of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    String(String),
    List(Vec<String>),
}

impl OutputValue {
    /// Shape of this value
    pub fn shape(&self) -> OutputShape {
        match self {
            OutputValue::String(_) => OutputShape::Scalar,
            OutputValue::List(_) => OutputShape::List,
        }
    }

    /// Convert a resolved JSON value into an output value.
    ///
    /// Numbers and booleans are rendered as strings; lists must contain
    /// scalars only. Returns `None` for objects, nulls and nested lists.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Array(items) => items
                .iter()
                .map(scalar_to_string)
                .collect::<Option<Vec<_>>>()
                .map(OutputValue::List),
            other => scalar_to_string(other).map(OutputValue::String),
        }
    }

    /// JSON form of this value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            OutputValue::String(s) => serde_json::Value::String(s.clone()),
            OutputValue::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|s| serde_json::Value::String(s.clone()))
                    .collect(),
            ),
        }
    }
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A deferred pointer to a value produced elsewhere
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reference {
    /// Attribute of a node in the same stack
    Attribute { node: String, attribute: String },
    /// Output of a remote state source registered on the same stack
    RemoteOutput {
        source: String,
        key: String,
        shape: OutputShape,
    },
    /// Variable declared on the same stack
    Variable { name: String },
}

impl Reference {
    /// Reference to `node.attribute`
    pub fn attribute(node: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::Attribute {
            node: node.into(),
            attribute: attribute.into(),
        }
    }

    /// Reference to a scalar remote output
    pub fn remote(source: impl Into<String>, key: impl Into<String>) -> Self {
        Self::RemoteOutput {
            source: source.into(),
            key: key.into(),
            shape: OutputShape::Scalar,
        }
    }

    /// Reference to a list remote output
    pub fn remote_list(source: impl Into<String>, key: impl Into<String>) -> Self {
        Self::RemoteOutput {
            source: source.into(),
            key: key.into(),
            shape: OutputShape::List,
        }
    }

    /// Reference to a variable
    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable { name: name.into() }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Attribute { node, attribute } => write!(f, "${{{node}.{attribute}}}"),
            Reference::RemoteOutput {
                source,
                key,
                shape: OutputShape::Scalar,
            } => write!(f, "${{remote.{source}.{key}}}"),
            Reference::RemoteOutput {
                source,
                key,
                shape: OutputShape::List,
            } => write!(f, "${{remote.{source}.{key}[*]}}"),
            Reference::Variable { name } => write!(f, "${{var.{name}}}"),
        }
    }
}

/// A literal leaf
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
}

impl Literal {
    /// JSON form of this literal
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Literal::Null => serde_json::Value::Null,
            Literal::Bool(b) => serde_json::Value::Bool(*b),
            Literal::Number(n) => serde_json::Value::Number(n.clone()),
            Literal::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Name of the literal's type, used in schema messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Literal::Null => "null",
            Literal::Bool(_) => "bool",
            Literal::Number(_) => "number",
            Literal::String(_) => "string",
        }
    }
}

/// A configuration tree
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Literal(Literal),
    Ref(Reference),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// A string literal
    pub fn string(s: impl Into<String>) -> Self {
        Self::Literal(Literal::String(s.into()))
    }

    /// An integer literal
    pub fn int(n: i64) -> Self {
        Self::Literal(Literal::Number(Number::from(n)))
    }

    /// A boolean literal
    pub fn bool(b: bool) -> Self {
        Self::Literal(Literal::Bool(b))
    }

    /// `${node.attribute}`
    pub fn attr(node: &str, attribute: &str) -> Self {
        Self::Ref(Reference::attribute(node, attribute))
    }

    /// `${remote.source.key}`
    pub fn remote(source: &str, key: &str) -> Self {
        Self::Ref(Reference::remote(source, key))
    }

    /// `${remote.source.key[*]}`
    pub fn remote_list(source: &str, key: &str) -> Self {
        Self::Ref(Reference::remote_list(source, key))
    }

    /// `${var.name}`
    pub fn var(name: &str) -> Self {
        Self::Ref(Reference::variable(name))
    }

    /// A map from key/value pairs
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// An empty map
    pub fn empty_map() -> Self {
        Self::Map(BTreeMap::new())
    }

    /// Top-level entries when this value is a map
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Visit every reference in the tree, depth first, maps in key order
    pub fn visit_references<'a>(&'a self, visit: &mut impl FnMut(&'a Reference)) {
        match self {
            Value::Literal(_) => {}
            Value::Ref(r) => visit(r),
            Value::List(items) => {
                for item in items {
                    item.visit_references(visit);
                }
            }
            Value::Map(entries) => {
                for value in entries.values() {
                    value.visit_references(visit);
                }
            }
        }
    }

    /// All references in walk order, without duplicates
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs: Vec<&Reference> = Vec::new();
        self.visit_references(&mut |r| {
            if !refs.contains(&r) {
                refs.push(r);
            }
        });
        refs
    }

    /// Whether the tree contains no references at all
    pub fn is_fully_literal(&self) -> bool {
        self.references().is_empty()
    }

    /// Substitute every reference through `lookup`, producing JSON
    pub fn resolve_with<E>(
        &self,
        lookup: &mut impl FnMut(&Reference) -> Result<serde_json::Value, E>,
    ) -> Result<serde_json::Value, E> {
        Ok(match self {
            Value::Literal(l) => l.to_json(),
            Value::Ref(r) => lookup(r)?,
            Value::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| item.resolve_with(lookup))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(entries) => {
                let mut object = serde_json::Map::new();
                for (key, value) in entries {
                    object.insert(key.clone(), value.resolve_with(lookup)?);
                }
                serde_json::Value::Object(object)
            }
        })
    }

    /// JSON with every reference rendered as its `${...}` form
    pub fn to_symbolic_json(&self) -> serde_json::Value {
        let result: Result<_, std::convert::Infallible> =
            self.resolve_with(&mut |r| Ok(serde_json::Value::String(r.to_string())));
        match result {
            Ok(v) => v,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::int(n)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Ref(r)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eks_config() -> Value {
        Value::map([
            ("cluster_name", Value::string("mba-fiap-cluster")),
            ("vpc_id", Value::remote("vpc-state", "vpc_id")),
            (
                "subnet_ids",
                Value::remote_list("vpc-state", "vpc_private_subnets"),
            ),
            (
                "node_groups",
                Value::List(vec![Value::map([
                    ("role", Value::attr("node_role", "arn")),
                    ("instance_types", Value::List(vec!["t3.large".into()])),
                ])]),
            ),
            ("access_key", Value::var("AWS_ACCESS_KEY_ID")),
            ("again", Value::remote("vpc-state", "vpc_id")),
        ])
    }

    #[test]
    fn test_references_walk_nested_structures() {
        let config = eks_config();
        let refs = config.references();
        // Keys are walked in sorted order:
        // access_key, again, cluster_name, node_groups, subnet_ids, vpc_id
        assert_eq!(
            refs,
            vec![
                &Reference::variable("AWS_ACCESS_KEY_ID"),
                &Reference::remote("vpc-state", "vpc_id"),
                &Reference::attribute("node_role", "arn"),
                &Reference::remote_list("vpc-state", "vpc_private_subnets"),
            ]
        );
    }

    #[test]
    fn test_literal_tree_has_no_references() {
        let config = Value::map([
            ("name", Value::string("lanchonete-api")),
            ("force_delete", true.into()),
        ]);
        assert!(config.is_fully_literal());
    }

    #[test]
    fn test_reference_display() {
        assert_eq!(Reference::attribute("vpc", "id").to_string(), "${vpc.id}");
        assert_eq!(
            Reference::remote("vpc-state", "vpc_id").to_string(),
            "${remote.vpc-state.vpc_id}"
        );
        assert_eq!(
            Reference::remote_list("vpc-state", "subnets").to_string(),
            "${remote.vpc-state.subnets[*]}"
        );
        assert_eq!(Reference::variable("REGION").to_string(), "${var.REGION}");
    }

    #[test]
    fn test_symbolic_json() {
        let config = Value::map([
            ("vpc_id", Value::attr("vpc", "id")),
            ("desired_size", Value::int(1)),
        ]);
        assert_eq!(
            config.to_symbolic_json(),
            serde_json::json!({ "vpc_id": "${vpc.id}", "desired_size": 1 })
        );
    }

    #[test]
    fn test_resolve_with_substitutes() {
        let config = Value::map([("vpc_id", Value::attr("vpc", "id"))]);
        let resolved: Result<_, String> =
            config.resolve_with(&mut |_| Ok(serde_json::Value::String("vpc-123".into())));
        assert_eq!(resolved.unwrap(), serde_json::json!({ "vpc_id": "vpc-123" }));
    }

    #[test]
    fn test_output_value_from_json() {
        assert_eq!(
            OutputValue::from_json(&serde_json::json!(["a", 1, true])),
            Some(OutputValue::List(vec!["a".into(), "1".into(), "true".into()]))
        );
        assert_eq!(
            OutputValue::from_json(&serde_json::json!("vpc-1")),
            Some(OutputValue::String("vpc-1".into()))
        );
        assert_eq!(OutputValue::from_json(&serde_json::json!({ "a": 1 })), None);
        assert_eq!(OutputValue::from_json(&serde_json::json!([["nested"]])), None);
    }
}
