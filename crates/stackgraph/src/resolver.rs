//! Reference resolver
//!
//! Scanning is pure: [`scan_stack`] walks every node and output of a stack,
//! checks that each reference names something that exists, and returns the
//! references grouped by what they point at. The graph builder turns those
//! into edges.
//!
//! Substitution happens later, through [`Resolver`], once the plan has
//! established that every value a configuration needs has been produced.

use crate::error::{Error, Result};
use crate::remote_state::RemoteStateBridge;
use crate::schema::{self, SchemaRegistry};
use crate::stack::{NodeKey, Stack};
use crate::types::Attributes;
use crate::value::{OutputShape, Reference, Value};
use crate::variables::BoundVariables;
use std::collections::{BTreeMap, BTreeSet};

/// References found in one configuration tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannedRefs {
    /// `(node id, attribute)` pairs, same stack
    pub attributes: Vec<(String, String)>,
    /// `(source id, key, shape)` triples
    pub remote_outputs: Vec<(String, String, OutputShape)>,
    /// Variable names
    pub variables: Vec<String>,
}

impl ScannedRefs {
    /// Distinct node ids referenced
    pub fn nodes(&self) -> BTreeSet<&str> {
        self.attributes.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Distinct remote source ids referenced
    pub fn sources(&self) -> BTreeSet<&str> {
        self.remote_outputs.iter().map(|(s, _, _)| s.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty() && self.remote_outputs.is_empty() && self.variables.is_empty()
    }
}

/// All references of a stack, by node id and output name
#[derive(Debug, Clone, Default)]
pub struct StackRefs {
    pub nodes: BTreeMap<String, ScannedRefs>,
    pub outputs: ScannedRefs,
}

/// Scan one configuration tree owned by `owner` (used in error messages)
pub fn scan_value(
    stack: &Stack,
    owner: &str,
    value: &Value,
    registry: &dyn SchemaRegistry,
) -> Result<ScannedRefs> {
    let mut scanned = ScannedRefs::default();

    for reference in value.references() {
        let unresolved = || Error::UnresolvedReference {
            node: owner.to_string(),
            reference: reference.clone(),
        };
        match reference {
            Reference::Attribute { node, attribute } => {
                let target = stack.node(node).ok_or_else(unresolved)?;
                if !schema::exports(registry, target, attribute) {
                    return Err(Error::UnknownAttribute {
                        node: owner.to_string(),
                        target: stack.key(node),
                        attribute: attribute.clone(),
                    });
                }
                scanned.attributes.push((node.clone(), attribute.clone()));
            }
            Reference::RemoteOutput { source, key, shape } => {
                stack.remote_source(source).ok_or_else(unresolved)?;
                scanned
                    .remote_outputs
                    .push((source.clone(), key.clone(), *shape));
            }
            Reference::Variable { name } => {
                stack.variable_decl(name).ok_or_else(unresolved)?;
                scanned.variables.push(name.clone());
            }
        }
    }

    Ok(scanned)
}

/// Scan every node and output of `stack`
pub fn scan_stack(stack: &Stack, registry: &dyn SchemaRegistry) -> Result<StackRefs> {
    let mut refs = StackRefs::default();
    for node in &stack.nodes {
        let owner = stack.key(&node.id).to_string();
        let scanned = scan_value(stack, &owner, &node.config, registry)?;
        refs.nodes.insert(node.id.clone(), scanned);
    }

    let mut outputs = ScannedRefs::default();
    for output in &stack.outputs {
        let owner = format!("{}.output.{}", stack.name, output.name);
        let scanned = scan_value(stack, &owner, &output.value, registry)?;
        outputs.attributes.extend(scanned.attributes);
        outputs.remote_outputs.extend(scanned.remote_outputs);
        outputs.variables.extend(scanned.variables);
    }
    refs.outputs = outputs;

    Ok(refs)
}

/// How unresolvable values are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Every reference must resolve; sensitive values are substituted
    Apply,
    /// Values not yet known stay symbolic; sensitive values are redacted
    Preview,
}

/// Substitutes references of one stack's configuration trees
pub struct Resolver<'a> {
    stack: &'a Stack,
    variables: &'a BoundVariables,
    bridge: &'a RemoteStateBridge<'a>,
    attributes: &'a BTreeMap<NodeKey, Attributes>,
    deferred: &'a BTreeSet<String>,
    mode: ResolveMode,
}

impl<'a> Resolver<'a> {
    /// `deferred` lists remote source ids of `stack` whose backing stack is
    /// applied in the same run; in preview mode they stay symbolic.
    pub fn new(
        stack: &'a Stack,
        variables: &'a BoundVariables,
        bridge: &'a RemoteStateBridge<'a>,
        attributes: &'a BTreeMap<NodeKey, Attributes>,
        deferred: &'a BTreeSet<String>,
        mode: ResolveMode,
    ) -> Self {
        Self {
            stack,
            variables,
            bridge,
            attributes,
            deferred,
            mode,
        }
    }

    pub fn resolve(&self, owner: &str, value: &Value) -> Result<serde_json::Value> {
        value.resolve_with(&mut |reference| self.lookup(owner, reference))
    }

    fn lookup(&self, owner: &str, reference: &Reference) -> Result<serde_json::Value> {
        let preview = self.mode == ResolveMode::Preview;
        let unresolved = || Error::UnresolvedReference {
            node: owner.to_string(),
            reference: reference.clone(),
        };
        let symbolic = || serde_json::Value::String(reference.to_string());

        match reference {
            Reference::Variable { name } => {
                let bound = self
                    .variables
                    .get(&self.stack.name, name)
                    .ok_or_else(|| Error::UnboundVariable {
                        stack: self.stack.name.clone(),
                        name: name.clone(),
                    })?;
                Ok(if preview {
                    bound.display_json()
                } else {
                    bound.expose().to_json()
                })
            }
            Reference::Attribute { node, attribute } => {
                let value = self
                    .attributes
                    .get(&self.stack.key(node))
                    .and_then(|attrs| attrs.get(attribute));
                match value {
                    Some(v) => Ok(v.clone()),
                    None if preview => Ok(symbolic()),
                    None => Err(unresolved()),
                }
            }
            Reference::RemoteOutput { source, key, shape } => {
                if preview && self.deferred.contains(source) {
                    return Ok(symbolic());
                }
                let source = self.stack.remote_source(source).ok_or_else(unresolved)?;
                Ok(self.bridge.get(source, key, *shape)?.to_json())
            }
        }
    }
}
