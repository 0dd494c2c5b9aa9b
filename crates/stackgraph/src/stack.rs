//! Stacks and the declarations they own
//!
//! A [`Stack`] is one deployable unit: resource nodes, variables, remote state
//! sources it reads, outputs it publishes, and explicit dependencies on other
//! stacks.

use crate::value::{Literal, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a resource node: `stack.node`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub stack: String,
    pub node: String,
}

impl NodeKey {
    pub fn new(stack: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            node: node.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stack, self.node)
    }
}

/// Declared type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarType {
    String,
    Number,
    Bool,
}

impl VarType {
    pub fn name(&self) -> &'static str {
        match self {
            VarType::String => "string",
            VarType::Number => "number",
            VarType::Bool => "bool",
        }
    }
}

/// An input variable
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub var_type: VarType,
    pub sensitive: bool,
    pub default: Option<Literal>,
}

impl Variable {
    /// A required, non-sensitive string variable
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            var_type: VarType::String,
            sensitive: false,
            default: None,
        }
    }

    /// Mark the variable as sensitive
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    /// Set the declared type
    pub fn with_type(mut self, var_type: VarType) -> Self {
        self.var_type = var_type;
        self
    }

    /// Set a default value
    pub fn with_default(mut self, default: Literal) -> Self {
        self.default = Some(default);
        self
    }
}

/// A declared unit of desired state
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub id: String,
    pub kind: String,
    pub config: Value,
}

impl ResourceNode {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            config,
        }
    }
}

/// Read-only handle to another stack's persisted outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStateSource {
    /// Id used by references (`${remote.<id>.<key>}`)
    pub id: String,
    /// Stack whose state artifact backs this source
    pub stack: String,
}

/// A value published in the stack's state artifact
#[derive(Debug, Clone, PartialEq)]
pub struct StackOutput {
    pub name: String,
    pub value: Value,
    pub sensitive: bool,
}

/// One deployable unit
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Stack {
    pub name: String,
    pub nodes: Vec<ResourceNode>,
    pub variables: Vec<Variable>,
    pub remote_sources: Vec<RemoteStateSource>,
    pub outputs: Vec<StackOutput>,
    pub depends_on: Vec<String>,
}

impl Stack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Declare a resource node
    pub fn resource(mut self, id: &str, kind: &str, config: Value) -> Self {
        self.nodes.push(ResourceNode::new(id, kind, config));
        self
    }

    /// Declare a variable
    pub fn variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    /// Register a remote state source backed by `stack`
    pub fn remote_state(mut self, id: &str, stack: &str) -> Self {
        self.remote_sources.push(RemoteStateSource {
            id: id.to_string(),
            stack: stack.to_string(),
        });
        self
    }

    /// Publish an output
    pub fn output(mut self, name: &str, value: Value) -> Self {
        self.outputs.push(StackOutput {
            name: name.to_string(),
            value,
            sensitive: false,
        });
        self
    }

    /// Publish a sensitive output
    pub fn sensitive_output(mut self, name: &str, value: Value) -> Self {
        self.outputs.push(StackOutput {
            name: name.to_string(),
            value,
            sensitive: true,
        });
        self
    }

    /// Declare that this stack must be applied after `stack`
    pub fn depends_on(mut self, stack: &str) -> Self {
        if !self.depends_on.iter().any(|s| s == stack) {
            self.depends_on.push(stack.to_string());
        }
        self
    }

    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn variable_decl(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn remote_source(&self, id: &str) -> Option<&RemoteStateSource> {
        self.remote_sources.iter().find(|s| s.id == id)
    }

    /// Address of a node in this stack
    pub fn key(&self, node: &str) -> NodeKey {
        NodeKey::new(&self.name, node)
    }

    /// Whether `node` reads any remote state output
    pub fn consumes_remote_state(node: &ResourceNode) -> bool {
        node.config
            .references()
            .iter()
            .any(|r| matches!(r, crate::value::Reference::RemoteOutput { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_declarations() {
        let stack = Stack::new("cluster")
            .variable(Variable::string("AWS_SECRET_ACCESS_KEY").sensitive())
            .remote_state("vpc-state", "network")
            .resource(
                "ecr",
                "aws_ecr_repository",
                Value::map([("name", Value::string("lanchonete-api"))]),
            )
            .resource(
                "eks",
                "aws_eks_cluster",
                Value::map([("vpc_id", Value::remote("vpc-state", "vpc_id"))]),
            )
            .depends_on("network")
            .depends_on("network");

        assert_eq!(stack.depends_on, vec!["network".to_string()]);
        assert!(stack.variable_decl("AWS_SECRET_ACCESS_KEY").unwrap().sensitive);
        assert_eq!(stack.remote_source("vpc-state").unwrap().stack, "network");
        assert!(!Stack::consumes_remote_state(stack.node("ecr").unwrap()));
        assert!(Stack::consumes_remote_state(stack.node("eks").unwrap()));
        assert_eq!(stack.key("eks").to_string(), "cluster.eks");
    }
}
