//! Stack compiler
//!
//! Turns declared stacks into a verified [`CompiledPlan`]: selects the stacks
//! to plan, binds their variables, builds the dependency graph, extracts
//! batches and reads the remote state that is already available.
//!
//! Remote state backed by a stack outside the plan is read eagerly here, so a
//! missing or malformed output aborts planning before anything runs. Remote
//! state backed by a stack inside the plan is deferred: it can only be read
//! once that stack has been applied during execution.

use crate::artifact::PlanArtifact;
use crate::error::{Error, Result};
use crate::graph::{DependencyGraph, GraphBuilder};
use crate::planner::ExecutionPlan;
use crate::remote_state::RemoteStateBridge;
use crate::resolver::{ResolveMode, Resolver};
use crate::schema::SchemaRegistry;
use crate::stack::{NodeKey, ResourceNode, Stack};
use crate::variables::{self, BoundVariables, VariableSource};
use std::collections::{BTreeMap, BTreeSet};

static NO_SOURCES: BTreeSet<String> = BTreeSet::new();

/// Compiles stacks against a schema registry
pub struct Compiler<'a> {
    registry: &'a dyn SchemaRegistry,
}

impl<'a> Compiler<'a> {
    pub fn new(registry: &'a dyn SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Compile `selected` stacks of `project` (all of them when empty)
    pub fn compile(
        &self,
        project: &[Stack],
        selected: &[String],
        sources: &[&dyn VariableSource],
        bridge: &RemoteStateBridge<'_>,
    ) -> Result<CompiledPlan> {
        let stacks = select(project, selected)?;
        let variables = variables::bind(&stacks, sources)?;

        let graph = GraphBuilder::new(self.registry)
            .with_declared(project.iter().map(|s| s.name.clone()))
            .build(&stacks)?;
        let plan = ExecutionPlan::new(&graph)?;

        let planned: BTreeSet<&str> = stacks.iter().map(|s| s.name.as_str()).collect();
        let mut deferred: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for stack in &stacks {
            let Some(refs) = graph.refs(&stack.name) else {
                continue;
            };
            let reads = refs
                .nodes
                .values()
                .chain(std::iter::once(&refs.outputs))
                .flat_map(|r| r.remote_outputs.iter());

            for (source_id, key, shape) in reads {
                let source = stack.remote_source(source_id).ok_or_else(|| {
                    Error::Internal(format!("remote source '{source_id}' vanished after scanning"))
                })?;
                if planned.contains(source.stack.as_str()) {
                    deferred
                        .entry(stack.name.clone())
                        .or_default()
                        .insert(source_id.clone());
                } else {
                    bridge.get(source, key, *shape)?;
                }
            }
        }

        log::info!(
            "compiled {} stacks: {} nodes in {} batches",
            stacks.len(),
            plan.node_count(),
            plan.batches.len()
        );
        Ok(CompiledPlan {
            stacks,
            graph,
            plan,
            variables,
            deferred,
        })
    }
}

/// Stacks to plan, in project order
fn select(project: &[Stack], selected: &[String]) -> Result<Vec<Stack>> {
    if let Some(unknown) = selected
        .iter()
        .find(|name| !project.iter().any(|s| &s.name == *name))
    {
        return Err(Error::UnknownStack {
            name: unknown.clone(),
            referenced_by: None,
        });
    }

    Ok(project
        .iter()
        .filter(|s| selected.is_empty() || selected.contains(&s.name))
        .cloned()
        .collect())
}

/// A verified plan together with everything needed to execute it
#[derive(Debug)]
pub struct CompiledPlan {
    stacks: Vec<Stack>,
    graph: DependencyGraph,
    plan: ExecutionPlan,
    variables: BoundVariables,
    deferred: BTreeMap<String, BTreeSet<String>>,
}

impl CompiledPlan {
    /// Planned stacks, in project order
    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.iter().find(|s| s.name == name)
    }

    pub fn node(&self, key: &NodeKey) -> Option<&ResourceNode> {
        self.stack(&key.stack).and_then(|s| s.node(&key.node))
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn variables(&self) -> &BoundVariables {
        &self.variables
    }

    /// Remote sources of `stack` that are read only during execution
    pub fn deferred_sources(&self, stack: &str) -> &BTreeSet<String> {
        self.deferred.get(stack).unwrap_or(&NO_SOURCES)
    }

    /// Serializable description of the plan
    pub fn artifact(&self) -> PlanArtifact {
        PlanArtifact::new(self)
    }

    /// Configuration of `key` with everything known at plan time substituted
    ///
    /// Node attributes and deferred remote outputs stay symbolic; sensitive
    /// variables are redacted.
    pub fn preview_config(
        &self,
        key: &NodeKey,
        bridge: &RemoteStateBridge<'_>,
    ) -> Result<serde_json::Value> {
        let stack = self
            .stack(&key.stack)
            .ok_or_else(|| Error::Internal(format!("{key} is not part of the plan")))?;
        let node = stack
            .node(&key.node)
            .ok_or_else(|| Error::Internal(format!("{key} is not part of the plan")))?;
        let attributes = BTreeMap::new();
        Resolver::new(
            stack,
            &self.variables,
            bridge,
            &attributes,
            self.deferred_sources(&stack.name),
            ResolveMode::Preview,
        )
        .resolve(&key.to_string(), &node.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::OpenRegistry;
    use crate::stack::Variable;
    use crate::state::MemoryStateStore;
    use crate::value::{OutputValue, Value};
    use crate::variables::MapSource;

    fn network() -> Stack {
        Stack::new("network")
            .resource("vpc", "aws_vpc", Value::map([("cidr_block", Value::string("10.0.0.0/16"))]))
            .output("vpc_id", Value::attr("vpc", "id"))
    }

    fn cluster() -> Stack {
        Stack::new("cluster")
            .variable(Variable::string("AWS_SECRET_ACCESS_KEY").sensitive())
            .remote_state("vpc-state", "network")
            .resource(
                "eks",
                "aws_eks_cluster",
                Value::map([
                    ("vpc_id", Value::remote("vpc-state", "vpc_id")),
                    ("secret", Value::var("AWS_SECRET_ACCESS_KEY")),
                ]),
            )
            .depends_on("network")
    }

    fn flags() -> MapSource {
        MapSource::new("flags").set("AWS_SECRET_ACCESS_KEY", "hunter2-very-secret")
    }

    #[test]
    fn test_selection_keeps_project_order() {
        let project = [network(), cluster()];
        let picked = select(&project, &["cluster".into(), "network".into()]).unwrap();
        let names: Vec<_> = picked.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["network", "cluster"]);

        assert!(matches!(
            select(&project, &["storage".into()]),
            Err(Error::UnknownStack { referenced_by: None, .. })
        ));
        assert_eq!(select(&project, &[]).unwrap().len(), 2);
    }

    #[test]
    fn test_unapplied_backing_stack_fails_planning() {
        let store = MemoryStateStore::new();
        let bridge = RemoteStateBridge::new(&store);
        let project = [network(), cluster()];
        let err = Compiler::new(&OpenRegistry)
            .compile(&project, &["cluster".into()], &[&flags()], &bridge)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RemoteStateUnavailable { ref stack, .. } if stack == "network"
        ));
    }

    #[test]
    fn test_applied_backing_stack_is_read_eagerly() {
        let store = MemoryStateStore::new()
            .with_outputs("network", [("vpc_id", OutputValue::String("vpc-0a1b".into()))]);
        let bridge = RemoteStateBridge::new(&store);
        let project = [network(), cluster()];
        let compiled = Compiler::new(&OpenRegistry)
            .compile(&project, &["cluster".into()], &[&flags()], &bridge)
            .unwrap();
        assert!(bridge.is_loaded("network"));
        assert!(compiled.deferred_sources("cluster").is_empty());

        let preview = compiled
            .preview_config(&NodeKey::new("cluster", "eks"), &bridge)
            .unwrap();
        assert_eq!(preview["vpc_id"], serde_json::json!("vpc-0a1b"));
        assert_eq!(preview["secret"], serde_json::json!(crate::variables::REDACTED));
    }

    #[test]
    fn test_planned_backing_stack_is_deferred() {
        let store = MemoryStateStore::new();
        let bridge = RemoteStateBridge::new(&store);
        let compiled = Compiler::new(&OpenRegistry)
            .compile(&[network(), cluster()], &[], &[&flags()], &bridge)
            .unwrap();
        assert!(!bridge.is_loaded("network"));
        assert!(compiled.deferred_sources("cluster").contains("vpc-state"));
        assert_eq!(compiled.plan().batches.len(), 2);
    }

    #[test]
    fn test_missing_variable_aborts() {
        let store = MemoryStateStore::new();
        let bridge = RemoteStateBridge::new(&store);
        let err = Compiler::new(&OpenRegistry)
            .compile(&[network(), cluster()], &[], &[], &bridge)
            .unwrap_err();
        assert!(matches!(err, Error::UnboundVariable { .. }));
    }
}
