//! Execution planner - groups graph vertices into ordered batches

use crate::error::{Error, Result};
use crate::graph::{DependencyGraph, Vertex};
use crate::stack::NodeKey;
use std::collections::BTreeMap;

/// Nodes that may run concurrently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Graph level the batch was extracted at
    pub level: usize,
    /// Members, in declaration order
    pub nodes: Vec<NodeKey>,
}

/// An ordered list of batches
///
/// Every node appears in exactly one batch, and every dependency of a node
/// sits in a strictly earlier batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub batches: Vec<Batch>,
    /// Level of each stack's boundary vertex
    ///
    /// A stack is complete once every batch at or below this level has run.
    pub checkpoints: BTreeMap<String, usize>,
    batch_of: BTreeMap<NodeKey, usize>,
}

impl ExecutionPlan {
    /// Build the plan for `graph` and verify it
    pub fn new(graph: &DependencyGraph) -> Result<Self> {
        let levels = levels(graph)?;

        let mut by_level: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (vertex, &level) in levels.iter().enumerate() {
            by_level.entry(level).or_default().push(vertex);
        }

        let mut plan = Self::default();
        for (level, members) in by_level {
            let mut nodes = Vec::new();
            for &vertex in &members {
                match graph.vertex(vertex) {
                    Vertex::Node(key) => nodes.push(key.clone()),
                    Vertex::Boundary(stack) => {
                        plan.checkpoints.insert(stack.clone(), level);
                    }
                    Vertex::RemoteSource { .. } => {}
                }
            }
            if nodes.is_empty() {
                continue;
            }
            let index = plan.batches.len();
            for key in &nodes {
                plan.batch_of.insert(key.clone(), index);
            }
            plan.batches.push(Batch { level, nodes });
        }

        plan.verify(graph)?;
        log::debug!(
            "planned {} nodes in {} batches",
            plan.node_count(),
            plan.batches.len()
        );
        Ok(plan)
    }

    /// Check that every attribute reference is satisfied by an earlier batch
    pub fn verify(&self, graph: &DependencyGraph) -> Result<()> {
        let scheduled: usize = self.batches.iter().map(|b| b.nodes.len()).sum();
        if scheduled != self.batch_of.len() {
            return Err(Error::Internal("a node was scheduled more than once".into()));
        }

        for (source, consumer) in graph.attribute_edges() {
            let (Some(source), Some(consumer)) =
                (graph.vertex(source).node(), graph.vertex(consumer).node())
            else {
                continue;
            };
            match (self.batch_of(source), self.batch_of(consumer)) {
                (Some(s), Some(c)) if s < c => {}
                _ => {
                    return Err(Error::Internal(format!(
                        "{consumer} is not scheduled after {source}, which it references"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Index of the batch containing `key`
    pub fn batch_of(&self, key: &NodeKey) -> Option<usize> {
        self.batch_of.get(key).copied()
    }

    /// Total number of nodes in the plan
    pub fn node_count(&self) -> usize {
        self.batch_of.len()
    }

    /// Check if plan is empty
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Every node, batch by batch
    pub fn nodes(&self) -> impl Iterator<Item = &NodeKey> {
        self.batches.iter().flat_map(|b| b.nodes.iter())
    }

    /// Batches in teardown order
    pub fn destroy_order(&self) -> Vec<Batch> {
        self.batches.iter().rev().cloned().collect()
    }
}

/// Kahn level of every vertex
fn levels(graph: &DependencyGraph) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = (0..graph.len()).map(|v| graph.predecessors(v).len()).collect();
    let mut level = vec![0; graph.len()];
    let mut current: Vec<usize> = (0..graph.len()).filter(|&v| in_degree[v] == 0).collect();
    let mut depth = 0;
    let mut scheduled = 0;

    while !current.is_empty() {
        let mut next = Vec::new();
        for &vertex in &current {
            level[vertex] = depth;
            scheduled += 1;
            for &succ in graph.successors(vertex) {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    next.push(succ);
                }
            }
        }
        next.sort_unstable();
        current = next;
        depth += 1;
    }

    if scheduled != graph.len() {
        return Err(Error::Internal(format!(
            "{} vertices could not be scheduled; graph is not acyclic",
            graph.len() - scheduled
        )));
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::schema::OpenRegistry;
    use crate::stack::Stack;
    use crate::value::Value;

    fn plan(stacks: &[Stack]) -> ExecutionPlan {
        let graph = GraphBuilder::new(&OpenRegistry).build(stacks).unwrap();
        ExecutionPlan::new(&graph).unwrap()
    }

    fn names(plan: &ExecutionPlan) -> Vec<Vec<String>> {
        plan.batches
            .iter()
            .map(|b| b.nodes.iter().map(ToString::to_string).collect())
            .collect()
    }

    fn network() -> Stack {
        Stack::new("network")
            .resource("vpc", "aws_vpc", Value::map([("cidr_block", Value::string("10.0.0.0/16"))]))
            .resource("subnet", "aws_subnet", Value::map([("vpc_id", Value::attr("vpc", "id"))]))
            .output("vpc_id", Value::attr("vpc", "id"))
    }

    fn cluster() -> Stack {
        Stack::new("cluster")
            .remote_state("vpc-state", "network")
            .resource(
                "eks",
                "aws_eks_cluster",
                Value::map([
                    ("vpc_id", Value::remote("vpc-state", "vpc_id")),
                    ("subnet_ids", Value::remote_list("vpc-state", "vpc_private_subnets")),
                ]),
            )
            .resource(
                "nodes",
                "aws_eks_node_group",
                Value::map([("cluster", Value::attr("eks", "name"))]),
            )
            .depends_on("network")
    }

    #[test]
    fn test_single_stack_batches() {
        let plan = plan(&[network()]);
        assert_eq!(names(&plan), vec![vec!["network.vpc"], vec!["network.subnet"]]);
    }

    #[test]
    fn test_cross_stack_ordering() {
        let plan = plan(&[network(), cluster()]);
        assert_eq!(
            names(&plan),
            vec![
                vec!["network.vpc"],
                vec!["network.subnet"],
                vec!["cluster.eks"],
                vec!["cluster.nodes"],
            ]
        );
        let network_done = plan.checkpoints["network"];
        assert!(plan.batches[2].level > network_done);
        assert!(plan.batches[1].level < network_done);
    }

    #[test]
    fn test_independent_then_dependent() {
        let stack = Stack::new("app")
            .resource("a", "thing", Value::empty_map())
            .resource("b", "thing", Value::empty_map())
            .resource(
                "c",
                "thing",
                Value::map([("a", Value::attr("a", "id")), ("b", Value::attr("b", "id"))]),
            );
        let plan = plan(&[stack]);
        assert_eq!(names(&plan), vec![vec!["app.a", "app.b"], vec!["app.c"]]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let first = plan(&[network(), cluster()]);
        for _ in 0..10 {
            assert_eq!(plan(&[network(), cluster()]), first);
        }
    }

    #[test]
    fn test_destroy_order_reverses_batches() {
        let plan = plan(&[network(), cluster()]);
        let order: Vec<String> = plan
            .destroy_order()
            .iter()
            .flat_map(|b| b.nodes.iter().map(ToString::to_string))
            .collect();
        assert_eq!(order, vec!["cluster.nodes", "cluster.eks", "network.subnet", "network.vpc"]);
    }

    #[test]
    fn test_every_node_scheduled_once() {
        let plan = plan(&[network(), cluster()]);
        assert_eq!(plan.node_count(), 4);
        assert_eq!(plan.nodes().count(), 4);
        assert_eq!(plan.batch_of(&NodeKey::new("cluster", "eks")), Some(2));
    }

    #[test]
    fn test_empty_stack() {
        let plan = plan(&[Stack::new("empty")]);
        assert!(plan.is_empty());
        assert_eq!(plan.checkpoints["empty"], 0);
    }
}
