//! Dependency graph builder
//!
//! Every planned stack contributes three kinds of vertices: its remote state
//! sources, its resource nodes, and one boundary vertex meaning "every node
//! of this stack has been applied". Edges point from a dependency to its
//! dependent and are produced by a fixed list of [`EdgeRule`]s, all evaluated
//! by the same [`GraphBuilder`] into one deduplicated edge set.
//!
//! Vertices are indexed in declaration order: stacks in the order given, and
//! within a stack remote sources, then nodes, then the boundary. Everything
//! downstream orders by that index, so the same declarations always produce
//! the same graph.

use crate::error::{Error, Result};
use crate::resolver::{self, StackRefs};
use crate::schema::{self, SchemaRegistry};
use crate::stack::{NodeKey, Stack};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fmt::Write as _;

/// A graph vertex
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Vertex {
    /// A resource node
    Node(NodeKey),
    /// A remote state source registered on `stack`
    RemoteSource { stack: String, source: String },
    /// Reached once every node of the stack has been applied
    Boundary(String),
}

impl Vertex {
    /// The stack this vertex belongs to
    pub fn stack(&self) -> &str {
        match self {
            Vertex::Node(key) => &key.stack,
            Vertex::RemoteSource { stack, .. } | Vertex::Boundary(stack) => stack,
        }
    }

    /// The node key, for resource vertices
    pub fn node(&self) -> Option<&NodeKey> {
        match self {
            Vertex::Node(key) => Some(key),
            _ => None,
        }
    }

    /// Whether the vertex only constrains ordering
    pub fn is_virtual(&self) -> bool {
        !matches!(self, Vertex::Node(_))
    }
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vertex::Node(key) => write!(f, "{key}"),
            Vertex::RemoteSource { stack, source } => write!(f, "{stack}.remote.{source}"),
            Vertex::Boundary(stack) => write!(f, "stack:{stack}"),
        }
    }
}

/// Edge-producing rules, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeRule {
    /// Referenced node -> consumer
    Attribute,
    /// Remote state source -> consumer node
    RemoteConsumer,
    /// Node -> own stack boundary; also sources read by stack outputs
    StackBoundary,
    /// Backing stack boundary -> remote state source, when both are planned
    RemoteBacking,
    /// Dependency boundary -> every remote-consuming node of the dependent
    StackDependency,
}

impl EdgeRule {
    pub const ALL: [EdgeRule; 5] = [
        EdgeRule::Attribute,
        EdgeRule::RemoteConsumer,
        EdgeRule::StackBoundary,
        EdgeRule::RemoteBacking,
        EdgeRule::StackDependency,
    ];

    pub fn label(self) -> &'static str {
        match self {
            EdgeRule::Attribute => "attribute",
            EdgeRule::RemoteConsumer => "remote",
            EdgeRule::StackBoundary => "boundary",
            EdgeRule::RemoteBacking => "backing",
            EdgeRule::StackDependency => "depends_on",
        }
    }

    fn edges(self, scope: &RuleScope<'_>) -> Vec<(Vertex, Vertex)> {
        let mut edges = Vec::new();

        for stack in scope.stacks {
            let refs = &scope.refs[&stack.name];
            let boundary = Vertex::Boundary(stack.name.clone());
            let remote = |source: &str| Vertex::RemoteSource {
                stack: stack.name.clone(),
                source: source.to_string(),
            };

            match self {
                EdgeRule::Attribute => {
                    for node in &stack.nodes {
                        for target in refs.nodes[&node.id].nodes() {
                            edges.push((
                                Vertex::Node(stack.key(target)),
                                Vertex::Node(stack.key(&node.id)),
                            ));
                        }
                    }
                }
                EdgeRule::RemoteConsumer => {
                    for node in &stack.nodes {
                        for source in refs.nodes[&node.id].sources() {
                            edges.push((remote(source), Vertex::Node(stack.key(&node.id))));
                        }
                    }
                }
                EdgeRule::StackBoundary => {
                    for node in &stack.nodes {
                        edges.push((Vertex::Node(stack.key(&node.id)), boundary.clone()));
                    }
                    for source in refs.outputs.sources() {
                        edges.push((remote(source), boundary.clone()));
                    }
                }
                EdgeRule::RemoteBacking => {
                    for source in &stack.remote_sources {
                        if scope.planned.contains(source.stack.as_str()) {
                            let boundary = Vertex::Boundary(source.stack.clone());
                            edges.push((boundary, remote(&source.id)));
                        }
                    }
                }
                EdgeRule::StackDependency => {
                    for dependency in &stack.depends_on {
                        if !scope.planned.contains(dependency.as_str()) {
                            continue;
                        }
                        for node in stack.nodes.iter().filter(|n| Stack::consumes_remote_state(n)) {
                            edges.push((
                                Vertex::Boundary(dependency.clone()),
                                Vertex::Node(stack.key(&node.id)),
                            ));
                        }
                    }
                }
            }
        }

        edges
    }
}

struct RuleScope<'a> {
    stacks: &'a [Stack],
    refs: &'a BTreeMap<String, StackRefs>,
    planned: BTreeSet<&'a str>,
}

/// Directed acyclic graph over every planned stack
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    vertices: Vec<Vertex>,
    index: BTreeMap<Vertex, usize>,
    edges: BTreeMap<(usize, usize), EdgeRule>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
    refs: BTreeMap<String, StackRefs>,
}

impl DependencyGraph {
    /// Number of vertices
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn vertex(&self, index: usize) -> &Vertex {
        &self.vertices[index]
    }

    pub fn index_of(&self, vertex: &Vertex) -> Option<usize> {
        self.index.get(vertex).copied()
    }

    pub fn node_index(&self, key: &NodeKey) -> Option<usize> {
        self.index_of(&Vertex::Node(key.clone()))
    }

    /// Direct dependents, ascending
    pub fn successors(&self, index: usize) -> &[usize] {
        &self.successors[index]
    }

    /// Direct dependencies, ascending
    pub fn predecessors(&self, index: usize) -> &[usize] {
        &self.predecessors[index]
    }

    /// Every edge with the first rule that produced it
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, EdgeRule)> + '_ {
        self.edges.iter().map(|(&(from, to), &rule)| (from, to, rule))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn has_edge(&self, from: &Vertex, to: &Vertex) -> bool {
        match (self.index_of(from), self.index_of(to)) {
            (Some(from), Some(to)) => self.edges.contains_key(&(from, to)),
            _ => false,
        }
    }

    /// References found while scanning `stack`
    pub fn refs(&self, stack: &str) -> Option<&StackRefs> {
        self.refs.get(stack)
    }

    /// `(source, consumer)` pairs of every attribute reference
    pub fn attribute_edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.edges()
            .filter(|(_, _, rule)| *rule == EdgeRule::Attribute)
            .map(|(from, to, _)| (from, to))
    }

    /// Resource nodes `index` waits for, looking through ordering-only vertices
    pub fn node_dependencies(&self, index: usize) -> Vec<NodeKey> {
        let mut found = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut pending: Vec<usize> = self.predecessors[index].clone();

        while let Some(current) = pending.pop() {
            if !seen.insert(current) {
                continue;
            }
            match &self.vertices[current] {
                Vertex::Node(key) => {
                    found.insert(key.clone());
                }
                _ => pending.extend(&self.predecessors[current]),
            }
        }

        found.into_iter().collect()
    }

    /// Render the graph in Graphviz DOT format
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph stackplan {\n  rankdir=LR;\n");
        let mut stacks: Vec<&str> = Vec::new();
        for vertex in &self.vertices {
            if !stacks.contains(&vertex.stack()) {
                stacks.push(vertex.stack());
            }
        }

        for stack in stacks {
            let _ = writeln!(out, "  subgraph \"cluster_{}\" {{", escape(stack));
            let _ = writeln!(out, "    label=\"{}\";", escape(stack));
            for vertex in self.vertices.iter().filter(|v| v.stack() == stack) {
                let shape = match vertex {
                    Vertex::Node(_) => "box",
                    Vertex::RemoteSource { .. } => "cds",
                    Vertex::Boundary(_) => "doubleoctagon",
                };
                let _ = writeln!(out, "    \"{}\" [shape={shape}];", escape(&vertex.to_string()));
            }
            out.push_str("  }\n");
        }

        for (from, to, rule) in self.edges() {
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\" [label=\"{}\"];",
                escape(&self.vertices[from].to_string()),
                escape(&self.vertices[to].to_string()),
                rule.label()
            );
        }
        out.push_str("}\n");
        out
    }

    /// First cycle found by a depth-first walk in vertex order
    fn find_cycle(&self) -> Option<Vec<usize>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnPath,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.vertices.len()];
        // (vertex, next successor position)
        let mut path: Vec<(usize, usize)> = Vec::new();

        for root in 0..self.vertices.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::OnPath;
            path.push((root, 0));

            while let Some(frame) = path.last_mut() {
                let current = frame.0;
                if let Some(&next) = self.successors[current].get(frame.1) {
                    frame.1 += 1;
                    match marks[next] {
                        Mark::Unvisited => {
                            marks[next] = Mark::OnPath;
                            path.push((next, 0));
                        }
                        Mark::OnPath => {
                            let start = path.iter().position(|&(v, _)| v == next)?;
                            let mut cycle: Vec<usize> =
                                path[start..].iter().map(|&(v, _)| v).collect();
                            cycle.push(next);
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[current] = Mark::Done;
                    path.pop();
                }
            }
        }

        None
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Builds a [`DependencyGraph`] from stacks planned together
pub struct GraphBuilder<'a> {
    registry: &'a dyn SchemaRegistry,
    declared: BTreeSet<String>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a dyn SchemaRegistry) -> Self {
        Self {
            registry,
            declared: BTreeSet::new(),
        }
    }

    /// Stacks declared in the project but not planned now
    ///
    /// `depends_on` may name them; they contribute no edges.
    pub fn with_declared<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn build(&self, stacks: &[Stack]) -> Result<DependencyGraph> {
        let mut planned = BTreeSet::new();
        for stack in stacks {
            if !planned.insert(stack.name.as_str()) {
                return Err(Error::DuplicateStack {
                    name: stack.name.clone(),
                });
            }
        }

        let mut refs = BTreeMap::new();
        for stack in stacks {
            self.check_stack(stack, &planned)?;
            refs.insert(stack.name.clone(), resolver::scan_stack(stack, self.registry)?);
        }

        let mut vertices = Vec::new();
        for stack in stacks {
            for source in &stack.remote_sources {
                vertices.push(Vertex::RemoteSource {
                    stack: stack.name.clone(),
                    source: source.id.clone(),
                });
            }
            for node in &stack.nodes {
                vertices.push(Vertex::Node(stack.key(&node.id)));
            }
            vertices.push(Vertex::Boundary(stack.name.clone()));
        }
        let index: BTreeMap<Vertex, usize> = vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i))
            .collect();

        let scope = RuleScope {
            stacks,
            refs: &refs,
            planned,
        };
        let mut edges = BTreeMap::new();
        for rule in EdgeRule::ALL {
            for (from, to) in rule.edges(&scope) {
                let (Some(&from), Some(&to)) = (index.get(&from), index.get(&to)) else {
                    return Err(Error::Internal(format!(
                        "{} rule produced an edge to an unknown vertex: {from} -> {to}",
                        rule.label()
                    )));
                };
                edges.entry((from, to)).or_insert(rule);
            }
        }

        let mut successors = vec![Vec::new(); vertices.len()];
        let mut predecessors = vec![Vec::new(); vertices.len()];
        for &(from, to) in edges.keys() {
            successors[from].push(to);
            predecessors[to].push(from);
        }

        let graph = DependencyGraph {
            vertices,
            index,
            edges,
            successors,
            predecessors,
            refs,
        };

        if let Some(cycle) = graph.find_cycle() {
            return Err(Error::CycleDetected {
                cycle: cycle.iter().map(|&i| graph.vertices[i].to_string()).collect(),
            });
        }

        log::debug!(
            "built dependency graph: {} stacks, {} vertices, {} edges",
            stacks.len(),
            graph.len(),
            graph.edge_count()
        );
        Ok(graph)
    }

    fn check_stack(&self, stack: &Stack, planned: &BTreeSet<&str>) -> Result<()> {
        let mut ids = BTreeSet::new();
        for node in &stack.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(Error::DuplicateNode {
                    stack: stack.name.clone(),
                    node: node.id.clone(),
                });
            }
            schema::validate_node(self.registry, &stack.key(&node.id), node)?;
        }

        for dependency in &stack.depends_on {
            if !planned.contains(dependency.as_str()) && !self.declared.contains(dependency) {
                return Err(Error::UnknownStack {
                    name: dependency.clone(),
                    referenced_by: Some(stack.name.clone()),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::OpenRegistry;
    use crate::value::Value;

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
    }

    fn node(stack: &str, id: &str) -> Vertex {
        Vertex::Node(NodeKey::new(stack, id))
    }

    #[test]
    fn test_vertices_in_declaration_order() {
        let graph = GraphBuilder::new(&OpenRegistry).build(&[network(), cluster()]).unwrap();
        let names: Vec<String> = graph.vertices().iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec![
                "network.vpc",
                "network.subnet",
                "stack:network",
                "cluster.remote.vpc-state",
                "cluster.ecr",
                "cluster.eks",
                "stack:cluster",
            ]
        );
    }

    #[test]
    fn test_edge_rules() {
        let graph = GraphBuilder::new(&OpenRegistry).build(&[network(), cluster()]).unwrap();
        let remote = Vertex::RemoteSource {
            stack: "cluster".into(),
            source: "vpc-state".into(),
        };
        let network_done = Vertex::Boundary("network".into());

        assert!(graph.has_edge(&node("network", "vpc"), &node("network", "subnet")));
        assert!(graph.has_edge(&node("network", "subnet"), &network_done));
        assert!(graph.has_edge(&network_done, &remote));
        assert!(graph.has_edge(&remote, &node("cluster", "eks")));
        assert!(graph.has_edge(&network_done, &node("cluster", "eks")));
        // The repository reads no remote state and is free to start immediately
        let ecr = graph.node_index(&NodeKey::new("cluster", "ecr")).unwrap();
        assert!(graph.predecessors(ecr).is_empty());

        let attribute: Vec<_> = graph.attribute_edges().collect();
        assert_eq!(attribute.len(), 1);
    }

    #[test]
    fn test_unplanned_backing_stack_adds_no_edge() {
        let graph = GraphBuilder::new(&OpenRegistry)
            .with_declared(["network"])
            .build(&[cluster()])
            .unwrap();
        let remote = graph
            .index_of(&Vertex::RemoteSource {
                stack: "cluster".into(),
                source: "vpc-state".into(),
            })
            .unwrap();
        assert!(graph.predecessors(remote).is_empty());
    }

    #[test]
    fn test_node_dependencies_look_through_virtual_vertices() {
        let graph = GraphBuilder::new(&OpenRegistry).build(&[network(), cluster()]).unwrap();
        let eks = graph.node_index(&NodeKey::new("cluster", "eks")).unwrap();
        assert_eq!(
            graph.node_dependencies(eks),
            vec![NodeKey::new("network", "subnet"), NodeKey::new("network", "vpc")]
        );
    }

    #[test]
    fn test_mutual_reference_is_a_cycle() {
        let stack = Stack::new("app")
            .resource("x", "thing", Value::map([("peer", Value::attr("y", "id"))]))
            .resource("y", "thing", Value::map([("peer", Value::attr("x", "id"))]));
        let err = GraphBuilder::new(&OpenRegistry).build(&[stack]).unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle detected: app.x -> app.y -> app.x");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let stack =
            Stack::new("app").resource("x", "thing", Value::map([("me", Value::attr("x", "id"))]));
        assert!(matches!(
            GraphBuilder::new(&OpenRegistry).build(&[stack]),
            Err(Error::CycleDetected { cycle }) if cycle == vec!["app.x", "app.x"]
        ));
    }

    #[test]
    fn test_cross_stack_cycle() {
        let a = Stack::new("a")
            .remote_state("from-b", "b")
            .resource("x", "thing", Value::map([("v", Value::remote("from-b", "out"))]));
        let b = Stack::new("b")
            .remote_state("from-a", "a")
            .resource("y", "thing", Value::map([("v", Value::remote("from-a", "out"))]));
        assert!(matches!(
            GraphBuilder::new(&OpenRegistry).build(&[a, b]),
            Err(Error::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_declaration_errors() {
        let dup = Stack::new("app")
            .resource("x", "thing", Value::empty_map())
            .resource("x", "thing", Value::empty_map());
        assert!(matches!(
            GraphBuilder::new(&OpenRegistry).build(&[dup]),
            Err(Error::DuplicateNode { node, .. }) if node == "x"
        ));

        assert!(matches!(
            GraphBuilder::new(&OpenRegistry).build(&[cluster()]),
            Err(Error::UnknownStack { name, .. }) if name == "network"
        ));

        assert!(matches!(
            GraphBuilder::new(&OpenRegistry).build(&[network(), network()]),
            Err(Error::DuplicateStack { .. })
        ));
    }

    #[test]
    fn test_dot_output() {
        let graph = GraphBuilder::new(&OpenRegistry).build(&[network(), cluster()]).unwrap();
        let dot = graph.to_dot();
        assert!(dot.starts_with("digraph stackplan {"));
        assert!(dot.contains("subgraph \"cluster_network\""));
        assert!(dot.contains("\"network.vpc\" -> \"network.subnet\" [label=\"attribute\"];"));
        assert!(dot.contains("\"stack:network\" -> \"cluster.eks\" [label=\"depends_on\"];"));
    }
}
