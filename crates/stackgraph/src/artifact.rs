//! Plan artifact
//!
//! The serializable form of a compiled plan. References stay symbolic
//! (`${...}`), so the artifact never contains a variable's value, and it is
//! fingerprinted with blake3 over its canonical content. Compiling the same
//! declarations twice produces byte-identical artifacts.

use crate::compiler::CompiledPlan;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Current plan artifact format
pub const ARTIFACT_VERSION: u32 = 1;

/// A planned node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedNode {
    /// `stack.node`
    pub address: String,
    pub kind: String,
    /// Nodes that must be applied first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Configuration with references left symbolic
    pub config: serde_json::Value,
}

/// A planned batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedBatch {
    pub index: usize,
    pub nodes: Vec<PlannedNode>,
}

/// Serializable plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanArtifact {
    pub version: u32,
    pub stacks: Vec<String>,
    pub batches: Vec<PlannedBatch>,
    pub fingerprint: String,
}

impl PlanArtifact {
    pub fn new(compiled: &CompiledPlan) -> Self {
        let graph = compiled.graph();
        let batches: Vec<PlannedBatch> = compiled
            .plan()
            .batches
            .iter()
            .enumerate()
            .map(|(index, batch)| PlannedBatch {
                index,
                nodes: batch
                    .nodes
                    .iter()
                    .filter_map(|key| {
                        let node = compiled.node(key)?;
                        let depends_on = graph
                            .node_index(key)
                            .map(|i| graph.node_dependencies(i))
                            .unwrap_or_default()
                            .iter()
                            .map(ToString::to_string)
                            .collect();
                        Some(PlannedNode {
                            address: key.to_string(),
                            kind: node.kind.clone(),
                            depends_on,
                            config: node.config.to_symbolic_json(),
                        })
                    })
                    .collect(),
            })
            .collect();
        let stacks: Vec<String> = compiled.stacks().iter().map(|s| s.name.clone()).collect();
        let fingerprint = fingerprint(&stacks, &batches);

        Self {
            version: ARTIFACT_VERSION,
            stacks,
            batches,
            fingerprint,
        }
    }

    /// Pretty JSON, newline terminated
    pub fn to_json(&self) -> Result<String> {
        let mut out = serde_json::to_string_pretty(self)?;
        out.push('\n');
        Ok(out)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Whether the fingerprint matches the content
    pub fn is_intact(&self) -> bool {
        fingerprint(&self.stacks, &self.batches) == self.fingerprint
    }

    /// Batch index and entry for `address`
    pub fn find(&self, address: &str) -> Option<(usize, &PlannedNode)> {
        self.batches.iter().find_map(|batch| {
            batch
                .nodes
                .iter()
                .find(|n| n.address == address)
                .map(|n| (batch.index, n))
        })
    }

    /// Total number of planned nodes
    pub fn node_count(&self) -> usize {
        self.batches.iter().map(|b| b.nodes.len()).sum()
    }
}

fn fingerprint(stacks: &[String], batches: &[PlannedBatch]) -> String {
    let mut hasher = blake3::Hasher::new();
    for stack in stacks {
        hasher.update(stack.as_bytes());
        hasher.update(b"\n");
    }
    for batch in batches {
        hasher.update(format!("batch {}\n", batch.index).as_bytes());
        for node in &batch.nodes {
            hasher.update(node.address.as_bytes());
            hasher.update(b"\0");
            hasher.update(node.kind.as_bytes());
            hasher.update(b"\0");
            hasher.update(node.depends_on.join(",").as_bytes());
            hasher.update(b"\0");
            // serde_json maps are sorted, so this rendering is canonical
            hasher.update(node.config.to_string().as_bytes());
            hasher.update(b"\n");
        }
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::remote_state::RemoteStateBridge;
    use crate::schema::OpenRegistry;
    use crate::stack::{Stack, Variable};
    use crate::state::MemoryStateStore;
    use crate::value::Value;
    use crate::variables::MapSource;

    const SECRET: &str = "AKIA-super-secret-value-123";

    fn project() -> Vec<Stack> {
        vec![
            Stack::new("network")
                .resource(
                    "vpc",
                    "aws_vpc",
                    Value::map([("cidr_block", Value::string("10.0.0.0/16"))]),
                )
                .resource(
                    "subnet",
                    "aws_subnet",
                    Value::map([("vpc_id", Value::attr("vpc", "id"))]),
                )
                .output("vpc_id", Value::attr("vpc", "id")),
            Stack::new("cluster")
                .variable(Variable::string("AWS_SECRET_ACCESS_KEY").sensitive())
                .remote_state("vpc-state", "network")
                .resource(
                    "eks",
                    "aws_eks_cluster",
                    Value::map([
                        ("vpc_id", Value::remote("vpc-state", "vpc_id")),
                        ("secret_key", Value::var("AWS_SECRET_ACCESS_KEY")),
                    ]),
                )
                .depends_on("network"),
        ]
    }

    fn artifact() -> PlanArtifact {
        let store = MemoryStateStore::new();
        let bridge = RemoteStateBridge::new(&store);
        let flags = MapSource::new("flags").set("AWS_SECRET_ACCESS_KEY", SECRET);
        Compiler::new(&OpenRegistry)
            .compile(&project(), &[], &[&flags], &bridge)
            .unwrap()
            .artifact()
    }

    #[test]
    fn test_artifact_contents() {
        let artifact = artifact();
        assert_eq!(artifact.stacks, vec!["network", "cluster"]);
        assert_eq!(artifact.node_count(), 3);

        let (batch, eks) = artifact.find("cluster.eks").unwrap();
        assert_eq!(batch, 2);
        assert_eq!(eks.depends_on, vec!["network.subnet", "network.vpc"]);
        assert_eq!(eks.config["vpc_id"], serde_json::json!("${remote.vpc-state.vpc_id}"));
        assert_eq!(
            eks.config["secret_key"],
            serde_json::json!("${var.AWS_SECRET_ACCESS_KEY}")
        );
    }

    #[test]
    fn test_artifact_never_contains_secret() {
        let json = artifact().to_json().unwrap();
        assert!(!json.contains(SECRET));
    }

    #[test]
    fn test_replanning_is_byte_identical() {
        let first = artifact().to_json().unwrap();
        let second = artifact().to_json().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fingerprint_detects_tampering() {
        let json = artifact().to_json().unwrap();
        let mut loaded = PlanArtifact::from_json(&json).unwrap();
        assert!(loaded.is_intact());

        loaded.batches[0].nodes[0].kind = "aws_default_vpc".into();
        assert!(!loaded.is_intact());
    }
}
