//! Diff computation between plan artifacts

use crate::artifact::PlanArtifact;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A node scheduled in a different batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovedNode {
    pub address: String,
    pub from: usize,
    pub to: usize,
}

/// A node whose kind or configuration changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedNode {
    pub address: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
}

/// Differences between two plan artifacts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub moved: Vec<MovedNode>,
    pub changed: Vec<ChangedNode>,
}

impl PlanDiff {
    /// Compare `old` with `new`; addresses are reported in `new`'s order, removals in `old`'s
    pub fn between(old: &PlanArtifact, new: &PlanArtifact) -> Self {
        let before: BTreeMap<&str, (usize, serde_json::Value)> = old
            .batches
            .iter()
            .flat_map(|b| b.nodes.iter().map(move |n| (n.address.as_str(), (b.index, entry(n)))))
            .collect();
        let mut diff = Self::default();

        for batch in &new.batches {
            for node in &batch.nodes {
                let Some((old_batch, old_entry)) = before.get(node.address.as_str()) else {
                    diff.added.push(node.address.clone());
                    continue;
                };
                if *old_batch != batch.index {
                    diff.moved.push(MovedNode {
                        address: node.address.clone(),
                        from: *old_batch,
                        to: batch.index,
                    });
                }
                let new_entry = entry(node);
                if *old_entry != new_entry {
                    diff.changed.push(ChangedNode {
                        address: node.address.clone(),
                        before: old_entry.clone(),
                        after: new_entry,
                    });
                }
            }
        }

        for batch in &old.batches {
            for node in &batch.nodes {
                if new.find(&node.address).is_none() {
                    diff.removed.push(node.address.clone());
                }
            }
        }

        diff
    }

    /// Check if the plans are equivalent
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.moved.is_empty()
            && self.changed.is_empty()
    }

    /// One-line summary, e.g. "1 added, 0 removed, 2 moved, 1 changed"
    pub fn summary(&self) -> String {
        format!(
            "{} added, {} removed, {} moved, {} changed",
            self.added.len(),
            self.removed.len(),
            self.moved.len(),
            self.changed.len()
        )
    }
}

/// Kind and configuration, compared as one value
fn entry(node: &crate::artifact::PlannedNode) -> serde_json::Value {
    serde_json::json!({ "kind": node.kind, "config": node.config })
}

impl fmt::Display for PlanDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for address in &self.added {
            writeln!(f, "+ {address}")?;
        }
        for address in &self.removed {
            writeln!(f, "- {address}")?;
        }
        for moved in &self.moved {
            writeln!(f, "> {} (batch {} -> {})", moved.address, moved.from, moved.to)?;
        }
        for changed in &self.changed {
            writeln!(f, "~ {}", changed.address)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ARTIFACT_VERSION, PlannedBatch, PlannedNode};

    fn node(address: &str, config: serde_json::Value) -> PlannedNode {
        PlannedNode {
            address: address.into(),
            kind: "thing".into(),
            depends_on: Vec::new(),
            config,
        }
    }

    fn artifact(batches: Vec<Vec<PlannedNode>>) -> PlanArtifact {
        PlanArtifact {
            version: ARTIFACT_VERSION,
            stacks: vec!["app".into()],
            batches: batches
                .into_iter()
                .enumerate()
                .map(|(index, nodes)| PlannedBatch { index, nodes })
                .collect(),
            fingerprint: String::new(),
        }
    }

    #[test]
    fn test_identical_plans() {
        let plan = artifact(vec![vec![node("app.a", serde_json::json!({}))]]);
        let diff = PlanDiff::between(&plan, &plan.clone());
        assert!(diff.is_empty());
        assert_eq!(diff.to_string(), "");
    }

    #[test]
    fn test_added_removed_moved_changed() {
        let old = artifact(vec![
            vec![
                node("app.a", serde_json::json!({ "size": 1 })),
                node("app.gone", serde_json::json!({})),
            ],
            vec![node("app.b", serde_json::json!({}))],
        ]);
        let new = artifact(vec![
            vec![
                node("app.a", serde_json::json!({ "size": 2 })),
                node("app.b", serde_json::json!({})),
            ],
            vec![node("app.c", serde_json::json!({}))],
        ]);

        let diff = PlanDiff::between(&old, &new);
        assert_eq!(diff.added, vec!["app.c"]);
        assert_eq!(diff.removed, vec!["app.gone"]);
        assert_eq!(
            diff.moved,
            vec![MovedNode {
                address: "app.b".into(),
                from: 1,
                to: 0
            }]
        );
        assert_eq!(diff.changed.len(), 1);
        assert_eq!(diff.changed[0].address, "app.a");
        assert_eq!(diff.summary(), "1 added, 1 removed, 1 moved, 1 changed");
        assert!(diff.to_string().contains("> app.b (batch 1 -> 0)"));
    }
}
