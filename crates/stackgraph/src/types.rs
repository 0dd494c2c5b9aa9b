//! Core types for plan execution

use crate::error::Error;
use crate::stack::NodeKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attributes exported by an applied node
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Result of executing a single node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeResult {
    /// Node was applied
    Applied,
    /// Node was destroyed
    Destroyed,
    /// Execution failed
    Failed { error: String },
    /// Node was not executed
    Skipped { reason: String },
}

impl NodeResult {
    /// Check if the result represents success (no failure)
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    /// Applied nodes, in completion order
    pub applied: Vec<NodeKey>,
    /// Destroyed nodes, in completion order
    pub destroyed: Vec<NodeKey>,
    /// Failed nodes with their error messages
    pub failed: Vec<(NodeKey, String)>,
    /// Nodes in batches that were never dispatched
    pub not_started: Vec<NodeKey>,
    /// Nodes skipped because there was nothing to do
    pub skipped: Vec<NodeKey>,
    /// Stacks whose state was written, in write order
    pub persisted: Vec<String>,
    /// Batches that ran to completion
    pub batches_completed: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.applied.len() + self.destroyed.len()
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Add a result to the summary
    pub fn add_result(&mut self, key: &NodeKey, result: &NodeResult) {
        match result {
            NodeResult::Applied => self.applied.push(key.clone()),
            NodeResult::Destroyed => self.destroyed.push(key.clone()),
            NodeResult::Failed { error } => self.failed.push((key.clone(), error.clone())),
            NodeResult::Skipped { .. } => self.skipped.push(key.clone()),
        }
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum number of nodes applied concurrently
    pub jobs: usize,
    /// Destroy recorded nodes that are no longer declared
    pub prune: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            prune: true,
        }
    }
}

/// Execution stopped at a failing batch
///
/// Nodes already applied stay applied; the summary says which ones.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    /// First failure observed
    pub error: Error,
    pub summary: ExecuteSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = ExecuteSummary::default();
        summary.add_result(&NodeKey::new("network", "vpc"), &NodeResult::Applied);
        summary.add_result(&NodeKey::new("network", "old"), &NodeResult::Destroyed);
        assert_eq!(summary.total_changes(), 2);
        assert!(summary.is_success());

        summary.add_result(
            &NodeKey::new("network", "subnet"),
            &NodeResult::Failed {
                error: "quota exceeded".into(),
            },
        );
        assert!(!summary.is_success());
        assert!(!NodeResult::Failed { error: String::new() }.is_success());
    }
}
