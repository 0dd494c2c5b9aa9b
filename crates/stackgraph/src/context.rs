//! Execution backend and callback traits
//!
//! These traits keep the compiler independent of how resources are actually
//! created and of how progress is shown to a user.

use crate::stack::NodeKey;
use crate::types::{Attributes, NodeResult};
use anyhow::Result;

/// Creates and destroys resources
///
/// Calls for nodes in the same batch may run concurrently on different
/// threads. The backend only ever sees fully resolved configuration.
pub trait ExecutionBackend: Send + Sync {
    /// Create or update the node, returning the attributes it exports
    fn apply(&self, key: &NodeKey, kind: &str, config: &serde_json::Value) -> Result<Attributes>;

    /// Remove the node
    fn destroy(&self, key: &NodeKey, kind: &str) -> Result<()>;
}

/// Progress callback for execution operations
///
/// Implement this trait to receive progress updates during execution.
/// All calls are made from the coordinating thread.
pub trait ProgressCallback: Send {
    /// Called when a batch is about to be dispatched
    fn on_batch_start(&mut self, index: usize, total: usize, nodes: &[NodeKey]);

    /// Called when a node finishes
    fn on_node_complete(&mut self, key: &NodeKey, result: &NodeResult);

    /// Called when every node of a batch has finished
    fn on_batch_complete(&mut self, index: usize);

    /// Called after a stack's state artifact has been written
    fn on_stack_persisted(&mut self, _stack: &str) {}
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback: Send {
    /// Ask the user to confirm an action
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_batch_start(&mut self, _index: usize, _total: usize, _nodes: &[NodeKey]) {}
    fn on_node_complete(&mut self, _key: &NodeKey, _result: &NodeResult) {}
    fn on_batch_complete(&mut self, _index: usize) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}
