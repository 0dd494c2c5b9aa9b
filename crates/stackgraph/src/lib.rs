//! # Stackgraph
//!
//! A compiler for declarative resource graphs spread over several stacks.
//!
//! Stacks declare resource nodes whose configuration may reference other
//! nodes' attributes, input variables, or outputs that another stack has
//! already persisted. The compiler turns those references into a dependency
//! graph, extracts batches of nodes that can run concurrently, and executes
//! them through a pluggable backend.
//!
//! ## Core Concepts
//!
//! - **Stack**: A deployable unit of nodes, variables, remote state sources and outputs
//! - **Reference**: A deferred pointer (`${node.attr}`, `${var.NAME}`, `${remote.SOURCE.KEY}`)
//! - **DependencyGraph**: Nodes plus ordering-only vertices, built by edge rules
//! - **ExecutionPlan**: Ordered batches; every dependency sits in an earlier batch
//! - **RemoteStateBridge**: Lazy, cached reader of other stacks' persisted outputs
//! - **Executor**: Applies batches on a bounded thread pool and persists stack state
//!
//! ## Example
//!
//! ```ignore
//! use stackgraph::{
//!     Compiler, Environment, ExecuteOptions, LocalStateStore, MapSource, OpenRegistry,
//!     RemoteStateBridge, Stack, Value, apply, AutoConfirm, NoProgress,
//! };
//!
//! let network = Stack::new("network")
//!     .resource("vpc", "aws_vpc", Value::map([("cidr_block", Value::string("10.0.0.0/16"))]))
//!     .output("vpc_id", Value::attr("vpc", "id"));
//! let cluster = Stack::new("cluster")
//!     .remote_state("vpc-state", "network")
//!     .resource(
//!         "eks",
//!         "aws_eks_cluster",
//!         Value::map([("vpc_id", Value::remote("vpc-state", "vpc_id"))]),
//!     )
//!     .depends_on("network");
//!
//! let store = LocalStateStore::new("state");
//! let bridge = RemoteStateBridge::new(&store);
//! let compiled = Compiler::new(&OpenRegistry).compile(&[network, cluster], &[], &[], &bridge)?;
//!
//! let env = Environment { backend: &my_backend, store: &store, bridge: &bridge };
//! let opts = ExecuteOptions::default();
//! let summary = apply(&compiled, &env, &opts, &mut NoProgress, &mut AutoConfirm)?;
//! ```
//!
//! ## Provider Traits
//!
//! - [`ExecutionBackend`]: Creates and destroys resources
//! - [`SchemaRegistry`]: Describes resource kinds
//! - [`StateReader`] / [`StateStore`]: Read and write stack state artifacts
//! - [`VariableSource`]: Supplies variable values
//! - [`ProgressCallback`] / [`ConfirmCallback`]: User interaction

pub mod artifact;
pub mod compiler;
pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod remote_state;
pub mod resolver;
pub mod schema;
pub mod stack;
pub mod state;
pub mod types;
pub mod value;
pub mod variables;

// Re-export main types at crate root
pub use artifact::{ARTIFACT_VERSION, PlanArtifact, PlannedBatch, PlannedNode};
pub use compiler::{CompiledPlan, Compiler};
pub use context::{
    AutoConfirm, AutoDecline, ConfirmCallback, ExecutionBackend, NoProgress, ProgressCallback,
};
pub use diff::{ChangedNode, MovedNode, PlanDiff};
pub use error::{Error, ErrorCategory, Result};
pub use executor::{Environment, apply, destroy};
pub use graph::{DependencyGraph, EdgeRule, GraphBuilder, Vertex};
pub use planner::{Batch, ExecutionPlan};
pub use remote_state::RemoteStateBridge;
pub use schema::{
    FieldSpec, FieldType, OpenRegistry, ResourceSchema, SchemaRegistry, StaticRegistry,
};
pub use stack::{NodeKey, RemoteStateSource, ResourceNode, Stack, StackOutput, VarType, Variable};
pub use state::{LocalStateStore, MemoryStateStore, NodeRecord, StackState, StateReader, StateStore};
pub use types::{Attributes, ExecuteOptions, ExecuteSummary, ExecutionFailure, NodeResult};
pub use value::{Literal, OutputShape, OutputValue, Reference, Value};
pub use variables::{BoundValue, BoundVariables, EnvSource, MapSource, REDACTED, VariableSource};
