//! Error types for compiling and executing stacks.
//!
//! Errors are categorized by the phase that produced them. Declaration and
//! planning errors abort before anything is executed; execution errors stop
//! forward progress but leave already-applied resources in place.
//!
//! No variant ever carries a variable's value. Variables are reported by
//! name only, so a sensitive input cannot leak through an error message.

use crate::stack::NodeKey;
use crate::value::{OutputShape, Reference};
use thiserror::Error;

/// Phase an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The declarations themselves are wrong (dangling reference, cycle, schema)
    Declaration,
    /// An external input is missing or malformed (variables, remote state)
    Planning,
    /// The execution backend failed while applying or destroying a node
    Execution,
    /// A compiler invariant was violated
    Internal,
    /// Reading or writing a state artifact failed
    Io,
}

impl ErrorCategory {
    /// Whether re-running the same operation may succeed without changing declarations.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution | Self::Io)
    }

    /// Short description of the category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Declaration => "Invalid declaration",
            Self::Planning => "Planning input unavailable",
            Self::Execution => "Execution failed",
            Self::Internal => "Internal invariant violated",
            Self::Io => "State storage error",
        }
    }

    /// Actionable advice for resolving errors of this category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Declaration => "Fix the stack declarations and plan again",
            Self::Planning => "Provide the missing input or apply the stack it depends on first",
            Self::Execution => "Inspect the partially applied state, then plan and apply again",
            Self::Internal => "Report this as a bug together with the plan artifact",
            Self::Io => "Check the state directory exists and is writable",
        }
    }
}

/// Errors produced by the compiler and executor.
#[derive(Debug, Error)]
pub enum Error {
    /// A reference names a node, remote state source or variable that does not exist
    #[error("unresolved reference {reference} in {node}")]
    UnresolvedReference {
        /// Node (or `stack.output.<name>`) containing the reference
        node: String,
        /// The dangling reference
        reference: Reference,
    },

    /// A reference names an attribute the target does not export
    #[error("{node} references unknown attribute '{attribute}' of {target}")]
    UnknownAttribute {
        /// Node containing the reference
        node: String,
        /// Referenced node
        target: NodeKey,
        /// Attribute that is not exported
        attribute: String,
    },

    /// Two nodes share an id within one stack
    #[error("duplicate node id '{node}' in stack '{stack}'")]
    DuplicateNode {
        /// Stack name
        stack: String,
        /// Duplicated node id
        node: String,
    },

    /// Two stacks share a name
    #[error("duplicate stack '{name}'")]
    DuplicateStack {
        /// Stack name
        name: String,
    },

    /// A stack dependency or selection names a stack that is not declared
    #[error(
        "unknown stack '{name}'{}",
        .referenced_by.as_ref().map(|s| format!(" (referenced by '{s}')")).unwrap_or_default()
    )]
    UnknownStack {
        /// Missing stack name
        name: String,
        /// Stack that referenced it, if any
        referenced_by: Option<String>,
    },

    /// A node uses a resource kind the schema registry does not know
    #[error("{node} has unregistered resource kind '{kind}'")]
    UnknownKind {
        /// Node address
        node: NodeKey,
        /// Kind name
        kind: String,
    },

    /// A node's configuration does not match its kind's schema
    #[error("{node}: field '{field}' {message}")]
    SchemaViolation {
        /// Node address
        node: NodeKey,
        /// Offending field
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// The dependency graph contains a cycle
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected {
        /// Vertex ids along the cycle; the first id is repeated at the end
        cycle: Vec<String>,
    },

    /// The backing stack has not produced outputs, or lacks the key
    #[error(
        "remote state '{source_id}' (stack '{stack}') unavailable: {}",
        missing_remote(.key.as_deref())
    )]
    RemoteStateUnavailable {
        /// Remote state source id
        source_id: String,
        /// Backing stack name
        stack: String,
        /// Missing key, or `None` if the whole artifact is missing
        key: Option<String>,
    },

    /// The stored output has a different shape than requested
    #[error("remote state '{source_id}' output '{key}' is a {found}, expected a {expected}")]
    RemoteStateType {
        /// Remote state source id
        source_id: String,
        /// Output key
        key: String,
        /// Requested shape
        expected: OutputShape,
        /// Stored shape
        found: OutputShape,
    },

    /// A variable without a default has no bound value
    #[error("variable '{name}' in stack '{stack}' has no value and no default")]
    UnboundVariable {
        /// Stack name
        stack: String,
        /// Variable name
        name: String,
    },

    /// A bound value cannot be parsed as the declared type
    #[error("variable '{name}' in stack '{stack}' is not a valid {expected}")]
    InvalidVariable {
        /// Stack name
        stack: String,
        /// Variable name
        name: String,
        /// Declared type
        expected: &'static str,
    },

    /// The execution backend failed for a node
    #[error("{node} failed in batch {batch}: {message}")]
    Execution {
        /// Failing node
        node: NodeKey,
        /// Zero-based batch index
        batch: usize,
        /// Backend error message
        message: String,
    },

    /// A stack output could not be evaluated after its stack was applied
    #[error("output '{name}' of stack '{stack}': {message}")]
    InvalidOutput {
        /// Stack name
        stack: String,
        /// Output name
        name: String,
        /// What is wrong with it
        message: String,
    },

    /// A compiler invariant was violated
    #[error("internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn missing_remote(key: Option<&str>) -> String {
    match key {
        Some(k) => format!("no output '{k}'"),
        None => "stack has not been applied".to_string(),
    }
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::UnresolvedReference { .. }
            | Error::UnknownAttribute { .. }
            | Error::DuplicateNode { .. }
            | Error::DuplicateStack { .. }
            | Error::UnknownStack { .. }
            | Error::UnknownKind { .. }
            | Error::SchemaViolation { .. }
            | Error::CycleDetected { .. } => ErrorCategory::Declaration,
            Error::RemoteStateUnavailable { .. }
            | Error::RemoteStateType { .. }
            | Error::UnboundVariable { .. }
            | Error::InvalidVariable { .. } => ErrorCategory::Planning,
            Error::Execution { .. } | Error::InvalidOutput { .. } => ErrorCategory::Execution,
            Error::Internal(_) => ErrorCategory::Internal,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Io,
        }
    }

    /// Whether this error is worth retrying without changing declarations.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

/// Result type for compiler operations.
pub type Result<T> = std::result::Result<T, Error>;
