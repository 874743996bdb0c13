use std::fmt;
use thiserror::Error;

/// The four failure families a compilation can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Structure,
    Graph,
    Reference,
    Generation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Structure => write!(f, "StructureError"),
            ErrorCategory::Graph => write!(f, "GraphError"),
            ErrorCategory::Reference => write!(f, "ReferenceError"),
            ErrorCategory::Generation => write!(f, "GenerationError"),
        }
    }
}

/// Errors that can occur while compiling a workflow document into a program.
///
/// All of them are fatal: compilation is all-or-nothing and no partial program is produced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    // --- Structure ---
    #[error("Failed to parse workflow document JSON: {0}")]
    JsonParseError(String),

    #[error("Workflow document is missing required key '{key}'")]
    MissingKey { key: String },

    #[error("Workflow document does not declare any nodes")]
    EmptyNodeList,

    #[error("Malformed {element} in workflow document: {message}")]
    MalformedElement { element: String, message: String },

    // --- Graph ---
    #[error("Node '{node_id}' has an unregistered or unsupported node type: '{type_name}'")]
    UnsupportedNodeType { node_id: String, type_name: String },

    #[error("Node id '{node_id}' is declared more than once")]
    DuplicateNodeId { node_id: String },

    #[error(
        "Node '{missing_node_id}' not found, which is required by a reference from '{source_node_id}'"
    )]
    NodeNotFound {
        missing_node_id: String,
        source_node_id: String,
    },

    #[error("Entrypoint '{node_id}' is invalid: {message}")]
    InvalidEntrypoint { node_id: String, message: String },

    #[error("Conditional node '{node_id}' has no non-conditional upstream node to return to")]
    ConditionalWithoutParent { node_id: String },

    #[error("Conditional node '{node_id}' is malformed: {message}")]
    InvalidConditional { node_id: String, message: String },

    #[error(
        "Tool node '{node_id}' is claimed by both '{first_owner}' and '{second_owner}'; a tool node must have exactly one owner"
    )]
    AmbiguousToolOwner {
        node_id: String,
        first_owner: String,
        second_owner: String,
    },

    #[error("Tool node '{node_id}' is not reachable from a conditional 'true' branch and has no owner")]
    UnownedToolNode { node_id: String },

    #[error("Node '{node_id}' has more than one direct successor: {targets}")]
    AmbiguousSuccessor { node_id: String, targets: String },

    #[error("Decision node '{node_id}' owns more than one tool node: {tools}")]
    MultipleToolNodes { node_id: String, tools: String },

    #[error("Worker '{node_id}' is bound into a cycle of worker capabilities")]
    CyclicWorkerBinding { node_id: String },

    #[error("Router '{node_id}' is malformed: {message}")]
    InvalidRouter { node_id: String, message: String },

    // --- Reference ---
    #[error("Router '{router_id}' maps label '{label}' to '{destination}', which resolves to no node")]
    UnresolvedRoute {
        router_id: String,
        label: String,
        destination: String,
    },

    #[error("Router '{router_id}' has an edge to '{target_id}', which is not one of its routing choices")]
    UnmappedRouteTarget { router_id: String, target_id: String },

    // --- Generation ---
    #[error("Node '{node_id}' selects capability '{capability}', which is defined nowhere")]
    UnresolvedCapability { node_id: String, capability: String },

    #[error("State field '{field}' generated for '{node_id}' collides with an existing field")]
    FieldCollision { field: String, node_id: String },

    #[error("Could not generate '{fragment}': {message}")]
    Generation { fragment: String, message: String },
}

impl CompileError {
    /// Maps a concrete failure onto its taxonomy family.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CompileError::JsonParseError(_)
            | CompileError::MissingKey { .. }
            | CompileError::EmptyNodeList
            | CompileError::MalformedElement { .. } => ErrorCategory::Structure,
            CompileError::UnsupportedNodeType { .. }
            | CompileError::DuplicateNodeId { .. }
            | CompileError::NodeNotFound { .. }
            | CompileError::InvalidEntrypoint { .. }
            | CompileError::ConditionalWithoutParent { .. }
            | CompileError::InvalidConditional { .. }
            | CompileError::AmbiguousToolOwner { .. }
            | CompileError::UnownedToolNode { .. }
            | CompileError::AmbiguousSuccessor { .. }
            | CompileError::MultipleToolNodes { .. }
            | CompileError::CyclicWorkerBinding { .. }
            | CompileError::InvalidRouter { .. } => ErrorCategory::Graph,
            CompileError::UnresolvedRoute { .. } | CompileError::UnmappedRouteTarget { .. } => {
                ErrorCategory::Reference
            }
            CompileError::UnresolvedCapability { .. }
            | CompileError::FieldCollision { .. }
            | CompileError::Generation { .. } => ErrorCategory::Generation,
        }
    }
}

/// Errors raised while executing a compiled program.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Output field '{field}' not found in structured output from node {node_id}")]
    MissingOutputField { node_id: String, field: String },

    #[error("Router '{router_id}' chose '{choice}', which is not one of its routing labels")]
    InvalidRoute { router_id: String, choice: String },

    #[error("Routine '{0}' is referenced but not defined in the program")]
    UnknownRoutine(String),

    #[error("Decision procedure '{instance}' failed: {message}")]
    Procedure { instance: String, message: String },

    #[error("State field '{field}' cannot merge a {found} value under the {policy} policy")]
    StateType {
        field: String,
        policy: String,
        found: String,
    },

    #[error("Run exceeded the step limit of {0} routine invocations")]
    StepLimitExceeded(usize),
}

/// Errors that can occur while evaluating a condition expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Could not parse expression at position {position}: {message}")]
    Parse { position: usize, message: String },

    #[error(
        "Type mismatch during operation '{operation}': expected {expected}, but found value '{found}'"
    )]
    TypeMismatch {
        operation: String,
        expected: String,
        found: serde_json::Value,
    },

    #[error("State field '{0}' not found")]
    FieldNotFound(String),
}

/// Errors that can occur when saving or loading compiled artifacts and data files.
#[derive(Error, Debug, Clone)]
pub enum ArtifactError {
    #[error("Artifact error: {0}")]
    Generic(String),
}
