use super::types::TypeDescriptor;
use serde_json::{Map, Value};

/// The complete, canonical definition of a workflow graph, ready for compilation.
/// This is the target structure for any custom document conversion.
#[derive(Debug, Clone, Default)]
pub struct WorkflowGraph {
    pub entrypoint: String,
    pub nodes: Vec<NodeDefinition>,
    pub edges: Vec<EdgeDefinition>,
    pub state_schema: Vec<StateFieldDefinition>,
    pub tools: Vec<ToolDefinition>,
}

impl WorkflowGraph {
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// A single node of the workflow graph. `node_type` is resolved through the compiler's
/// type registry, so authoring aliases are allowed here.
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    pub id: String,
    pub node_type: String,
    pub label: String,
    pub config: Map<String, Value>,
}

impl NodeDefinition {
    pub fn new(id: &str, node_type: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            label: label.to_string(),
            config: Map::new(),
        }
    }

    pub fn with_config(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }

    /// Returns the first present, non-empty string among `keys`.
    pub fn config_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|k| self.config.get(*k))
            .filter_map(Value::as_str)
            .find(|s| !s.trim().is_empty())
    }
}

/// Whether an edge carries a branch label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Direct,
    Branch,
}

/// Defines a connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeDefinition {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    pub branch_label: Option<String>,
    pub implicit: bool,
}

impl EdgeDefinition {
    pub fn direct(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind: EdgeKind::Direct,
            branch_label: None,
            implicit: false,
        }
    }

    pub fn branch(from: &str, to: &str, label: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind: EdgeKind::Branch,
            branch_label: Some(label.to_string()),
            implicit: false,
        }
    }
}

/// An author-declared shared-state field.
#[derive(Debug, Clone, PartialEq)]
pub struct StateFieldDefinition {
    pub name: String,
    pub descriptor: TypeDescriptor,
}

/// How a capability is reached at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    Remote,
    Inline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolArgument {
    pub name: String,
    pub arg_type: String,
    pub required: bool,
    pub description: String,
}

/// A remote endpoint: base address plus HTTP method and path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub address: String,
    pub method: String,
    pub path: String,
}

impl RemoteEndpoint {
    /// Builds an endpoint from a `"GET /mcp/fn"` style method string.
    pub fn from_method_line(address: &str, method_line: &str) -> Self {
        let mut parts = method_line.split_whitespace();
        let method = parts.next().unwrap_or("GET").to_ascii_uppercase();
        let path = parts.collect::<Vec<_>>().join(" ");
        Self {
            address: address.trim_end_matches('/').to_string(),
            method,
            path: if path.is_empty() { "/".to_string() } else { path },
        }
    }
}

/// A named capability a decision node may invoke.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub kind: ToolKind,
    pub description: String,
    pub arguments: Vec<ToolArgument>,
    pub return_schema: Value,
    pub remote: Option<RemoteEndpoint>,
    pub inline_body: Option<String>,
}

impl ToolDefinition {
    pub fn default_return_schema() -> Value {
        serde_json::json!({ "success": "bool" })
    }
}
