use super::types::{UiDocument, UiEdge, UiNode, UiTool, UiTools};
use crate::error::CompileError;
use crate::workflow::{
    EdgeDefinition, EdgeKind, IntoWorkflow, MergePolicy, NodeDefinition, RemoteEndpoint,
    StateFieldDefinition, ToolArgument, ToolDefinition, ToolKind, TypeDescriptor, WorkflowGraph,
};
use serde_json::Value;
use tracing::warn;

impl UiDocument {
    /// Parses a document from JSON text.
    pub fn from_json(json: &str) -> Result<Self, CompileError> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| CompileError::JsonParseError(e.to_string()))?;
        Self::from_value(value)
    }

    /// Accepts either a `{"graph": {...}}` wrapper or the bare graph object, checking the
    /// required keys before deserializing so a missing key is reported by name.
    pub fn from_value(value: Value) -> Result<Self, CompileError> {
        let graph = match value {
            Value::Object(mut map) if map.contains_key("graph") => map
                .remove("graph")
                .unwrap_or(Value::Null),
            other => other,
        };

        let Value::Object(object) = &graph else {
            return Err(CompileError::MalformedElement {
                element: "document".to_string(),
                message: "the graph must be a JSON object".to_string(),
            });
        };

        match object.get("entrypoint") {
            Some(Value::String(id)) if !id.trim().is_empty() => {}
            _ => {
                return Err(CompileError::MissingKey {
                    key: "entrypoint".to_string(),
                });
            }
        }
        match object.get("nodes") {
            Some(Value::Array(nodes)) if nodes.is_empty() => return Err(CompileError::EmptyNodeList),
            Some(Value::Array(_)) => {}
            _ => {
                return Err(CompileError::MissingKey {
                    key: "nodes".to_string(),
                });
            }
        }

        serde_json::from_value(graph).map_err(|e| CompileError::MalformedElement {
            element: "graph".to_string(),
            message: e.to_string(),
        })
    }
}

impl IntoWorkflow for UiDocument {
    fn into_workflow(self) -> Result<WorkflowGraph, CompileError> {
        let nodes = self.nodes.into_iter().map(convert_node).collect();
        let edges = self.edges.into_iter().map(convert_edge).collect();

        let state_schema = self
            .state
            .map(|state| {
                state
                    .schema
                    .into_iter()
                    .map(|(name, declared)| convert_field(name, &declared))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        let tools = convert_tools(self.tools)?;

        Ok(WorkflowGraph {
            entrypoint: self.entrypoint,
            nodes,
            edges,
            state_schema,
            tools,
        })
    }
}

fn convert_node(node: UiNode) -> NodeDefinition {
    let label = node
        .label
        .filter(|l| !l.trim().is_empty())
        .or_else(|| {
            node.config
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| node.id.clone());
    NodeDefinition {
        id: node.id,
        node_type: node.node_type,
        label,
        config: node.config,
    }
}

fn convert_edge(edge: UiEdge) -> EdgeDefinition {
    let label = edge.condition.and_then(|c| match c {
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    });
    let kind = match edge.edge_type.as_deref() {
        Some("ConditionalEdge") | Some("Branch") => EdgeKind::Branch,
        Some("NormalEdge") | Some("Direct") | None => EdgeKind::Direct,
        Some(other) => {
            warn!(from = %edge.from, to = %edge.to, edge_type = %other, "unknown edge type, treating as direct");
            EdgeKind::Direct
        }
    };
    EdgeDefinition {
        from: edge.from,
        to: edge.to,
        kind,
        branch_label: label,
        implicit: edge.implicit,
    }
}

/// A field type is either a type string or `{"type": "...", "merge": "append"}`.
fn convert_field(name: String, declared: &Value) -> Result<StateFieldDefinition, CompileError> {
    let descriptor = match declared {
        Value::String(text) => TypeDescriptor::parse(text),
        Value::Object(spec) => {
            let mut descriptor = spec
                .get("type")
                .and_then(Value::as_str)
                .map(TypeDescriptor::parse)
                .ok_or_else(|| CompileError::MalformedElement {
                    element: format!("state field '{}'", name),
                    message: "object form requires a string 'type'".to_string(),
                })?;
            if let Some(merge) = spec.get("merge") {
                descriptor.merge_policy = serde_json::from_value::<MergePolicy>(merge.clone())
                    .map_err(|e| CompileError::MalformedElement {
                        element: format!("state field '{}'", name),
                        message: e.to_string(),
                    })?;
            }
            descriptor
        }
        other => {
            return Err(CompileError::MalformedElement {
                element: format!("state field '{}'", name),
                message: format!("unsupported type declaration {}", other),
            });
        }
    };
    Ok(StateFieldDefinition { name, descriptor })
}

fn convert_tools(tools: UiTools) -> Result<Vec<ToolDefinition>, CompileError> {
    let entries: Vec<(String, UiTool)> = match tools {
        UiTools::Map(map) => map.into_iter().collect(),
        UiTools::List(list) => list
            .into_iter()
            .map(|tool| {
                let name = tool.name.clone().ok_or_else(|| CompileError::MalformedElement {
                    element: "tool".to_string(),
                    message: "tool entries given as a list need a 'name'".to_string(),
                })?;
                Ok((name, tool))
            })
            .collect::<Result<_, CompileError>>()?,
    };

    let mut definitions: Vec<ToolDefinition> = Vec::with_capacity(entries.len());
    for (name, tool) in entries {
        if definitions.iter().any(|d| d.name == name) {
            return Err(CompileError::MalformedElement {
                element: format!("tool '{}'", name),
                message: "tool names must be unique".to_string(),
            });
        }
        definitions.push(tool.into_definition(&name));
    }
    Ok(definitions)
}

impl UiTool {
    /// Converts a raw tool entry into a canonical definition.
    pub fn into_definition(self, name: &str) -> ToolDefinition {
        let is_remote = match self.tool_type.as_deref() {
            Some("mcp") | Some("remote") => true,
            Some(_) => false,
            None => self.mcp_server.is_some() || self.mcp_method.is_some(),
        };

        let remote = is_remote.then(|| {
            let address = self.mcp_server.clone().unwrap_or_default();
            match (&self.mcp_method, &self.method, &self.endpoint) {
                (Some(line), _, _) => RemoteEndpoint::from_method_line(&address, line),
                (None, method, endpoint) => RemoteEndpoint {
                    address: address.trim_end_matches('/').to_string(),
                    method: method.as_deref().unwrap_or("GET").to_ascii_uppercase(),
                    path: endpoint
                        .clone()
                        .unwrap_or_else(|| format!("/mcp/{}", name)),
                },
            }
        });

        ToolDefinition {
            name: name.to_string(),
            kind: if is_remote {
                ToolKind::Remote
            } else {
                ToolKind::Inline
            },
            description: self.description,
            arguments: self
                .arguments
                .into_iter()
                .map(|a| ToolArgument {
                    name: a.name,
                    arg_type: a.arg_type,
                    required: a.required,
                    description: a.description,
                })
                .collect(),
            return_schema: self
                .return_schema
                .unwrap_or_else(ToolDefinition::default_return_schema),
            remote,
            inline_body: self.implementation.filter(|body| !body.trim().is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wrapper_and_bare_documents_parse() {
        let bare = json!({"entrypoint": "a", "nodes": [{"id": "a", "type": "EntryPoint"}]});
        let wrapped = json!({"graph": bare.clone()});
        assert!(UiDocument::from_value(bare).is_ok());
        assert!(UiDocument::from_value(wrapped).is_ok());
    }

    #[test]
    fn test_missing_keys_are_structure_errors() {
        let no_entry = json!({"graph": {"nodes": [{"id": "a", "type": "EntryPoint"}]}});
        assert_eq!(
            UiDocument::from_value(no_entry).unwrap_err(),
            CompileError::MissingKey {
                key: "entrypoint".to_string()
            }
        );
        let no_nodes = json!({"entrypoint": "a"});
        assert_eq!(
            UiDocument::from_value(no_nodes).unwrap_err(),
            CompileError::MissingKey {
                key: "nodes".to_string()
            }
        );
        let empty = json!({"entrypoint": "a", "nodes": []});
        assert_eq!(
            UiDocument::from_value(empty).unwrap_err(),
            CompileError::EmptyNodeList
        );
    }

    #[test]
    fn test_remote_tool_method_line_is_split() {
        let tool: UiTool = serde_json::from_value(json!({
            "type": "mcp",
            "description": "List functions",
            "mcp_server": "http://localhost:8000/",
            "mcp_method": "POST /mcp/list_functions"
        }))
        .expect("tool");
        let definition = tool.into_definition("list_functions");
        let remote = definition.remote.expect("remote endpoint");
        assert_eq!(remote.address, "http://localhost:8000");
        assert_eq!(remote.method, "POST");
        assert_eq!(remote.path, "/mcp/list_functions");
        assert_eq!(definition.return_schema, json!({"success": "bool"}));
    }
}
