use crate::error::CompileError;
use crate::workflow::{BaseType, NodeDefinition, OutputField};
use ahash::AHashMap;
use serde_json::Value;

/// The canonical node kinds the compiler knows how to generate routines for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    EntryPoint,
    Decision,
    Router,
    Worker,
    ToolExec,
    Conditional,
}

/// Configuration shared by decision and worker nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentConfig {
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
    pub selected_tools: Vec<String>,
    pub max_iterations: Option<u32>,
    pub warning_message: Option<String>,
    pub output_fields: Vec<OutputField>,
    pub input_keys: Vec<String>,
    pub output_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteChoice {
    pub label: String,
    pub destination: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouterConfig {
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
    pub input_keys: Vec<String>,
    pub choices: Vec<RouteChoice>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConditionSpec {
    ToolDetection,
    Expression(String),
}

/// Typed configuration of a node, produced by its type parser.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    Entry { initial_state: Vec<(String, Value)> },
    Decision(AgentConfig),
    Worker(AgentConfig),
    Router(RouterConfig),
    ToolExec,
    Conditional(ConditionSpec),
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeConfig::Entry { .. } => NodeKind::EntryPoint,
            NodeConfig::Decision(_) => NodeKind::Decision,
            NodeConfig::Worker(_) => NodeKind::Worker,
            NodeConfig::Router(_) => NodeKind::Router,
            NodeConfig::ToolExec => NodeKind::ToolExec,
            NodeConfig::Conditional(_) => NodeKind::Conditional,
        }
    }
}

/// Defines the contract for turning a document node type into typed node configuration.
pub trait NodeParser: Send + Sync {
    fn node_type(&self) -> &str;
    fn parse(&self, node: &NodeDefinition) -> Result<NodeConfig, CompileError>;
}

fn malformed(node: &NodeDefinition, message: String) -> CompileError {
    CompileError::MalformedElement {
        element: format!("config of node '{}'", node.id),
        message,
    }
}

fn string_list(node: &NodeDefinition, key: &str) -> Result<Vec<String>, CompileError> {
    match node.config.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                Value::Object(obj) => obj
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| malformed(node, format!("entries of '{}' need a 'name'", key))),
                other => Err(malformed(node, format!("unexpected entry {} in '{}'", other, key))),
            })
            .collect(),
        Some(Value::String(s)) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        Some(other) => Err(malformed(node, format!("'{}' must be a list, found {}", key, other))),
    }
}

fn output_fields(node: &NodeDefinition) -> Result<Vec<OutputField>, CompileError> {
    if node
        .config
        .get("structured_output_enabled")
        .and_then(Value::as_bool)
        == Some(false)
    {
        return Ok(Vec::new());
    }
    let Some(Value::Array(entries)) = node.config.get("structured_output_schema") else {
        return Ok(Vec::new());
    };
    let mut fields: Vec<OutputField> = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| malformed(node, "output schema fields need a 'name'".to_string()))?;
        if fields.iter().any(|f| f.name == name) {
            return Err(malformed(node, format!("output field '{}' is declared twice", name)));
        }
        fields.push(OutputField {
            name: name.to_string(),
            base_type: BaseType::parse(entry.get("type").and_then(Value::as_str).unwrap_or("str")),
            description: entry
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }
    Ok(fields)
}

fn parse_agent(node: &NodeDefinition) -> Result<AgentConfig, CompileError> {
    let max_iterations = match node.config.get("max_tool_iterations") {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_u64() {
            Some(n) if n > 0 && n <= u64::from(u32::MAX) => Some(n as u32),
            _ => {
                return Err(malformed(
                    node,
                    format!("'max_tool_iterations' must be a positive integer, found {}", value),
                ));
            }
        },
    };
    Ok(AgentConfig {
        system_prompt: node.config_str(&["system_prompt"]).map(str::to_string),
        user_prompt: node
            .config_str(&["human_prompt", "user_prompt", "prompt"])
            .map(str::to_string),
        selected_tools: string_list(node, "selected_tools")?,
        max_iterations,
        warning_message: node
            .config_str(&["iteration_warning_message"])
            .map(str::to_string),
        output_fields: output_fields(node)?,
        input_keys: string_list(node, "input_state_keys")?,
        output_key: node.config_str(&["output_key"]).map(str::to_string),
    })
}

fn parse_entry(node: &NodeDefinition) -> Result<NodeConfig, CompileError> {
    let initial_state = match node.config.get("initial_state") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Some(other) => {
            return Err(malformed(
                node,
                format!("'initial_state' must be an object, found {}", other),
            ));
        }
    };
    Ok(NodeConfig::Entry { initial_state })
}

fn parse_decision(node: &NodeDefinition) -> Result<NodeConfig, CompileError> {
    parse_agent(node).map(NodeConfig::Decision)
}

fn parse_worker(node: &NodeDefinition) -> Result<NodeConfig, CompileError> {
    parse_agent(node).map(NodeConfig::Worker)
}

fn parse_router(node: &NodeDefinition) -> Result<NodeConfig, CompileError> {
    let mut choices = Vec::new();
    match node.config.get("choices") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (label, destination) in map {
                let destination = destination.as_str().ok_or_else(|| {
                    malformed(node, format!("choice '{}' must map to a node id or label", label))
                })?;
                choices.push(RouteChoice {
                    label: label.clone(),
                    destination: destination.to_string(),
                    description: None,
                });
            }
        }
        Some(other) => {
            return Err(malformed(node, format!("'choices' must be an object, found {}", other)));
        }
    }
    if let Some(Value::Array(values)) = node.config.get("router_values") {
        for value in values {
            let destination = value
                .get("node")
                .and_then(Value::as_str)
                .ok_or_else(|| malformed(node, "router values need a 'node'".to_string()))?;
            let label = value
                .get("label")
                .and_then(Value::as_str)
                .unwrap_or(destination);
            let description = value
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string);
            match choices.iter_mut().find(|c: &&mut RouteChoice| c.label == label) {
                Some(existing) => existing.description = description,
                None => choices.push(RouteChoice {
                    label: label.to_string(),
                    destination: destination.to_string(),
                    description,
                }),
            }
        }
    }
    Ok(NodeConfig::Router(RouterConfig {
        system_prompt: node.config_str(&["system_prompt"]).map(str::to_string),
        user_prompt: node
            .config_str(&["human_prompt", "user_prompt", "prompt"])
            .map(str::to_string),
        input_keys: string_list(node, "input_state_keys")?,
        choices,
    }))
}

fn parse_tool_exec(_node: &NodeDefinition) -> Result<NodeConfig, CompileError> {
    Ok(NodeConfig::ToolExec)
}

fn parse_conditional(node: &NodeDefinition) -> Result<NodeConfig, CompileError> {
    let spec = match node.config_str(&["condition", "expression"]) {
        None => ConditionSpec::ToolDetection,
        Some(text) => match text.trim() {
            "tool_detection" | "tool_calls" | "has_tool_calls" => ConditionSpec::ToolDetection,
            expression => ConditionSpec::Expression(expression.to_string()),
        },
    };
    Ok(NodeConfig::Conditional(spec))
}

/// Master macro to define all standard node parsers, their registration, and their creation.
macro_rules! define_node_parsers {
    ( $( ($struct_name:ident, $node_type:expr, $parse_fn:path) ),* $(,)? ) => {
        $(
            struct $struct_name;
            impl NodeParser for $struct_name {
                fn node_type(&self) -> &str { $node_type }
                fn parse(&self, node: &NodeDefinition) -> Result<NodeConfig, CompileError> {
                    $parse_fn(node)
                }
            }
        )*

        pub(super) fn register_default_parsers(registry: &mut AHashMap<String, Box<dyn NodeParser>>) {
            $( registry.insert($node_type.to_string(), Box::new($struct_name)); )*
        }

        pub(super) fn create_parser_by_name(name: &str) -> Option<Box<dyn NodeParser>> {
            match name {
                $( $node_type => Some(Box::new($struct_name)), )*
                _ => None,
            }
        }
    };
}

// Canonical names first, then the names the visual editor writes.
define_node_parsers! {
    (EntryPointParser, "EntryPoint", parse_entry),
    (DecisionParser, "Decision", parse_decision),
    (RouterParser, "Router", parse_router),
    (WorkerParser, "Worker", parse_worker),
    (ToolExecParser, "ToolExec", parse_tool_exec),
    (ConditionalParser, "Conditional", parse_conditional),
    (LlmNodeParser, "LLMNode", parse_decision),
    (RouterBlockParser, "RouterBlock", parse_router),
    (WorkerNodeParser, "WorkerNode", parse_worker),
    (ToolNodeParser, "ToolNode", parse_tool_exec),
    (ConditionalBlockParser, "ConditionalBlock", parse_conditional),
}
