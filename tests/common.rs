//! Common test utilities for building workflow graphs and scripted decision procedures.
use kairo::prelude::*;
use kairo::program::{Capability, OutputSchema};
use kairo::runtime::{CapabilityRequest, ProcedureCall, RouteChoice, RouteOption};
use kairo::workflow::{EdgeDefinition, NodeDefinition, ToolArgument, ToolDefinition, ToolKind};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, VecDeque};

/// `EntryPoint -> Decision` with no tools and no schema.
#[allow(dead_code)]
pub fn create_minimal_graph() -> WorkflowGraph {
    WorkflowGraph {
        entrypoint: "start".to_string(),
        nodes: vec![
            NodeDefinition::new("start", "EntryPoint", "Start"),
            NodeDefinition::new("d1", "LLMNode", "Writer")
                .with_config("system_prompt", json!("You write short answers."))
                .with_config("human_prompt", json!("Answer the question.")),
        ],
        edges: vec![EdgeDefinition::direct("start", "d1")],
        ..Default::default()
    }
}

/// An inline tool with a body and a single `query` argument.
#[allow(dead_code)]
pub fn inline_tool(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        kind: ToolKind::Inline,
        description: format!("The {} tool", name),
        arguments: vec![ToolArgument {
            name: "query".to_string(),
            arg_type: "str".to_string(),
            required: true,
            description: "What to look for".to_string(),
        }],
        return_schema: ToolDefinition::default_return_schema(),
        remote: None,
        inline_body: Some("return {\"hits\": []}".to_string()),
    }
}

/// `start -> agent -> check`, with `check --true--> tools` and no false branch.
///
/// `agent` selects the `search` tool, caps its loop at `max_iterations` and declares a
/// two-field output schema (`summary`, `confidence`).
#[allow(dead_code)]
pub fn create_tool_loop_graph(max_iterations: u32) -> WorkflowGraph {
    WorkflowGraph {
        entrypoint: "start".to_string(),
        nodes: vec![
            NodeDefinition::new("start", "EntryPoint", "Start"),
            NodeDefinition::new("agent", "LLMNode", "Researcher")
                .with_config("system_prompt", json!("You research {topic}."))
                .with_config("human_prompt", json!("Find sources."))
                .with_config("selected_tools", json!(["search"]))
                .with_config("max_tool_iterations", json!(max_iterations))
                .with_config(
                    "structured_output_schema",
                    json!([
                        {"name": "summary", "type": "str", "description": "Short summary"},
                        {"name": "confidence", "type": "float", "description": "0 to 1"}
                    ]),
                ),
            NodeDefinition::new("check", "ConditionalBlock", "Has tools?")
                .with_config("condition", json!("tool_detection")),
            NodeDefinition::new("tools", "ToolNode", "Tools"),
        ],
        edges: vec![
            EdgeDefinition::direct("start", "agent"),
            EdgeDefinition::direct("agent", "check"),
            EdgeDefinition::branch("check", "tools", "true"),
        ],
        tools: vec![inline_tool("search")],
        ..Default::default()
    }
}

/// `start -> triage` where the router picks `billing` or `support`.
#[allow(dead_code)]
pub fn create_router_graph() -> WorkflowGraph {
    WorkflowGraph {
        entrypoint: "start".to_string(),
        nodes: vec![
            NodeDefinition::new("start", "EntryPoint", "Start"),
            NodeDefinition::new("triage", "RouterBlock", "Triage")
                .with_config("system_prompt", json!("Route the request."))
                .with_config(
                    "choices",
                    json!({"billing": "billing_agent", "support": "support_agent"}),
                ),
            NodeDefinition::new("billing_agent", "LLMNode", "Billing"),
            NodeDefinition::new("support_agent", "LLMNode", "Support"),
        ],
        edges: vec![
            EdgeDefinition::direct("start", "triage"),
            EdgeDefinition::direct("triage", "billing_agent"),
            EdgeDefinition::direct("triage", "support_agent"),
        ],
        ..Default::default()
    }
}

/// `start -> boss`, with `boss -> helper` binding a worker as a capability.
#[allow(dead_code)]
pub fn create_worker_graph() -> WorkflowGraph {
    WorkflowGraph {
        entrypoint: "start".to_string(),
        nodes: vec![
            NodeDefinition::new("start", "EntryPoint", "Start"),
            NodeDefinition::new("boss", "LLMNode", "Boss")
                .with_config("human_prompt", json!("Delegate the summary.")),
            NodeDefinition::new("helper", "WorkerNode", "Helper")
                .with_config("system_prompt", json!("You summarize.")),
        ],
        edges: vec![
            EdgeDefinition::direct("start", "boss"),
            EdgeDefinition::direct("boss", "helper"),
        ],
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn compile_graph(graph: WorkflowGraph) -> Program {
    Compiler::builder(graph)
        .build()
        .compile()
        .expect("graph should compile")
}

/// A workflow document as the visual editor writes it.
#[allow(dead_code)]
pub const RESEARCH_DOCUMENT_JSON: &str = r#"{
    "graph": {
        "entrypoint": "start",
        "nodes": [
            {"id": "start", "type": "EntryPoint", "label": "Start",
             "config": {"initial_state": {"topic": "rust"}}},
            {"id": "researcher", "type": "LLMNode", "label": "Researcher",
             "config": {
                "system_prompt": "You research {topic}.",
                "human_prompt": "Collect three sources.",
                "selected_tools": ["web_search", "notes"],
                "max_tool_iterations": 5,
                "output_key": "report"
             }},
            {"id": "has_tools", "type": "ConditionalBlock", "label": "Has tools",
             "config": {"condition": "tool_detection"}},
            {"id": "run_tools", "type": "ToolNode", "label": "Run tools", "config": {}}
        ],
        "edges": [
            {"from": "start", "to": "researcher", "type": "NormalEdge"},
            {"from": "researcher", "to": "has_tools", "type": "NormalEdge"},
            {"from": "has_tools", "to": "run_tools", "type": "ConditionalEdge", "condition": "true"}
        ],
        "state": {"schema": {"topic": "str", "report": "Optional[str]"}},
        "tools": {
            "web_search": {
                "type": "mcp",
                "description": "Search the web",
                "mcp_server": "http://localhost:8000/",
                "mcp_method": "GET /mcp/search",
                "arguments": [{"name": "query", "type": "str"}]
            },
            "notes": {"type": "custom", "description": "Scratch notes"}
        }
    }
}"#;

/// One recorded call to the scripted procedure.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub instance: String,
    pub node_id: String,
    pub messages: Vec<Message>,
    pub capabilities: Vec<String>,
}

/// A decision procedure that replays per-node scripts.
///
/// When a node's script runs dry it answers `"done"`, or, with `always_request` set,
/// keeps requesting that capability forever.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct ScriptedProcedure {
    pub scripts: BTreeMap<String, VecDeque<Message>>,
    pub always_request: Option<String>,
    pub structured: Map<String, Value>,
    pub route: Option<RouteChoice>,
    pub calls: Vec<RecordedCall>,
    pub decodes: usize,
    next_request: usize,
}

#[allow(dead_code)]
impl ScriptedProcedure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, node_id: &str, messages: Vec<Message>) -> Self {
        self.scripts
            .insert(node_id.to_string(), messages.into_iter().collect());
        self
    }

    pub fn always_requesting(mut self, capability: &str) -> Self {
        self.always_request = Some(capability.to_string());
        self
    }

    pub fn with_structured(mut self, fields: Value) -> Self {
        if let Value::Object(map) = fields {
            self.structured = map;
        }
        self
    }

    pub fn routing_to(mut self, choice: RouteChoice) -> Self {
        self.route = Some(choice);
        self
    }

    pub fn calls_for(&self, node_id: &str) -> Vec<&RecordedCall> {
        self.calls.iter().filter(|c| c.node_id == node_id).collect()
    }

    fn record(&mut self, call: &ProcedureCall) {
        self.calls.push(RecordedCall {
            instance: call.instance.to_string(),
            node_id: call.node_id.to_string(),
            messages: call.messages.to_vec(),
            capabilities: call.capabilities.iter().map(|c| c.symbol.clone()).collect(),
        });
    }
}

impl DecisionProcedure for ScriptedProcedure {
    fn invoke(&mut self, call: &ProcedureCall) -> std::result::Result<Message, String> {
        self.record(call);
        if let Some(next) = self
            .scripts
            .get_mut(call.node_id)
            .and_then(VecDeque::pop_front)
        {
            return Ok(next);
        }
        match &self.always_request {
            Some(capability) => {
                self.next_request += 1;
                Ok(Message::requesting(
                    "",
                    vec![CapabilityRequest::new(
                        &format!("call_{}", self.next_request),
                        capability,
                        json!({"query": "more"}),
                    )],
                ))
            }
            None => Ok(Message::answer("done")),
        }
    }

    fn decode_structured(
        &mut self,
        _call: &ProcedureCall,
        _schema: &OutputSchema,
    ) -> std::result::Result<Map<String, Value>, String> {
        self.decodes += 1;
        Ok(self.structured.clone())
    }

    fn choose(&mut self, call: &ProcedureCall, options: &[RouteOption]) -> std::result::Result<RouteChoice, String> {
        self.record(call);
        match &self.route {
            Some(choice) => Ok(choice.clone()),
            None => options
                .first()
                .map(|o| RouteChoice::new(&o.label))
                .ok_or_else(|| "no options offered".to_string()),
        }
    }
}

/// Answers every capability call with a fixed payload and remembers what was invoked.
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct RecordingInvoker {
    pub invoked: Vec<(String, Value)>,
}

impl CapabilityInvoker for RecordingInvoker {
    fn invoke(&mut self, capability: &Capability, arguments: &Value) -> std::result::Result<Value, String> {
        self.invoked.push((capability.name.clone(), arguments.clone()));
        Ok(json!({"hits": 2}))
    }
}

/// Counts the `Human` turns carrying `text` in a stored conversation log.
#[allow(dead_code)]
pub fn count_human_turns(log: Option<&Value>, text: &str) -> usize {
    kairo::runtime::message::messages_from(log)
        .iter()
        .filter(|m| matches!(m, Message::Human { content } if content == text))
        .count()
}
