use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A node as written by the visual editor.
#[derive(Debug, Deserialize, Clone)]
pub struct UiNode {
    pub id: String,
    #[serde(rename = "type", alias = "nodeType")]
    pub node_type: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// An edge as written by the visual editor.
#[derive(Debug, Deserialize, Clone)]
pub struct UiEdge {
    #[serde(alias = "source")]
    pub from: String,
    #[serde(alias = "target")]
    pub to: String,
    #[serde(rename = "type", default)]
    pub edge_type: Option<String>,
    #[serde(default, alias = "label")]
    pub condition: Option<Value>,
    #[serde(default)]
    pub implicit: bool,
}

/// One argument of a tool signature.
#[derive(Debug, Deserialize, Clone)]
pub struct UiToolArgument {
    pub name: String,
    #[serde(rename = "type", default = "default_argument_type")]
    pub arg_type: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

fn default_argument_type() -> String {
    "Any".to_string()
}

fn default_required() -> bool {
    true
}

/// A tool entry; `mcp` tools carry a server and method, `custom` tools an implementation.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct UiTool {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub tool_type: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub arguments: Vec<UiToolArgument>,
    #[serde(default)]
    pub return_schema: Option<Value>,
    #[serde(default)]
    pub implementation: Option<String>,
    #[serde(default, alias = "server")]
    pub mcp_server: Option<String>,
    #[serde(default)]
    pub mcp_method: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Tools may be given as a name-keyed object or as a list of named entries.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum UiTools {
    Map(BTreeMap<String, UiTool>),
    List(Vec<UiTool>),
}

impl Default for UiTools {
    fn default() -> Self {
        UiTools::Map(BTreeMap::new())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct UiState {
    #[serde(default)]
    pub schema: Map<String, Value>,
}

/// The complete graph document.
#[derive(Debug, Deserialize, Clone)]
pub struct UiDocument {
    pub entrypoint: String,
    pub nodes: Vec<UiNode>,
    #[serde(default)]
    pub edges: Vec<UiEdge>,
    #[serde(default)]
    pub state: Option<UiState>,
    #[serde(default)]
    pub tools: UiTools,
}
