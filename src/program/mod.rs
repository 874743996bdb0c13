//! The compiled program: a typed, sectioned representation of the generated state machine.
//!
//! A `Program` is what the assembler produces. Its `Display` implementation is the
//! program text; the `runtime` module executes it directly.
use crate::condition::Expression;
use crate::workflow::{IterationPolicy, OutputField, TypeDescriptor};
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod json_text;
mod render;

pub use render::render_symbol_table;

/// Turn appended to both logs when a tool routine is entered at its cap.
pub const LIMIT_REACHED_NOTICE: &str =
    "Tool iteration limit reached. Please provide a final response without using more tools.";

/// Turn that precedes every schema-constrained decode.
pub const STRUCTURED_OUTPUT_PROMPT: &str =
    "Please format your previous response according to the required output schema.";

/// Name of the state record in the rendered program.
pub const STATE_RECORD_NAME: &str = "WorkflowState";

/// Where a routine hands control next.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    Routine(String),
    Terminal,
}

impl Target {
    pub fn routine(symbol: &str) -> Self {
        Target::Routine(symbol.to_string())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Target::Terminal)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Routine(symbol) => write!(f, "{}", symbol),
            Target::Terminal => write!(f, "TERMINAL"),
        }
    }
}

/// Why a state field exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOrigin {
    Declared,
    Mandatory,
    NodeScoped(String),
    Output(String),
    Routing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateField {
    pub name: String,
    pub descriptor: TypeDescriptor,
    pub origin: FieldOrigin,
}

/// The shared-state record every routine reads and updates.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateSchema {
    pub fields: Vec<StateField>,
}

impl StateSchema {
    pub fn field(&self, name: &str) -> Option<&StateField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Names of the namespaced bookkeeping fields of one decision node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFields {
    pub messages: String,
    pub calls: String,
    pub iterations: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    pub symbol: String,
    pub node_id: String,
    pub fields: Vec<OutputField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityArgument {
    pub name: String,
    pub arg_type: String,
    pub required: bool,
    pub description: String,
}

/// A worker node compiled into a callable capability with its own bounded loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerBody {
    pub node_id: String,
    pub procedure: String,
    pub system_prompt: Option<String>,
    pub group: Option<String>,
    pub policy: IterationPolicy,
    pub output_schema: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CapabilityBody {
    Remote {
        address: String,
        method: String,
        path: String,
    },
    Inline {
        source: String,
    },
    /// An inline tool declared without a body; it always answers with an error payload.
    Placeholder,
    Worker(WorkerBody),
}

/// A capability a decision procedure may request by `symbol`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub symbol: String,
    pub name: String,
    pub description: String,
    pub arguments: Vec<CapabilityArgument>,
    #[serde(with = "json_text")]
    pub returns: serde_json::Value,
    pub body: CapabilityBody,
}

/// The ordered set of capabilities bound to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityGroup {
    pub symbol: String,
    pub owner: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcedureRole {
    Decision,
    Router,
    Worker,
}

impl fmt::Display for ProcedureRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcedureRole::Decision => write!(f, "decision"),
            ProcedureRole::Router => write!(f, "router"),
            ProcedureRole::Worker => write!(f, "worker"),
        }
    }
}

/// One decision-procedure instance, optionally bound to a capability group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcedureInstance {
    pub symbol: String,
    pub node_id: String,
    pub role: ProcedureRole,
    pub group: Option<String>,
}

/// System/user prompt templates of a node; `{field}` placeholders expand against state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromptSpec {
    pub system: Option<String>,
    pub user: Option<String>,
    pub input_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialValue {
    pub field: String,
    #[serde(with = "json_text")]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRoutine {
    pub initial_values: Vec<InitialValue>,
    pub next: Target,
}

/// The tool round-trip wiring of a tool-bound decision node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolLoop {
    pub routine: String,
    pub group: String,
    pub policy: IterationPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRoutine {
    pub procedure: String,
    pub prompt: PromptSpec,
    pub fields: NodeFields,
    pub tool_loop: Option<ToolLoop>,
    pub output_schema: Option<String>,
    pub output_key: Option<String>,
    pub next: Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecRoutine {
    pub owner: String,
    pub owner_node: String,
    pub group: String,
    pub fields: NodeFields,
    pub policy: IterationPolicy,
    pub synthesized: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub label: String,
    pub description: Option<String>,
    pub node_id: String,
    pub target: Target,
}

/// What a router does when its procedure answers outside the enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RouterFallback {
    #[default]
    Fail,
    FirstOption,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterRoutine {
    pub procedure: String,
    pub prompt: PromptSpec,
    pub routes: Vec<RouteEntry>,
    pub fallback: RouterFallback,
    pub reason_field: String,
}

impl RouterRoutine {
    pub fn labels(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.label.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionMode {
    /// Branches on whether the owner's latest decision requested capabilities.
    ToolDetection {
        owner_node: String,
        owner_fields: NodeFields,
        policy: Option<IterationPolicy>,
    },
    /// Branches on a boolean expression over shared state. `None` when the source did not parse.
    Expression {
        source: String,
        expression: Option<Expression>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRoutine {
    pub mode: ConditionMode,
    pub on_true: Target,
    pub on_false: Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoutineBody {
    Entry(EntryRoutine),
    Decision(DecisionRoutine),
    ToolExec(ToolExecRoutine),
    Router(RouterRoutine),
    Conditional(ConditionalRoutine),
}

impl RoutineBody {
    pub fn kind_name(&self) -> &'static str {
        match self {
            RoutineBody::Entry(_) => "entry",
            RoutineBody::Decision(_) => "decision",
            RoutineBody::ToolExec(_) => "tool-exec",
            RoutineBody::Router(_) => "router",
            RoutineBody::Conditional(_) => "conditional",
        }
    }
}

/// One generated routine: receives shared state, returns updates plus the next target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routine {
    pub symbol: String,
    pub node_id: String,
    pub label: String,
    pub body: RoutineBody,
}

/// The whole compiled program, in assembly order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub state: StateSchema,
    pub output_schemas: Vec<OutputSchema>,
    pub capabilities: Vec<Capability>,
    pub groups: Vec<CapabilityGroup>,
    pub procedures: Vec<ProcedureInstance>,
    pub routines: Vec<Routine>,
    pub entry: String,
}

impl Program {
    pub fn routine(&self, symbol: &str) -> Option<&Routine> {
        self.routines.iter().find(|r| r.symbol == symbol)
    }

    /// The routine generated for a graph node (synthesized routines have no node of their own).
    pub fn routine_for_node(&self, node_id: &str) -> Option<&Routine> {
        self.routines.iter().find(|r| {
            r.node_id == node_id
                && !matches!(&r.body, RoutineBody::ToolExec(t) if t.synthesized)
        })
    }

    pub fn capability(&self, symbol: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.symbol == symbol)
    }

    pub fn group(&self, symbol: &str) -> Option<&CapabilityGroup> {
        self.groups.iter().find(|g| g.symbol == symbol)
    }

    pub fn procedure(&self, symbol: &str) -> Option<&ProcedureInstance> {
        self.procedures.iter().find(|p| p.symbol == symbol)
    }

    pub fn output_schema(&self, symbol: &str) -> Option<&OutputSchema> {
        self.output_schemas.iter().find(|s| s.symbol == symbol)
    }

    /// Capabilities of a group, in binding order.
    pub fn group_capabilities(&self, group: &str) -> Vec<&Capability> {
        self.group(group)
            .map(|g| {
                g.capabilities
                    .iter()
                    .filter_map(|symbol| self.capability(symbol))
                    .collect()
            })
            .unwrap_or_default()
    }
}
