use super::message::Message;
use crate::program::{Capability, OutputSchema};
use serde_json::{Map, Value};

/// Everything a decision procedure sees for one call.
#[derive(Debug, Clone, Copy)]
pub struct ProcedureCall<'a> {
    /// Symbol of the procedure instance being invoked.
    pub instance: &'a str,
    pub node_id: &'a str,
    pub messages: &'a [Message],
    /// Capabilities the procedure may request. Empty means no binding for this call.
    pub capabilities: &'a [&'a Capability],
}

/// One enumerated router option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOption {
    pub label: String,
    pub description: Option<String>,
}

/// A router's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteChoice {
    pub label: String,
    pub reason: Option<String>,
}

impl RouteChoice {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            reason: None,
        }
    }

    pub fn because(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// The external reasoning/generation procedure behind decision, router and worker nodes.
///
/// Errors are plain messages; the runtime attributes them to the calling instance.
pub trait DecisionProcedure {
    /// Free-form decode. May return capability requests when `call.capabilities` is non-empty.
    fn invoke(&mut self, call: &ProcedureCall) -> Result<Message, String>;

    /// Schema-constrained decode over the accumulated context.
    fn decode_structured(
        &mut self,
        call: &ProcedureCall,
        schema: &OutputSchema,
    ) -> Result<Map<String, Value>, String>;

    /// Constrained decode whose only valid answers are the option labels.
    fn choose(&mut self, call: &ProcedureCall, options: &[RouteOption]) -> Result<RouteChoice, String>;
}

/// Executes remote and inline capabilities. Worker and placeholder capabilities never
/// reach the invoker; the runtime answers them itself.
pub trait CapabilityInvoker {
    fn invoke(&mut self, capability: &Capability, arguments: &Value) -> Result<Value, String>;
}

/// Refuses every call, so each request is recorded as a per-call error.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineInvoker;

impl CapabilityInvoker for OfflineInvoker {
    fn invoke(&mut self, capability: &Capability, _arguments: &Value) -> Result<Value, String> {
        Err(format!(
            "capability '{}' cannot be reached without an invoker",
            capability.name
        ))
    }
}
