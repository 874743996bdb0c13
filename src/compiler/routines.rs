use super::CompilerOptions;
use super::binding::Bindings;
use super::builder::{GraphModel, ModelNode};
use super::edges::ControlFlow;
use super::parsing::{AgentConfig, ConditionSpec, NodeConfig, NodeKind};
use super::routing::RoutingTables;
use super::schema::{DerivedState, ROUTING_REASON_FIELD};
use super::symbols::SymbolTable;
use crate::condition::parse_expression;
use crate::error::CompileError;
use crate::program::{
    ConditionMode, ConditionalRoutine, DecisionRoutine, EntryRoutine, InitialValue, NodeFields,
    PromptSpec, RouteEntry, RouterRoutine, Routine, RoutineBody, Target, ToolExecRoutine,
    ToolLoop,
};
use crate::workflow::IterationPolicy;
use tracing::{debug, warn};

/// Everything a routine generator may look at. All of it is final by the time routines are built.
pub(crate) struct GenerationContext<'m, 'a> {
    pub model: &'m GraphModel<'a>,
    pub flow: &'m ControlFlow,
    pub bindings: &'m Bindings,
    pub symbols: &'m SymbolTable,
    pub routing: &'m RoutingTables,
    pub state: &'m DerivedState,
    pub options: &'m CompilerOptions,
}

impl GenerationContext<'_, '_> {
    /// The routine that runs when control reaches `node_id`; `None` is the terminal state.
    pub(crate) fn target(&self, node_id: Option<&str>) -> Result<Target, CompileError> {
        let Some(node_id) = node_id else {
            return Ok(Target::Terminal);
        };
        self.symbols
            .routine(node_id)
            .map(Target::routine)
            .ok_or_else(|| CompileError::Generation {
                fragment: format!("transition to '{}'", node_id),
                message: "the destination has no routine".to_string(),
            })
    }

    /// The iteration policy of a tool-bound node, with compiler defaults filled in.
    pub(crate) fn policy(&self, node: &ModelNode) -> Option<IterationPolicy> {
        if !self.bindings.tool_bound.contains(&node.id) {
            return None;
        }
        let agent = node.agent();
        Some(IterationPolicy {
            max_iterations: agent
                .and_then(|a| a.max_iterations)
                .unwrap_or(self.options.default_max_iterations),
            warning_message: agent
                .and_then(|a| a.warning_message.clone())
                .unwrap_or_else(|| self.options.iteration_warning.clone()),
        })
    }

    pub(crate) fn node_fields(&self, node_id: &str) -> Result<&NodeFields, CompileError> {
        self.state
            .node_fields
            .get(node_id)
            .ok_or_else(|| CompileError::Generation {
                fragment: format!("bookkeeping fields of '{}'", node_id),
                message: "node has no scoped state fields".to_string(),
            })
    }

    fn symbol_of<'s>(
        &self,
        found: Option<&'s str>,
        what: &str,
        node_id: &str,
    ) -> Result<&'s str, CompileError> {
        found.ok_or_else(|| CompileError::Generation {
            fragment: format!("{} of '{}'", what, node_id),
            message: "no symbol was allocated".to_string(),
        })
    }
}

pub(crate) fn prompt_of(agent: &AgentConfig) -> PromptSpec {
    PromptSpec {
        system: agent.system_prompt.clone(),
        user: agent.user_prompt.clone(),
        input_keys: agent.input_keys.clone(),
    }
}

/// Emits the routines implementing one node type's run-time protocol.
pub(crate) trait RoutineGenerator {
    fn generate(
        &self,
        node: &ModelNode,
        ctx: &GenerationContext,
    ) -> Result<Vec<Routine>, CompileError>;
}

struct EntryGenerator;
struct DecisionGenerator;
struct ToolExecGenerator;
struct RouterGenerator;
struct ConditionalGenerator;

/// Workers have no generator: they compile to capabilities, not routines.
pub(crate) fn generator_for(kind: NodeKind) -> Option<&'static dyn RoutineGenerator> {
    match kind {
        NodeKind::EntryPoint => Some(&EntryGenerator),
        NodeKind::Decision => Some(&DecisionGenerator),
        NodeKind::ToolExec => Some(&ToolExecGenerator),
        NodeKind::Router => Some(&RouterGenerator),
        NodeKind::Conditional => Some(&ConditionalGenerator),
        NodeKind::Worker => None,
    }
}

fn routine(node: &ModelNode, symbol: &str, body: RoutineBody) -> Routine {
    Routine {
        symbol: symbol.to_string(),
        node_id: node.id.clone(),
        label: node.label.clone(),
        body,
    }
}

impl RoutineGenerator for EntryGenerator {
    fn generate(
        &self,
        node: &ModelNode,
        ctx: &GenerationContext,
    ) -> Result<Vec<Routine>, CompileError> {
        let NodeConfig::Entry { initial_state } = &node.config else {
            return Ok(Vec::new());
        };
        let initial_values = initial_state
            .iter()
            .map(|(field, value)| {
                if ctx.state.schema.field(field).is_none() {
                    warn!(node_id = %node.id, field = %field, "initial value for an undeclared state field");
                }
                InitialValue {
                    field: field.clone(),
                    value: value.clone(),
                }
            })
            .collect();
        let successor = ctx.flow.successors.get(&node.id).cloned().flatten();
        let next = ctx.target(successor.as_deref())?;
        let symbol = ctx.symbol_of(ctx.symbols.routine(&node.id), "routine", &node.id)?;
        Ok(vec![routine(
            node,
            symbol,
            RoutineBody::Entry(EntryRoutine {
                initial_values,
                next,
            }),
        )])
    }
}

impl RoutineGenerator for DecisionGenerator {
    fn generate(
        &self,
        node: &ModelNode,
        ctx: &GenerationContext,
    ) -> Result<Vec<Routine>, CompileError> {
        let Some(agent) = node.agent() else {
            return Ok(Vec::new());
        };
        let symbol = ctx.symbol_of(ctx.symbols.routine(&node.id), "routine", &node.id)?;
        let procedure = ctx.symbol_of(ctx.symbols.procedure(&node.id), "procedure", &node.id)?;
        let fields = ctx.node_fields(&node.id)?.clone();
        let successor = ctx.flow.successors.get(&node.id).cloned().flatten();
        let next = ctx.target(successor.as_deref())?;

        let mut routines = Vec::with_capacity(2);
        let tool_loop = match ctx.policy(node) {
            None => None,
            Some(policy) => {
                let group = ctx.symbol_of(ctx.symbols.group(&node.id), "capability group", &node.id)?;
                let tool_routine = match ctx.flow.owned_tools.get(&node.id) {
                    Some(tool_node) => {
                        ctx.symbol_of(ctx.symbols.routine(tool_node), "routine", tool_node)?
                    }
                    None => {
                        let synthesized = ctx.symbol_of(
                            ctx.symbols.synthesized_tools(&node.id),
                            "tool routine",
                            &node.id,
                        )?;
                        debug!(node_id = %node.id, routine = synthesized, "synthesized tool routine");
                        routines.push(routine(
                            node,
                            synthesized,
                            RoutineBody::ToolExec(ToolExecRoutine {
                                owner: symbol.to_string(),
                                owner_node: node.id.clone(),
                                group: group.to_string(),
                                fields: fields.clone(),
                                policy: policy.clone(),
                                synthesized: true,
                            }),
                        ));
                        synthesized
                    }
                };
                Some(ToolLoop {
                    routine: tool_routine.to_string(),
                    group: group.to_string(),
                    policy,
                })
            }
        };

        let decision = routine(
            node,
            symbol,
            RoutineBody::Decision(DecisionRoutine {
                procedure: procedure.to_string(),
                prompt: prompt_of(agent),
                fields,
                tool_loop,
                output_schema: ctx.symbols.output_schema(&node.id).map(str::to_string),
                output_key: agent.output_key.clone(),
                next,
            }),
        );
        routines.insert(0, decision);
        Ok(routines)
    }
}

impl RoutineGenerator for ToolExecGenerator {
    fn generate(
        &self,
        node: &ModelNode,
        ctx: &GenerationContext,
    ) -> Result<Vec<Routine>, CompileError> {
        let owner_id = ctx
            .flow
            .tool_owners
            .get(&node.id)
            .ok_or_else(|| CompileError::UnownedToolNode {
                node_id: node.id.clone(),
            })?;
        let owner = ctx.model.find_node(owner_id, &node.id)?;
        let symbol = ctx.symbol_of(ctx.symbols.routine(&node.id), "routine", &node.id)?;
        let owner_symbol = ctx.symbol_of(ctx.symbols.routine(owner_id), "routine", owner_id)?;
        let group = ctx.symbol_of(ctx.symbols.group(owner_id), "capability group", owner_id)?;
        let policy = ctx.policy(owner).ok_or_else(|| CompileError::Generation {
            fragment: format!("tool routine '{}'", symbol),
            message: format!("owner '{}' has no iteration policy", owner_id),
        })?;
        Ok(vec![routine(
            node,
            symbol,
            RoutineBody::ToolExec(ToolExecRoutine {
                owner: owner_symbol.to_string(),
                owner_node: owner_id.clone(),
                group: group.to_string(),
                fields: ctx.node_fields(owner_id)?.clone(),
                policy,
                synthesized: false,
            }),
        )])
    }
}

impl RoutineGenerator for RouterGenerator {
    fn generate(
        &self,
        node: &ModelNode,
        ctx: &GenerationContext,
    ) -> Result<Vec<Routine>, CompileError> {
        let NodeConfig::Router(config) = &node.config else {
            return Ok(Vec::new());
        };
        let symbol = ctx.symbol_of(ctx.symbols.routine(&node.id), "routine", &node.id)?;
        let procedure = ctx.symbol_of(ctx.symbols.procedure(&node.id), "procedure", &node.id)?;
        let table = ctx
            .routing
            .routers
            .get(&node.id)
            .ok_or_else(|| CompileError::Generation {
                fragment: format!("router '{}'", node.id),
                message: "no routing table was built".to_string(),
            })?;
        let routes = table
            .iter()
            .map(|route| {
                Ok(RouteEntry {
                    label: route.label.clone(),
                    description: route.description.clone(),
                    node_id: route.node_id.clone().unwrap_or_default(),
                    target: ctx.target(route.node_id.as_deref())?,
                })
            })
            .collect::<Result<Vec<_>, CompileError>>()?;
        Ok(vec![routine(
            node,
            symbol,
            RoutineBody::Router(RouterRoutine {
                procedure: procedure.to_string(),
                prompt: PromptSpec {
                    system: config.system_prompt.clone(),
                    user: config.user_prompt.clone(),
                    input_keys: config.input_keys.clone(),
                },
                routes,
                fallback: ctx.options.router_fallback,
                reason_field: ROUTING_REASON_FIELD.to_string(),
            }),
        )])
    }
}

impl RoutineGenerator for ConditionalGenerator {
    fn generate(
        &self,
        node: &ModelNode,
        ctx: &GenerationContext,
    ) -> Result<Vec<Routine>, CompileError> {
        let NodeConfig::Conditional(spec) = &node.config else {
            return Ok(Vec::new());
        };
        let symbol = ctx.symbol_of(ctx.symbols.routine(&node.id), "routine", &node.id)?;
        let branches = ctx
            .routing
            .conditionals
            .get(&node.id)
            .ok_or_else(|| CompileError::Generation {
                fragment: format!("conditional '{}'", node.id),
                message: "no branch table was built".to_string(),
            })?;

        let mode = match spec {
            ConditionSpec::ToolDetection => {
                let parent_id = ctx.flow.conditional_parents.get(&node.id).ok_or_else(|| {
                    CompileError::ConditionalWithoutParent {
                        node_id: node.id.clone(),
                    }
                })?;
                let parent = ctx.model.find_node(parent_id, &node.id)?;
                if parent.kind != NodeKind::Decision {
                    return Err(CompileError::InvalidConditional {
                        node_id: node.id.clone(),
                        message: format!(
                            "tool detection needs a decision node upstream, found '{}'",
                            parent_id
                        ),
                    });
                }
                ConditionMode::ToolDetection {
                    owner_node: parent_id.clone(),
                    owner_fields: ctx.node_fields(parent_id)?.clone(),
                    policy: ctx.policy(parent),
                }
            }
            ConditionSpec::Expression(source) => {
                let expression = match parse_expression(source) {
                    Ok(expression) => Some(expression),
                    Err(e) => {
                        warn!(node_id = %node.id, error = %e, "condition does not parse; it will always take the false branch");
                        None
                    }
                };
                ConditionMode::Expression {
                    source: source.clone(),
                    expression,
                }
            }
        };

        Ok(vec![routine(
            node,
            symbol,
            RoutineBody::Conditional(ConditionalRoutine {
                mode,
                on_true: ctx.target(Some(&branches.on_true))?,
                on_false: ctx.target(branches.on_false.as_deref())?,
            }),
        )])
    }
}
