use super::binding::CapabilityRef;
use super::builder::ModelNode;
use super::parsing::NodeKind;
use super::routines::{GenerationContext, generator_for};
use crate::error::CompileError;
use crate::program::{
    Capability, CapabilityArgument, CapabilityBody, CapabilityGroup, ConditionMode, OutputSchema,
    ProcedureInstance, ProcedureRole, Program, Routine, RoutineBody, Target, WorkerBody,
};
use crate::workflow::{IterationPolicy, ToolDefinition, ToolKind};
use ahash::AHashSet;
use serde_json::{Map, Value, json};
use tracing::debug;

/// Orders every generated fragment into one program and checks that each symbol a
/// fragment mentions is defined by some other fragment.
pub(crate) struct ProgramAssembler<'c, 'm, 'a> {
    ctx: &'c GenerationContext<'m, 'a>,
}

impl<'c, 'm, 'a> ProgramAssembler<'c, 'm, 'a> {
    pub(crate) fn new(ctx: &'c GenerationContext<'m, 'a>) -> Self {
        Self { ctx }
    }

    pub(crate) fn assemble(&self, name: &str) -> Result<Program, CompileError> {
        let entry_node = self.ctx.model.entry();
        let entry = self
            .ctx
            .symbols
            .routine(&entry_node.id)
            .ok_or_else(|| CompileError::Generation {
                fragment: "entry wiring".to_string(),
                message: format!("entry node '{}' has no routine", entry_node.id),
            })?
            .to_string();

        let program = Program {
            name: name.to_string(),
            state: self.ctx.state.schema.clone(),
            output_schemas: self.output_schemas(),
            capabilities: self.capabilities()?,
            groups: self.groups()?,
            procedures: self.procedures()?,
            routines: self.routines(entry_node)?,
            entry,
        };
        verify(&program)?;
        debug!(
            routines = program.routines.len(),
            capabilities = program.capabilities.len(),
            "program assembled"
        );
        Ok(program)
    }

    fn output_schemas(&self) -> Vec<OutputSchema> {
        self.ctx
            .model
            .nodes()
            .iter()
            .filter_map(|node| {
                let symbol = self.ctx.symbols.output_schema(&node.id)?;
                let agent = node.agent()?;
                Some(OutputSchema {
                    symbol: symbol.to_string(),
                    node_id: node.id.clone(),
                    fields: agent.output_fields.clone(),
                })
            })
            .collect()
    }

    /// Tools in first-binding order, then bound workers.
    fn capabilities(&self) -> Result<Vec<Capability>, CompileError> {
        let mut capabilities = Vec::new();
        for tool in &self.ctx.bindings.tools {
            capabilities.push(self.tool_capability(tool)?);
        }
        for worker_id in &self.ctx.bindings.workers {
            let worker = self.ctx.model.find_node(worker_id, "capability binding")?;
            capabilities.push(self.worker_capability(worker)?);
        }
        Ok(capabilities)
    }

    fn tool_capability(&self, tool: &ToolDefinition) -> Result<Capability, CompileError> {
        let symbol = self
            .ctx
            .symbols
            .tool(&tool.name)
            .ok_or_else(|| missing_symbol("capability", &tool.name))?;
        let body = match (tool.kind, &tool.remote, &tool.inline_body) {
            (ToolKind::Remote, Some(endpoint), _) => CapabilityBody::Remote {
                address: endpoint.address.clone(),
                method: endpoint.method.clone(),
                path: endpoint.path.clone(),
            },
            (ToolKind::Remote, None, _) => {
                return Err(CompileError::Generation {
                    fragment: format!("capability '{}'", tool.name),
                    message: "remote tool declares no server address".to_string(),
                });
            }
            (ToolKind::Inline, _, Some(source)) => CapabilityBody::Inline {
                source: source.clone(),
            },
            (ToolKind::Inline, _, None) => CapabilityBody::Placeholder,
        };
        Ok(Capability {
            symbol: symbol.to_string(),
            name: tool.name.clone(),
            description: tool.description.clone(),
            arguments: tool
                .arguments
                .iter()
                .map(|a| CapabilityArgument {
                    name: a.name.clone(),
                    arg_type: a.arg_type.clone(),
                    required: a.required,
                    description: a.description.clone(),
                })
                .collect(),
            returns: tool.return_schema.clone(),
            body,
        })
    }

    /// A worker is exposed as `worker(task: str)`; it runs its own bounded decision loop.
    fn worker_capability(&self, worker: &ModelNode) -> Result<Capability, CompileError> {
        let symbols = self.ctx.symbols;
        let symbol = symbols
            .worker(&worker.id)
            .ok_or_else(|| missing_symbol("worker capability", &worker.id))?;
        let procedure = symbols
            .procedure(&worker.id)
            .ok_or_else(|| missing_symbol("procedure", &worker.id))?;
        let agent = worker.agent().cloned().unwrap_or_default();

        let mut returns = Map::new();
        if agent.output_fields.is_empty() {
            returns.insert("result".to_string(), json!("str"));
        } else {
            for field in &agent.output_fields {
                returns.insert(field.name.clone(), json!(field.base_type.to_string()));
            }
        }
        returns.insert("success".to_string(), json!("bool"));

        let policy = self.ctx.policy(worker).unwrap_or_else(|| IterationPolicy {
            max_iterations: agent
                .max_iterations
                .unwrap_or(self.ctx.options.default_max_iterations),
            warning_message: agent
                .warning_message
                .clone()
                .unwrap_or_else(|| self.ctx.options.iteration_warning.clone()),
        });

        Ok(Capability {
            symbol: symbol.to_string(),
            name: worker.label.clone(),
            description: agent
                .system_prompt
                .clone()
                .unwrap_or_else(|| format!("Delegate a task to the {} worker", worker.label)),
            arguments: vec![CapabilityArgument {
                name: "task".to_string(),
                arg_type: "str".to_string(),
                required: true,
                description: "The task for the worker to carry out".to_string(),
            }],
            returns: Value::Object(returns),
            body: CapabilityBody::Worker(WorkerBody {
                node_id: worker.id.clone(),
                procedure: procedure.to_string(),
                system_prompt: agent.system_prompt.clone(),
                group: symbols.group(&worker.id).map(str::to_string),
                policy,
                output_schema: symbols.output_schema(&worker.id).map(str::to_string),
            }),
        })
    }

    fn groups(&self) -> Result<Vec<CapabilityGroup>, CompileError> {
        let symbols = self.ctx.symbols;
        let mut groups = Vec::new();
        for node in self.ctx.model.nodes() {
            let Some(group) = symbols.group(&node.id) else {
                continue;
            };
            let capabilities = self
                .ctx
                .bindings
                .capabilities_of(&node.id)
                .iter()
                .map(|capability| match capability {
                    CapabilityRef::Tool(name) => symbols
                        .tool(name)
                        .ok_or_else(|| missing_symbol("capability", name)),
                    CapabilityRef::Worker(id) => symbols
                        .worker(id)
                        .ok_or_else(|| missing_symbol("worker capability", id)),
                })
                .map(|symbol| symbol.map(str::to_string))
                .collect::<Result<Vec<_>, _>>()?;
            groups.push(CapabilityGroup {
                symbol: group.to_string(),
                owner: node.id.clone(),
                capabilities,
            });
        }
        Ok(groups)
    }

    fn procedures(&self) -> Result<Vec<ProcedureInstance>, CompileError> {
        let symbols = self.ctx.symbols;
        let mut procedures = Vec::new();
        for node in self.ctx.model.nodes() {
            let role = match node.kind {
                NodeKind::Decision => ProcedureRole::Decision,
                NodeKind::Router => ProcedureRole::Router,
                NodeKind::Worker => ProcedureRole::Worker,
                _ => continue,
            };
            let symbol = symbols
                .procedure(&node.id)
                .ok_or_else(|| missing_symbol("procedure", &node.id))?;
            procedures.push(ProcedureInstance {
                symbol: symbol.to_string(),
                node_id: node.id.clone(),
                role,
                group: symbols.group(&node.id).map(str::to_string),
            });
        }
        Ok(procedures)
    }

    /// Entry routine first, then node order; synthesized tool routines follow their owner.
    fn routines(&self, entry_node: &ModelNode) -> Result<Vec<Routine>, CompileError> {
        let mut routines = Vec::new();
        let ordered = std::iter::once(entry_node).chain(
            self.ctx
                .model
                .nodes()
                .iter()
                .filter(|n| n.id != entry_node.id),
        );
        for node in ordered {
            if let Some(generator) = generator_for(node.kind) {
                routines.extend(generator.generate(node, self.ctx)?);
            }
        }
        Ok(routines)
    }
}

fn missing_symbol(what: &str, id: &str) -> CompileError {
    CompileError::Generation {
        fragment: format!("{} '{}'", what, id),
        message: "no symbol was allocated".to_string(),
    }
}

/// Checks every cross-fragment reference of a finished program.
pub(crate) fn verify(program: &Program) -> Result<(), CompileError> {
    let routines: AHashSet<&str> = program.routines.iter().map(|r| r.symbol.as_str()).collect();
    let capabilities: AHashSet<&str> = program
        .capabilities
        .iter()
        .map(|c| c.symbol.as_str())
        .collect();
    let groups: AHashSet<&str> = program.groups.iter().map(|g| g.symbol.as_str()).collect();
    let procedures: AHashSet<&str> = program
        .procedures
        .iter()
        .map(|p| p.symbol.as_str())
        .collect();
    let schemas: AHashSet<&str> = program
        .output_schemas
        .iter()
        .map(|s| s.symbol.as_str())
        .collect();

    let unresolved = |fragment: &str, kind: &str, symbol: &str| CompileError::Generation {
        fragment: fragment.to_string(),
        message: format!("references undefined {} '{}'", kind, symbol),
    };
    let check_target = |fragment: &str, target: &Target| match target {
        Target::Routine(symbol) if !routines.contains(symbol.as_str()) => {
            Err(unresolved(fragment, "routine", symbol))
        }
        _ => Ok(()),
    };
    let check_field = |fragment: &str, field: &str| {
        if program.state.field(field).is_none() {
            Err(unresolved(fragment, "state field", field))
        } else {
            Ok(())
        }
    };

    if !routines.contains(program.entry.as_str()) {
        return Err(unresolved("entry wiring", "routine", &program.entry));
    }
    if routines.len() != program.routines.len() {
        return Err(CompileError::Generation {
            fragment: "routines".to_string(),
            message: "two routines share a symbol".to_string(),
        });
    }
    for group in &program.groups {
        for capability in &group.capabilities {
            if !capabilities.contains(capability.as_str()) {
                return Err(unresolved(&group.symbol, "capability", capability));
            }
        }
    }
    for procedure in &program.procedures {
        if let Some(group) = &procedure.group {
            if !groups.contains(group.as_str()) {
                return Err(unresolved(&procedure.symbol, "capability group", group));
            }
        }
    }
    for capability in &program.capabilities {
        if let CapabilityBody::Worker(worker) = &capability.body {
            if !procedures.contains(worker.procedure.as_str()) {
                return Err(unresolved(&capability.symbol, "procedure", &worker.procedure));
            }
        }
    }

    for routine in &program.routines {
        let fragment = routine.symbol.as_str();
        match &routine.body {
            RoutineBody::Entry(entry) => check_target(fragment, &entry.next)?,
            RoutineBody::Decision(decision) => {
                if !procedures.contains(decision.procedure.as_str()) {
                    return Err(unresolved(fragment, "procedure", &decision.procedure));
                }
                check_field(fragment, &decision.fields.messages)?;
                check_field(fragment, &decision.fields.calls)?;
                if let Some(tool_loop) = &decision.tool_loop {
                    check_target(fragment, &Target::Routine(tool_loop.routine.clone()))?;
                    if !groups.contains(tool_loop.group.as_str()) {
                        return Err(unresolved(fragment, "capability group", &tool_loop.group));
                    }
                    if let Some(iterations) = &decision.fields.iterations {
                        check_field(fragment, iterations)?;
                    }
                }
                if let Some(schema) = &decision.output_schema {
                    if !schemas.contains(schema.as_str()) {
                        return Err(unresolved(fragment, "output schema", schema));
                    }
                }
                check_target(fragment, &decision.next)?;
            }
            RoutineBody::ToolExec(tool) => {
                check_target(fragment, &Target::Routine(tool.owner.clone()))?;
                if !groups.contains(tool.group.as_str()) {
                    return Err(unresolved(fragment, "capability group", &tool.group));
                }
            }
            RoutineBody::Router(router) => {
                if !procedures.contains(router.procedure.as_str()) {
                    return Err(unresolved(fragment, "procedure", &router.procedure));
                }
                check_field(fragment, &router.reason_field)?;
                for route in &router.routes {
                    check_target(fragment, &route.target)?;
                }
            }
            RoutineBody::Conditional(conditional) => {
                if let ConditionMode::ToolDetection { owner_fields, .. } = &conditional.mode {
                    check_field(fragment, &owner_fields.messages)?;
                }
                check_target(fragment, &conditional.on_true)?;
                check_target(fragment, &conditional.on_false)?;
            }
        }
    }
    Ok(())
}
