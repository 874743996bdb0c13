use super::message::{Message, messages_from, messages_value};
use super::procedure::{CapabilityInvoker, DecisionProcedure, ProcedureCall, RouteOption};
use super::state::{SharedState, StateUpdates};
use super::template::{compose_user_turn, render_template};
use crate::compiler::{COUNT_FIELD, MESSAGES_FIELD};
use crate::condition::evaluate_condition;
use crate::error::RuntimeError;
use crate::program::{
    Capability, CapabilityBody, ConditionMode, ConditionalRoutine, DecisionRoutine, EntryRoutine,
    LIMIT_REACHED_NOTICE, OutputSchema, Program, RouterFallback, RouterRoutine, Routine,
    RoutineBody, STRUCTURED_OUTPUT_PROMPT, Target, ToolExecRoutine, WorkerBody,
};
use crate::trace::TraceFormatter;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

/// What one routine invocation produced.
#[derive(Debug)]
pub(super) struct StepOutcome {
    pub updates: StateUpdates,
    pub next: Target,
    pub note: Option<String>,
}

/// Where a decision routine is in its tool-loop episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionPhase {
    /// Node log empty: build the context from scratch.
    FreshStart,
    /// Re-entered after a tool round-trip.
    Continuing,
    /// Re-entered with the iteration counter at its cap.
    CapReached,
    /// Re-entered through the graph after a finished episode.
    Revisit,
}

impl DecisionPhase {
    pub fn detect(history: &[Message], iterations: i64, cap: Option<i64>) -> Self {
        let Some(last) = history.last() else {
            return DecisionPhase::FreshStart;
        };
        if cap.is_some_and(|cap| iterations >= cap) {
            return DecisionPhase::CapReached;
        }
        match last {
            Message::Tool { .. } => DecisionPhase::Continuing,
            Message::Human { content } if content == LIMIT_REACHED_NOTICE => {
                DecisionPhase::Continuing
            }
            _ => DecisionPhase::Revisit,
        }
    }
}

/// Executes single routines against a state snapshot.
pub(super) struct RoutineEngine<'r, P, I> {
    program: &'r Program,
    procedure: &'r mut P,
    invoker: &'r mut I,
}

impl<'r, P: DecisionProcedure, I: CapabilityInvoker> RoutineEngine<'r, P, I> {
    pub(super) fn new(program: &'r Program, procedure: &'r mut P, invoker: &'r mut I) -> Self {
        Self {
            program,
            procedure,
            invoker,
        }
    }

    pub(super) fn execute(
        &mut self,
        routine: &Routine,
        state: &SharedState,
    ) -> Result<StepOutcome, RuntimeError> {
        match &routine.body {
            RoutineBody::Entry(entry) => Ok(self.entry(entry)),
            RoutineBody::Decision(decision) => self.decision(routine, decision, state),
            RoutineBody::ToolExec(tool) => self.tool_exec(tool, state),
            RoutineBody::Router(router) => self.router(routine, router, state),
            RoutineBody::Conditional(conditional) => Ok(self.conditional(routine, conditional, state)),
        }
    }

    fn entry(&self, entry: &EntryRoutine) -> StepOutcome {
        StepOutcome {
            updates: entry
                .initial_values
                .iter()
                .map(|v| (v.field.clone(), v.value.clone()))
                .collect(),
            next: entry.next.clone(),
            note: None,
        }
    }

    fn decision(
        &mut self,
        routine: &Routine,
        decision: &DecisionRoutine,
        state: &SharedState,
    ) -> Result<StepOutcome, RuntimeError> {
        let fields = &decision.fields;
        let history = messages_from(state.get(&fields.messages));
        let iterations = fields
            .iterations
            .as_deref()
            .map(|f| state.counter(f))
            .unwrap_or(0);
        let cap = decision
            .tool_loop
            .as_ref()
            .map(|t| i64::from(t.policy.max_iterations));
        let phase = DecisionPhase::detect(&history, iterations, cap);
        debug!(routine = %routine.symbol, ?phase, iterations, "decision routine entered");

        if let (DecisionPhase::CapReached, Some(symbol)) = (phase, &decision.output_schema) {
            return self.capped_decode(routine, decision, history, symbol);
        }

        // Turns to persist into the node log before the call.
        let mut turns: Vec<Message> = Vec::new();
        match phase {
            DecisionPhase::FreshStart => {
                if let Some(system) = &decision.prompt.system {
                    turns.push(Message::system(&render_template(system, state.values())));
                }
                turns.extend(messages_from(state.get(MESSAGES_FIELD)));
                if let Some(user) = self.user_turn(decision.prompt.user.as_deref(), &decision.prompt.input_keys, state) {
                    turns.push(Message::human(&user));
                }
                if let Some(tool_loop) = &decision.tool_loop {
                    if tool_loop.policy.warning_iteration() == 0 {
                        turns.push(Message::human(&tool_loop.policy.warning_message));
                    }
                }
            }
            DecisionPhase::Revisit => {
                if let Some(user) = self.user_turn(decision.prompt.user.as_deref(), &decision.prompt.input_keys, state) {
                    turns.push(Message::human(&user));
                }
            }
            DecisionPhase::Continuing => {
                if let Some(tool_loop) = &decision.tool_loop {
                    if iterations == i64::from(tool_loop.policy.warning_iteration()) {
                        turns.push(Message::human(&tool_loop.policy.warning_message));
                    }
                }
            }
            DecisionPhase::CapReached => {}
        }

        let mut context = history;
        context.extend(turns.iter().cloned());

        let program = self.program;
        let bound: Vec<&Capability> = match (&decision.tool_loop, phase) {
            (Some(_), DecisionPhase::CapReached) | (None, _) => Vec::new(),
            (Some(tool_loop), _) => program.group_capabilities(&tool_loop.group),
        };
        let response = self.call(&decision.procedure, &routine.node_id, &context, &bound)?;

        let mut updates: StateUpdates = Vec::new();
        if !turns.is_empty() {
            updates.push((fields.messages.clone(), messages_value(&turns)));
        }
        updates.push((COUNT_FIELD.to_string(), json!(1)));
        updates.push((fields.calls.clone(), json!(1)));

        let looping = response.has_requests() && !bound.is_empty();
        if let Some(tool_loop) = decision.tool_loop.as_ref().filter(|_| looping) {
            let logged = messages_value(std::slice::from_ref(&response));
            updates.push((MESSAGES_FIELD.to_string(), logged.clone()));
            updates.push((fields.messages.clone(), logged));
            return Ok(StepOutcome {
                updates,
                next: Target::routine(&tool_loop.routine),
                note: Some(format!("{} capability request(s)", response.requests().len())),
            });
        }

        // Final answer. Requests made without a binding are dropped.
        let response = match response {
            Message::Assistant { content, requests } if !requests.is_empty() => {
                warn!(node_id = %routine.node_id, "capability requests without a binding ignored");
                Message::answer(&content)
            }
            other => other,
        };
        let logged = messages_value(std::slice::from_ref(&response));
        updates.push((MESSAGES_FIELD.to_string(), logged.clone()));
        updates.push((fields.messages.clone(), logged));
        context.push(response.clone());

        if let Some(symbol) = &decision.output_schema {
            let schema = self.output_schema(symbol)?;
            let decoded = self.decode(&decision.procedure, &routine.node_id, &mut context, schema)?;
            updates.push((COUNT_FIELD.to_string(), json!(1)));
            updates.push((fields.calls.clone(), json!(1)));
            for field in &schema.fields {
                if let Some(value) = decoded.get(&field.name) {
                    updates.push((field.name.clone(), value.clone()));
                }
            }
        }
        if let Some(key) = &decision.output_key {
            updates.push((key.clone(), Value::String(response.content().to_string())));
        }
        if let Some(iterations) = &fields.iterations {
            updates.push((iterations.clone(), json!(0)));
        }

        let note = match phase {
            DecisionPhase::CapReached => "final answer at iteration cap",
            _ => "final answer",
        };
        Ok(StepOutcome {
            updates,
            next: decision.next.clone(),
            note: Some(note.to_string()),
        })
    }

    /// At the cap a schema-bound node skips the free-form call and decodes straight from its log.
    ///
    /// The decoded record is logged as the node's final answer so that tool detection sees no
    /// pending requests.
    fn capped_decode(
        &mut self,
        routine: &Routine,
        decision: &DecisionRoutine,
        history: Vec<Message>,
        symbol: &str,
    ) -> Result<StepOutcome, RuntimeError> {
        let fields = &decision.fields;
        let schema = self.output_schema(symbol)?;
        let mut context = history;
        let decoded = self.decode(&decision.procedure, &routine.node_id, &mut context, schema)?;

        let answer = Message::answer(&Value::Object(decoded.clone()).to_string());
        let logged = messages_value(std::slice::from_ref(&answer));
        let mut updates: StateUpdates = vec![
            (COUNT_FIELD.to_string(), json!(1)),
            (fields.calls.clone(), json!(1)),
            (MESSAGES_FIELD.to_string(), logged.clone()),
            (fields.messages.clone(), logged),
        ];
        for field in &schema.fields {
            if let Some(value) = decoded.get(&field.name) {
                updates.push((field.name.clone(), value.clone()));
            }
        }
        if let Some(iterations) = &fields.iterations {
            updates.push((iterations.clone(), json!(0)));
        }
        Ok(StepOutcome {
            updates,
            next: decision.next.clone(),
            note: Some("structured decode at iteration cap".to_string()),
        })
    }

    fn tool_exec(
        &mut self,
        tool: &ToolExecRoutine,
        state: &SharedState,
    ) -> Result<StepOutcome, RuntimeError> {
        let back = Target::routine(&tool.owner);
        let history = messages_from(state.get(&tool.fields.messages));
        let requests = history
            .last()
            .map(|m| m.requests().to_vec())
            .unwrap_or_default();
        if requests.is_empty() {
            return Ok(StepOutcome {
                updates: Vec::new(),
                next: back,
                note: Some("no pending requests".to_string()),
            });
        }

        let iterations = tool
            .fields
            .iterations
            .as_deref()
            .map(|f| state.counter(f))
            .unwrap_or(0);
        if iterations >= i64::from(tool.policy.max_iterations) {
            let notice = messages_value(&[Message::human(LIMIT_REACHED_NOTICE)]);
            return Ok(StepOutcome {
                updates: vec![
                    (MESSAGES_FIELD.to_string(), notice.clone()),
                    (tool.fields.messages.clone(), notice),
                ],
                next: back,
                note: Some("iteration cap reached, nothing executed".to_string()),
            });
        }

        let program = self.program;
        let capabilities = program.group_capabilities(&tool.group);
        let mut results = Vec::with_capacity(requests.len());
        for request in &requests {
            let content = match capabilities
                .iter()
                .find(|c| c.symbol == request.name)
                .or_else(|| capabilities.iter().find(|c| c.name == request.name))
            {
                None => format!("Error: capability '{}' not found", request.name),
                Some(capability) => match self.dispatch(capability, &request.arguments) {
                    Ok(value) => display_result(&value),
                    Err(e) => format!("Error executing capability: {}", e),
                },
            };
            results.push(Message::Tool {
                request_id: request.id.clone(),
                name: request.name.clone(),
                content,
            });
        }

        let logged = messages_value(&results);
        let mut updates = vec![
            (MESSAGES_FIELD.to_string(), logged.clone()),
            (tool.fields.messages.clone(), logged),
        ];
        if let Some(field) = &tool.fields.iterations {
            updates.push((field.clone(), json!(iterations + 1)));
        }
        Ok(StepOutcome {
            updates,
            next: back,
            note: Some(format!("executed {} request(s)", results.len())),
        })
    }

    fn router(
        &mut self,
        routine: &Routine,
        router: &RouterRoutine,
        state: &SharedState,
    ) -> Result<StepOutcome, RuntimeError> {
        let mut context = Vec::new();
        if let Some(system) = &router.prompt.system {
            context.push(Message::system(&render_template(system, state.values())));
        }
        context.extend(messages_from(state.get(MESSAGES_FIELD)));
        if let Some(user) = self.user_turn(router.prompt.user.as_deref(), &router.prompt.input_keys, state) {
            context.push(Message::human(&user));
        }
        let options: Vec<RouteOption> = router
            .routes
            .iter()
            .map(|r| RouteOption {
                label: r.label.clone(),
                description: r.description.clone(),
            })
            .collect();
        let call = ProcedureCall {
            instance: &router.procedure,
            node_id: &routine.node_id,
            messages: &context,
            capabilities: &[],
        };
        let choice = self
            .procedure
            .choose(&call, &options)
            .map_err(|message| RuntimeError::Procedure {
                instance: router.procedure.clone(),
                message,
            })?;

        let route = match router.routes.iter().find(|r| r.label == choice.label) {
            Some(route) => route,
            None => match (router.fallback, router.routes.first()) {
                (RouterFallback::FirstOption, Some(first)) => {
                    warn!(router = %routine.node_id, choice = %choice.label, fallback = %first.label, "router answer outside its options, taking the first option");
                    first
                }
                _ => {
                    return Err(RuntimeError::InvalidRoute {
                        router_id: routine.node_id.clone(),
                        choice: choice.label,
                    });
                }
            },
        };

        let reason = choice
            .reason
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null);
        Ok(StepOutcome {
            updates: vec![
                (COUNT_FIELD.to_string(), json!(1)),
                (router.reason_field.clone(), reason),
            ],
            next: route.target.clone(),
            note: Some(format!("chose {:?}", route.label)),
        })
    }

    fn conditional(
        &self,
        routine: &Routine,
        conditional: &ConditionalRoutine,
        state: &SharedState,
    ) -> StepOutcome {
        let mut updates = Vec::new();
        let (outcome, note) = match &conditional.mode {
            ConditionMode::ToolDetection {
                owner_fields,
                policy,
                ..
            } => {
                let history = messages_from(state.get(&owner_fields.messages));
                let pending = history
                    .iter()
                    .rev()
                    .find(|m| matches!(m, Message::Assistant { .. }))
                    .is_some_and(Message::has_requests);
                let at_cap = match (policy, &owner_fields.iterations) {
                    (Some(policy), Some(field)) => {
                        state.counter(field) >= i64::from(policy.max_iterations)
                    }
                    _ => false,
                };
                match (pending, at_cap, policy) {
                    (true, true, Some(policy)) => {
                        let already_warned = matches!(
                            history.last(),
                            Some(Message::Human { content }) if *content == policy.warning_message
                        );
                        if !already_warned {
                            updates.push((
                                owner_fields.messages.clone(),
                                messages_value(&[Message::human(&policy.warning_message)]),
                            ));
                        }
                        (false, "requests pending at iteration cap".to_string())
                    }
                    (true, _, _) => (true, "requests pending".to_string()),
                    (false, _, _) => (false, "no requests pending".to_string()),
                }
            }
            ConditionMode::Expression { source, expression } => match expression {
                None => (false, format!("unparsable condition {:?}", source)),
                Some(expression) => match evaluate_condition(expression, state.values()) {
                    Ok((outcome, trace)) => (outcome, TraceFormatter::format_trace(&trace)),
                    Err(e) => {
                        warn!(node_id = %routine.node_id, error = %e, "condition failed to evaluate, taking the false branch");
                        (false, format!("evaluation failed: {}", e))
                    }
                },
            },
        };
        StepOutcome {
            updates,
            next: if outcome {
                conditional.on_true.clone()
            } else {
                conditional.on_false.clone()
            },
            note: Some(note),
        }
    }

    fn user_turn(&self, template: Option<&str>, input_keys: &[String], state: &SharedState) -> Option<String> {
        compose_user_turn(template, input_keys, state.values())
    }

    fn output_schema(&self, symbol: &str) -> Result<&'r OutputSchema, RuntimeError> {
        let program = self.program;
        program
            .output_schema(symbol)
            .ok_or_else(|| RuntimeError::UnknownRoutine(symbol.to_string()))
    }

    fn call(
        &mut self,
        instance: &str,
        node_id: &str,
        messages: &[Message],
        capabilities: &[&Capability],
    ) -> Result<Message, RuntimeError> {
        let call = ProcedureCall {
            instance,
            node_id,
            messages,
            capabilities,
        };
        self.procedure
            .invoke(&call)
            .map_err(|message| RuntimeError::Procedure {
                instance: instance.to_string(),
                message,
            })
    }

    /// Schema-constrained decode; every declared field must come back.
    fn decode(
        &mut self,
        instance: &str,
        node_id: &str,
        context: &mut Vec<Message>,
        schema: &OutputSchema,
    ) -> Result<Map<String, Value>, RuntimeError> {
        context.push(Message::human(STRUCTURED_OUTPUT_PROMPT));
        let call = ProcedureCall {
            instance,
            node_id,
            messages: context.as_slice(),
            capabilities: &[],
        };
        let decoded = self
            .procedure
            .decode_structured(&call, schema)
            .map_err(|message| RuntimeError::Procedure {
                instance: instance.to_string(),
                message,
            })?;
        for field in &schema.fields {
            if !decoded.contains_key(&field.name) {
                return Err(RuntimeError::MissingOutputField {
                    node_id: node_id.to_string(),
                    field: field.name.clone(),
                });
            }
        }
        Ok(decoded)
    }

    /// Runs one capability. Failures are returned as messages and recorded per call.
    fn dispatch(&mut self, capability: &Capability, arguments: &Value) -> Result<Value, String> {
        match &capability.body {
            CapabilityBody::Placeholder => Ok(json!({"error": "Tool not implemented"})),
            CapabilityBody::Worker(worker) => self
                .run_worker(worker, arguments)
                .map_err(|e| e.to_string()),
            CapabilityBody::Remote { .. } | CapabilityBody::Inline { .. } => {
                self.invoker.invoke(capability, arguments)
            }
        }
    }

    /// A worker's own bounded decision loop over a private conversation.
    fn run_worker(&mut self, worker: &WorkerBody, arguments: &Value) -> Result<Value, RuntimeError> {
        let task = match arguments.get("task") {
            Some(Value::String(task)) => task.clone(),
            Some(other) => other.to_string(),
            None => display_result(arguments),
        };
        let mut context = Vec::new();
        if let Some(system) = &worker.system_prompt {
            context.push(Message::system(system));
        }
        context.push(Message::human(&task));

        let program = self.program;
        let capabilities = worker
            .group
            .as_deref()
            .map(|g| program.group_capabilities(g))
            .unwrap_or_default();
        let policy = &worker.policy;
        let mut iterations: u32 = 0;
        let answer = loop {
            if iterations == policy.warning_iteration() && iterations < policy.max_iterations {
                context.push(Message::human(&policy.warning_message));
            }
            let bound: &[&Capability] = if iterations < policy.max_iterations {
                &capabilities
            } else {
                &[]
            };
            let response = self.call(&worker.procedure, &worker.node_id, &context, bound)?;
            context.push(response.clone());
            if !response.has_requests() || bound.is_empty() {
                break response;
            }
            for request in response.requests() {
                let content = match bound
                    .iter()
                    .find(|c| c.symbol == request.name || c.name == request.name)
                {
                    None => format!("Error: capability '{}' not found", request.name),
                    Some(capability) => match self.dispatch(capability, &request.arguments) {
                        Ok(value) => display_result(&value),
                        Err(e) => format!("Error executing capability: {}", e),
                    },
                };
                context.push(Message::Tool {
                    request_id: request.id.clone(),
                    name: request.name.clone(),
                    content,
                });
            }
            iterations += 1;
        };

        match &worker.output_schema {
            Some(symbol) => {
                let schema = self.output_schema(symbol)?;
                let mut decoded = self.decode(&worker.procedure, &worker.node_id, &mut context, schema)?;
                decoded.insert("success".to_string(), Value::Bool(true));
                Ok(Value::Object(decoded))
            }
            None => Ok(json!({"result": answer.content(), "success": true})),
        }
    }
}

fn display_result(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
