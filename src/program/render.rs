use super::*;
use itertools::Itertools;
use std::fmt::{self, Write};

/// Renders the program text, section by section, in dependency order.
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# ======== KAIRO PROGRAM: {} ========", self.name)?;

        writeln!(f, "\n# --- STATE ---")?;
        writeln!(f, "state {} {{", STATE_RECORD_NAME)?;
        for field in &self.state.fields {
            writeln!(
                f,
                "    {}: {} = {}",
                field.name,
                field.descriptor,
                field.descriptor.initial_value()
            )?;
        }
        writeln!(f, "}}")?;

        writeln!(f, "\n# --- OUTPUT SCHEMAS ---")?;
        if self.output_schemas.is_empty() {
            writeln!(f, "# (none)")?;
        }
        for schema in &self.output_schemas {
            writeln!(f, "schema {} {{", schema.symbol)?;
            for field in &schema.fields {
                writeln!(f, "    {}: {}  # {}", field.name, field.base_type, field.description)?;
            }
            writeln!(f, "}}")?;
        }

        writeln!(f, "\n# --- CAPABILITIES ---")?;
        if self.capabilities.is_empty() {
            writeln!(f, "# (none)")?;
        }
        for capability in &self.capabilities {
            fmt_capability(f, capability)?;
        }

        writeln!(f, "\n# --- CAPABILITY GROUPS ---")?;
        if self.groups.is_empty() {
            writeln!(f, "# (none)")?;
        }
        for group in &self.groups {
            writeln!(
                f,
                "group {} = [{}]",
                group.symbol,
                group.capabilities.iter().join(", ")
            )?;
        }

        writeln!(f, "\n# --- PROCEDURES ---")?;
        for procedure in &self.procedures {
            match &procedure.group {
                Some(group) => writeln!(
                    f,
                    "procedure {} : {} bound to {}",
                    procedure.symbol, procedure.role, group
                )?,
                None => writeln!(f, "procedure {} : {}", procedure.symbol, procedure.role)?,
            }
        }

        writeln!(f, "\n# --- ROUTINES ---")?;
        for routine in &self.routines {
            writeln!(f)?;
            fmt_routine(f, routine)?;
        }

        writeln!(f, "\n# --- WIRING ---")?;
        writeln!(f, "entry -> {}", self.entry)?;

        writeln!(f, "\n# --- RUN ---")?;
        writeln!(
            f,
            "run(initial_state: {0}) -> {0}",
            STATE_RECORD_NAME
        )?;

        writeln!(f, "\n# ================ END OF PROGRAM ================")
    }
}

fn fmt_capability(f: &mut fmt::Formatter<'_>, capability: &Capability) -> fmt::Result {
    let arguments = capability
        .arguments
        .iter()
        .map(|a| {
            if a.required {
                format!("{}: {}", a.name, a.arg_type)
            } else {
                format!("{}?: {}", a.name, a.arg_type)
            }
        })
        .join(", ");
    writeln!(
        f,
        "capability {}({}) -> {}",
        capability.symbol, arguments, capability.returns
    )?;
    if !capability.description.is_empty() {
        writeln!(f, "    doc {:?}", capability.description)?;
    }
    match &capability.body {
        CapabilityBody::Remote {
            address,
            method,
            path,
        } => writeln!(f, "    remote {} {}{}", method, address, path),
        CapabilityBody::Inline { source } => {
            writeln!(f, "    inline {{")?;
            for line in source.lines() {
                writeln!(f, "        {}", line)?;
            }
            writeln!(f, "    }}")
        }
        CapabilityBody::Placeholder => {
            writeln!(f, "    placeholder -> {{\"error\": \"Tool not implemented\"}}")
        }
        CapabilityBody::Worker(worker) => {
            writeln!(
                f,
                "    worker node {} via {}, max {} iterations",
                worker.node_id, worker.procedure, worker.policy.max_iterations
            )?;
            if let Some(group) = &worker.group {
                writeln!(f, "    tools {}", group)?;
            }
            if let Some(schema) = &worker.output_schema {
                writeln!(f, "    output {}", schema)?;
            }
            Ok(())
        }
    }
}

fn fmt_prompt(f: &mut fmt::Formatter<'_>, prompt: &PromptSpec) -> fmt::Result {
    if let Some(system) = &prompt.system {
        writeln!(f, "    system {:?}", system)?;
    }
    if let Some(user) = &prompt.user {
        writeln!(f, "    user {:?}", user)?;
    }
    if !prompt.input_keys.is_empty() {
        writeln!(f, "    inputs [{}]", prompt.input_keys.iter().join(", "))?;
    }
    Ok(())
}

fn fmt_routine(f: &mut fmt::Formatter<'_>, routine: &Routine) -> fmt::Result {
    writeln!(
        f,
        "routine {} ({}, node {} {:?})",
        routine.symbol,
        routine.body.kind_name(),
        routine.node_id,
        routine.label
    )?;
    match &routine.body {
        RoutineBody::Entry(entry) => {
            for initial in &entry.initial_values {
                writeln!(f, "    set {} = {}", initial.field, initial.value)?;
            }
            writeln!(f, "    -> {}", entry.next)
        }
        RoutineBody::Decision(decision) => {
            writeln!(f, "    procedure {}", decision.procedure)?;
            fmt_prompt(f, &decision.prompt)?;
            writeln!(
                f,
                "    log {} calls {}",
                decision.fields.messages, decision.fields.calls
            )?;
            if let Some(tool_loop) = &decision.tool_loop {
                writeln!(
                    f,
                    "    tools {} counter {} max {} warn-at {}",
                    tool_loop.group,
                    decision.fields.iterations.as_deref().unwrap_or("-"),
                    tool_loop.policy.max_iterations,
                    tool_loop.policy.warning_iteration()
                )?;
                writeln!(f, "    warning {:?}", tool_loop.policy.warning_message)?;
                writeln!(f, "    on requests -> {}", tool_loop.routine)?;
            }
            if let Some(schema) = &decision.output_schema {
                writeln!(f, "    decode {}", schema)?;
            }
            if let Some(key) = &decision.output_key {
                writeln!(f, "    output -> {}", key)?;
            }
            writeln!(f, "    -> {}", decision.next)
        }
        RoutineBody::ToolExec(tool) => {
            writeln!(f, "    dispatch {} for {}", tool.group, tool.owner)?;
            writeln!(
                f,
                "    counter {} max {}",
                tool.fields.iterations.as_deref().unwrap_or("-"),
                tool.policy.max_iterations
            )?;
            writeln!(f, "    at-cap notice {:?}", LIMIT_REACHED_NOTICE)?;
            writeln!(f, "    -> {}", tool.owner)
        }
        RoutineBody::Router(router) => {
            writeln!(f, "    procedure {}", router.procedure)?;
            fmt_prompt(f, &router.prompt)?;
            for route in &router.routes {
                writeln!(f, "    {:?} -> {}", route.label, route.target)?;
            }
            let fallback = match router.fallback {
                RouterFallback::Fail => "fail",
                RouterFallback::FirstOption => "first-option",
            };
            writeln!(f, "    otherwise {}", fallback)?;
            writeln!(f, "    reason -> {}", router.reason_field)
        }
        RoutineBody::Conditional(conditional) => {
            match &conditional.mode {
                ConditionMode::ToolDetection {
                    owner_fields,
                    policy,
                    ..
                } => {
                    write!(f, "    when requests-pending in {}", owner_fields.messages)?;
                    if let Some(policy) = policy {
                        write!(f, " below {}", policy.max_iterations)?;
                    }
                    writeln!(f)?;
                }
                ConditionMode::Expression { source, expression } => match expression {
                    Some(expr) => writeln!(f, "    when {}", expr)?,
                    None => writeln!(f, "    when false  # unparsable: {:?}", source)?,
                },
            }
            writeln!(f, "    true -> {}", conditional.on_true)?;
            writeln!(f, "    false -> {}", conditional.on_false)
        }
    }
}

/// Formats the node id to symbol mapping of a program, one line per routine.
pub fn render_symbol_table(program: &Program) -> String {
    let mut output = String::new();
    let width = program
        .routines
        .iter()
        .map(|r| r.node_id.len())
        .max()
        .unwrap_or(0);
    for routine in &program.routines {
        // Writing to a String cannot fail.
        let _ = writeln!(
            output,
            "{:<width$}  {:<12} {}",
            routine.node_id,
            routine.body.kind_name(),
            routine.symbol,
            width = width
        );
    }
    for capability in &program.capabilities {
        if let CapabilityBody::Worker(worker) = &capability.body {
            let _ = writeln!(
                output,
                "{:<width$}  {:<12} {}",
                worker.node_id,
                "worker",
                capability.symbol,
                width = width
            );
        }
    }
    output
}
