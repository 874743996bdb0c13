//! Tests for the compilation pipeline: validation, inference, naming and generated routines.
mod common;
use common::*;
use kairo::compiler::{COUNT_FIELD, MESSAGES_FIELD, ROUTING_REASON_FIELD};
use kairo::prelude::*;
use kairo::program::{CapabilityBody, ConditionMode};
use kairo::workflow::{EdgeDefinition, MergePolicy, NodeDefinition, StateFieldDefinition, TypeDescriptor};
use serde_json::json;
use std::collections::BTreeSet;

#[test]
fn test_minimal_graph_has_no_tool_branch() {
    let program = compile_graph(create_minimal_graph());

    assert_eq!(program.routines.len(), 2);
    assert!(program.capabilities.is_empty());
    assert!(program.groups.is_empty());
    assert!(
        !program
            .routines
            .iter()
            .any(|r| matches!(r.body, RoutineBody::ToolExec(_)))
    );

    let decision = program.routine_for_node("d1").expect("decision routine");
    let RoutineBody::Decision(body) = &decision.body else {
        panic!("expected a decision routine, got {}", decision.body.kind_name());
    };
    assert!(body.tool_loop.is_none());
    assert!(body.fields.iterations.is_none());
    assert_eq!(body.next, Target::Terminal);

    let entry = program.routine(&program.entry).expect("entry routine");
    let RoutineBody::Entry(entry_body) = &entry.body else {
        panic!("entry must be an entry routine");
    };
    assert_eq!(entry_body.next, Target::routine(&decision.symbol));

    let text = program.to_string();
    assert!(text.contains("-> TERMINAL"));
    assert!(!text.contains("on requests"));
}

#[test]
fn test_compilation_is_idempotent() {
    let first = compile_graph(create_tool_loop_graph(5));
    let second = compile_graph(create_tool_loop_graph(5));
    assert_eq!(first, second);
    assert_eq!(first.to_string(), second.to_string());
}

#[test]
fn test_colliding_labels_get_distinct_symbols() {
    let ids = ["a-1", "a_1", "A 1", "a1"];
    let mut nodes = vec![NodeDefinition::new("start", "EntryPoint", "Start")];
    for id in ids {
        nodes.push(NodeDefinition::new(id, "LLMNode", "Agent!"));
    }
    let mut edges = vec![EdgeDefinition::direct("start", ids[0])];
    for pair in ids.windows(2) {
        edges.push(EdgeDefinition::direct(pair[0], pair[1]));
    }
    let graph = WorkflowGraph {
        entrypoint: "start".to_string(),
        nodes,
        edges,
        ..Default::default()
    };

    let program = compile_graph(graph);
    let routines: BTreeSet<&str> = program.routines.iter().map(|r| r.symbol.as_str()).collect();
    let procedures: BTreeSet<&str> = program.procedures.iter().map(|p| p.symbol.as_str()).collect();
    let fields: BTreeSet<&str> = program.state.fields.iter().map(|f| f.name.as_str()).collect();

    assert_eq!(routines.len(), 5);
    assert_eq!(procedures.len(), 4);
    assert_eq!(fields.len(), program.state.fields.len());
    for symbol in routines.iter().chain(procedures.iter()) {
        assert!(
            symbol.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
            "'{}' is not a clean identifier",
            symbol
        );
    }
}

#[test]
fn test_tool_return_edge_is_inferred_once() {
    let mut graph = create_tool_loop_graph(5);
    graph
        .nodes
        .push(NodeDefinition::new("audit", "LLMNode", "Audit"));
    // Unrelated edge out of the tool node; the return edge is still inferred.
    graph.edges.push(EdgeDefinition::direct("tools", "audit"));

    let program = compile_graph(graph);
    let agent = program.routine_for_node("agent").expect("agent routine");
    let tool = program.routine_for_node("tools").expect("tool routine");

    let RoutineBody::ToolExec(tool_body) = &tool.body else {
        panic!("expected a tool routine");
    };
    assert_eq!(tool_body.owner, agent.symbol);
    assert_eq!(tool_body.owner_node, "agent");
    assert!(!tool_body.synthesized);

    let RoutineBody::Decision(agent_body) = &agent.body else {
        panic!("expected a decision routine");
    };
    let tool_loop = agent_body.tool_loop.as_ref().expect("agent is tool-bound");
    assert_eq!(tool_loop.routine, tool.symbol);
    assert_eq!(tool_loop.policy.max_iterations, 5);
}

#[test]
fn test_missing_false_branch_is_terminal() {
    let program = compile_graph(create_tool_loop_graph(3));
    let check = program.routine_for_node("check").expect("conditional routine");
    let tools = program.routine_for_node("tools").expect("tool routine");

    let RoutineBody::Conditional(body) = &check.body else {
        panic!("expected a conditional routine");
    };
    assert_eq!(body.on_true, Target::routine(&tools.symbol));
    assert_eq!(body.on_false, Target::Terminal);
    match &body.mode {
        ConditionMode::ToolDetection {
            owner_node, policy, ..
        } => {
            assert_eq!(owner_node, "agent");
            assert_eq!(policy.as_ref().map(|p| p.max_iterations), Some(3));
        }
        other => panic!("expected tool detection, got {:?}", other),
    }
}

#[test]
fn test_unmapped_router_edge_is_a_reference_error() {
    let graph = WorkflowGraph {
        entrypoint: "start".to_string(),
        nodes: vec![
            NodeDefinition::new("start", "EntryPoint", "Start"),
            NodeDefinition::new("router", "RouterBlock", "Router")
                .with_config("choices", json!({"A": "nodeX", "B": "nodeY"})),
            NodeDefinition::new("nodeX", "LLMNode", "X"),
            NodeDefinition::new("nodeY", "LLMNode", "Y"),
            NodeDefinition::new("nodeZ", "LLMNode", "Z"),
        ],
        edges: vec![
            EdgeDefinition::direct("start", "router"),
            EdgeDefinition::direct("router", "nodeX"),
            EdgeDefinition::direct("router", "nodeY"),
            EdgeDefinition::direct("router", "nodeZ"),
        ],
        ..Default::default()
    };

    let err = Compiler::builder(graph).build().compile().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Reference);
    assert!(err.to_string().contains("nodeZ"));
    match err {
        CompileError::UnmappedRouteTarget {
            router_id,
            target_id,
        } => {
            assert_eq!(router_id, "router");
            assert_eq!(target_id, "nodeZ");
        }
        other => panic!("expected UnmappedRouteTarget, got {:?}", other),
    }
}

#[test]
fn test_router_table_and_reason_field() {
    let program = compile_graph(create_router_graph());
    let triage = program.routine_for_node("triage").expect("router routine");
    let RoutineBody::Router(body) = &triage.body else {
        panic!("expected a router routine");
    };
    assert_eq!(body.labels(), vec!["billing".to_string(), "support".to_string()]);
    assert_eq!(body.fallback, RouterFallback::Fail);
    let support = program.routine_for_node("support_agent").expect("support routine");
    assert_eq!(body.routes[1].target, Target::routine(&support.symbol));

    let reason = program
        .state
        .field(ROUTING_REASON_FIELD)
        .expect("routing reason field");
    assert!(reason.descriptor.optional);
}

#[test]
fn test_error_taxonomy() {
    let mut unknown_type = create_minimal_graph();
    unknown_type.nodes[1].node_type = "Oracle".to_string();
    let err = Compiler::builder(unknown_type).build().compile().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Graph);
    assert!(matches!(err, CompileError::UnsupportedNodeType { ref node_id, .. } if node_id == "d1"));

    let mut dangling = create_minimal_graph();
    dangling.edges.push(EdgeDefinition::direct("d1", "ghost"));
    let err = Compiler::builder(dangling).build().compile().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Graph);
    assert!(err.to_string().contains("ghost"));

    let mut orphan = create_minimal_graph();
    orphan
        .nodes
        .push(NodeDefinition::new("lonely", "ConditionalBlock", "Lonely"));
    let err = Compiler::builder(orphan).build().compile().unwrap_err();
    assert!(matches!(err, CompileError::ConditionalWithoutParent { ref node_id } if node_id == "lonely"));

    let mut unresolved = create_minimal_graph();
    unresolved.nodes[1] = unresolved.nodes[1]
        .clone()
        .with_config("selected_tools", json!(["teleport"]));
    let err = Compiler::builder(unresolved).build().compile().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Generation);
    assert!(err.to_string().contains("teleport"));

    let err = kairo::validate_document(r#"{"nodes": []}"#).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Structure);
}

#[test]
fn test_compiler_with_type_mapping() {
    let mut graph = create_minimal_graph();
    graph.nodes[1].node_type = "Thinker".to_string();

    let program = Compiler::builder(graph)
        .with_type_mapping("Thinker", "Decision")
        .build()
        .compile()
        .expect("mapped type compiles");
    let decision = program.routine_for_node("d1").expect("decision routine");
    assert_eq!(decision.body.kind_name(), "decision");
}

#[test]
fn test_worker_compiles_to_capability() {
    let program = compile_graph(create_worker_graph());

    assert!(program.routine_for_node("helper").is_none());
    let worker = program
        .capabilities
        .iter()
        .find(|c| matches!(c.body, CapabilityBody::Worker(_)))
        .expect("worker capability");
    assert_eq!(worker.arguments.len(), 1);
    assert_eq!(worker.arguments[0].name, "task");
    assert_eq!(worker.arguments[0].arg_type, "str");
    assert_eq!(worker.returns, json!({"result": "str", "success": "bool"}));

    let boss = program.routine_for_node("boss").expect("boss routine");
    let RoutineBody::Decision(body) = &boss.body else {
        panic!("expected a decision routine");
    };
    let tool_loop = body.tool_loop.as_ref().expect("boss is tool-bound");
    let group = program.group(&tool_loop.group).expect("boss group");
    assert_eq!(group.capabilities, vec![worker.symbol.clone()]);

    // No tool node was drawn, so the dispatch routine is synthesized.
    let dispatch = program.routine(&tool_loop.routine).expect("dispatch routine");
    assert!(matches!(&dispatch.body, RoutineBody::ToolExec(t) if t.synthesized));
}

#[test]
fn test_generated_fields_and_collisions() {
    let program = compile_graph(create_tool_loop_graph(4));
    let names: Vec<&str> = program.state.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(&names[..2], &[COUNT_FIELD, MESSAGES_FIELD]);
    for expected in [
        "node_agent_messages",
        "node_agent_calls",
        "node_agent_iterations",
        "summary",
        "confidence",
    ] {
        assert!(names.contains(&expected), "missing field {}", expected);
    }
    let messages = program.state.field("node_agent_messages").expect("log field");
    assert_eq!(messages.descriptor.merge_policy, MergePolicy::Append);
    let calls = program.state.field("node_agent_calls").expect("calls field");
    assert_eq!(calls.descriptor.merge_policy, MergePolicy::Additive);

    let mut colliding = create_tool_loop_graph(4);
    colliding.state_schema.push(StateFieldDefinition {
        name: "node_agent_calls".to_string(),
        descriptor: TypeDescriptor::parse("int"),
    });
    let err = Compiler::builder(colliding).build().compile().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Generation);
    assert!(matches!(err, CompileError::FieldCollision { ref field, .. } if field == "node_agent_calls"));
}

#[test]
fn test_builder_defaults_flow_into_policies() {
    let mut graph = create_tool_loop_graph(3);
    graph.nodes[1].config.remove("max_tool_iterations");

    let program = Compiler::builder(graph)
        .with_default_max_iterations(7)
        .with_warning_message("Finish up.")
        .with_router_fallback(RouterFallback::FirstOption)
        .build()
        .compile()
        .expect("compiles");
    let agent = program.routine_for_node("agent").expect("agent routine");
    let RoutineBody::Decision(body) = &agent.body else {
        panic!("expected a decision routine");
    };
    let policy = &body.tool_loop.as_ref().expect("tool loop").policy;
    assert_eq!(policy.max_iterations, 7);
    assert_eq!(policy.warning_message, "Finish up.");
    assert_eq!(policy.warning_iteration(), 4);
}

#[test]
fn test_router_labels_keep_document_order() {
    let mut graph = create_router_graph();
    graph.nodes[1] = NodeDefinition::new("triage", "RouterBlock", "Triage").with_config(
        "choices",
        json!({"zeta": "billing_agent", "alpha": "support_agent"}),
    );
    let program = compile_graph(graph);
    let triage = program.routine_for_node("triage").expect("router routine");
    let RoutineBody::Router(body) = &triage.body else {
        panic!("expected a router routine");
    };
    assert_eq!(body.labels(), vec!["zeta".to_string(), "alpha".to_string()]);
    let billing = program.routine_for_node("billing_agent").expect("billing routine");
    assert_eq!(body.routes[0].target, Target::routine(&billing.symbol));
}

#[test]
fn test_choice_without_a_node_is_unresolved() {
    let graph = WorkflowGraph {
        entrypoint: "start".to_string(),
        nodes: vec![
            NodeDefinition::new("start", "EntryPoint", "Start"),
            NodeDefinition::new("triage", "RouterBlock", "Triage").with_config(
                "choices",
                json!({"billing": "billing_agent", "refunds": "refund_desk"}),
            ),
            NodeDefinition::new("billing_agent", "LLMNode", "Billing"),
        ],
        edges: vec![
            EdgeDefinition::direct("start", "triage"),
            EdgeDefinition::direct("triage", "billing_agent"),
        ],
        ..Default::default()
    };

    let err = Compiler::builder(graph).build().compile().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Reference);
    assert_eq!(
        err,
        CompileError::UnresolvedRoute {
            router_id: "triage".to_string(),
            label: "refunds".to_string(),
            destination: "refund_desk".to_string(),
        }
    );
}

#[test]
fn test_tool_node_claimed_by_two_decisions() {
    let graph = WorkflowGraph {
        entrypoint: "start".to_string(),
        nodes: vec![
            NodeDefinition::new("start", "EntryPoint", "Start"),
            NodeDefinition::new("a", "LLMNode", "A")
                .with_config("selected_tools", json!(["search"])),
            NodeDefinition::new("b", "LLMNode", "B")
                .with_config("selected_tools", json!(["search"])),
            NodeDefinition::new("ca", "ConditionalBlock", "A has tools?")
                .with_config("condition", json!("tool_detection")),
            NodeDefinition::new("cb", "ConditionalBlock", "B has tools?")
                .with_config("condition", json!("tool_detection")),
            NodeDefinition::new("tools", "ToolNode", "Tools"),
        ],
        edges: vec![
            EdgeDefinition::direct("start", "a"),
            EdgeDefinition::direct("a", "ca"),
            EdgeDefinition::branch("ca", "tools", "true"),
            EdgeDefinition::branch("ca", "b", "false"),
            EdgeDefinition::direct("b", "cb"),
            EdgeDefinition::branch("cb", "tools", "true"),
        ],
        tools: vec![inline_tool("search")],
        ..Default::default()
    };

    let err = Compiler::builder(graph).build().compile().unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Graph);
    assert!(
        err.to_string()
            .starts_with("Tool node 'tools' is claimed by both 'a' and 'b'")
    );
    assert!(matches!(
        err,
        CompileError::AmbiguousToolOwner { ref node_id, ref first_owner, ref second_owner }
            if node_id == "tools" && first_owner == "a" && second_owner == "b"
    ));
}
