//! Integration tests for Kairo
//!
//! End-to-end tests that go from an editor document to program text, artifacts and runs.
mod common;
use common::*;
use kairo::compiler::CompilerOptions;
use kairo::prelude::*;
use kairo::program::CapabilityBody;
use kairo::runtime::OfflineInvoker;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[test]
    fn test_document_compiles_to_program_text() {
        let text = kairo::compile(RESEARCH_DOCUMENT_JSON, &CapabilityCatalog::new())
            .expect("document compiles");

        for section in [
            "# --- STATE ---",
            "# --- OUTPUT SCHEMAS ---",
            "# --- CAPABILITIES ---",
            "# --- CAPABILITY GROUPS ---",
            "# --- PROCEDURES ---",
            "# --- ROUTINES ---",
            "# --- WIRING ---",
            "# --- RUN ---",
        ] {
            assert!(text.contains(section), "missing section {}", section);
        }
        // Sections appear in dependency order.
        let state = text.find("# --- STATE ---").expect("state");
        let capabilities = text.find("# --- CAPABILITIES ---").expect("capabilities");
        let routines = text.find("# --- ROUTINES ---").expect("routines");
        assert!(state < capabilities && capabilities < routines);

        assert!(text.contains("remote GET http://localhost:8000/mcp/search"));
        assert!(text.contains("placeholder -> {\"error\": \"Tool not implemented\"}"));
        assert!(text.contains("group tools_for_researcher = [web_search, notes]"));
        assert!(text.contains("run(initial_state: WorkflowState) -> WorkflowState"));
    }

    #[test]
    fn test_document_program_structure() {
        let program = kairo::compile_program(RESEARCH_DOCUMENT_JSON, &CapabilityCatalog::new())
            .expect("document compiles");

        let entry = program.routine(&program.entry).expect("entry routine");
        let RoutineBody::Entry(entry_body) = &entry.body else {
            panic!("expected an entry routine");
        };
        assert_eq!(entry_body.initial_values.len(), 1);
        assert_eq!(entry_body.initial_values[0].field, "topic");
        assert_eq!(entry_body.initial_values[0].value, json!("rust"));

        let report = program.state.field("report").expect("declared output key");
        assert!(report.descriptor.optional);

        let notes = program
            .capabilities
            .iter()
            .find(|c| c.name == "notes")
            .expect("notes capability");
        assert_eq!(notes.body, CapabilityBody::Placeholder);
        assert_eq!(notes.returns, json!({"success": "bool"}));
    }

    #[test]
    fn test_catalog_supplies_undeclared_tools() {
        let document = RESEARCH_DOCUMENT_JSON.replace(
            "\"notes\": {\"type\": \"custom\", \"description\": \"Scratch notes\"}",
            "\"unused\": {\"type\": \"custom\", \"implementation\": \"return 1\"}",
        );
        let err = kairo::compile(&document, &CapabilityCatalog::new()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Generation);

        let catalog = CapabilityCatalog::from_json(
            r#"{"tools": [{"name": "notes", "type": "custom", "implementation": "return 'ok'"}]}"#,
        )
        .expect("catalog parses");
        let program = kairo::compile_program(&document, &catalog).expect("catalog resolves notes");
        let notes = program
            .capabilities
            .iter()
            .find(|c| c.name == "notes")
            .expect("notes capability");
        assert!(matches!(notes.body, CapabilityBody::Inline { .. }));
        assert!(!program.capabilities.iter().any(|c| c.name == "unused"));
    }

    #[test]
    fn test_validate_only() {
        assert!(kairo::validate_only(RESEARCH_DOCUMENT_JSON));
        assert!(!kairo::validate_only("{ not json"));
        assert!(!kairo::validate_only(r#"{"entrypoint": "start", "nodes": []}"#));

        let dangling = RESEARCH_DOCUMENT_JSON.replace(
            "{\"from\": \"start\", \"to\": \"researcher\", \"type\": \"NormalEdge\"}",
            "{\"from\": \"start\", \"to\": \"nowhere\", \"type\": \"NormalEdge\"}",
        );
        let err = kairo::validate_document(&dangling).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Graph);
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_artifact_roundtrip() {
        let program = kairo::compile_program(RESEARCH_DOCUMENT_JSON, &CapabilityCatalog::new())
            .expect("document compiles");
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("research.bin");
        let path = path.to_str().expect("utf-8 path");

        CompiledWorkflow::new(program.clone())
            .save(path)
            .expect("artifact saves");
        let loaded = CompiledWorkflow::from_file(path).expect("artifact loads");

        assert_eq!(loaded.format_version, CompiledWorkflow::FORMAT_VERSION);
        assert_eq!(loaded.program, program);
        assert_eq!(loaded.program.to_string(), program.to_string());
        assert!(CompiledWorkflow::from_bytes(&[0xff, 0x00]).is_err());
    }

    #[test]
    fn test_options_file_feeds_the_compiler() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("options.json");
        fs::write(
            &path,
            r#"{"default_max_iterations": 12, "router_fallback": "first_option", "program_name": "triage"}"#,
        )
        .expect("options written");

        let options =
            CompilerOptions::from_file(path.to_str().expect("utf-8 path")).expect("options load");
        assert_eq!(options.default_max_iterations, 12);
        assert_eq!(options.router_fallback, RouterFallback::FirstOption);

        let program = Compiler::builder(create_router_graph())
            .with_options(options)
            .build()
            .compile()
            .expect("compiles");
        assert_eq!(program.name, "triage");
        assert!(program.to_string().contains("otherwise first-option"));

        fs::write(&path, r#"{"default_max_iterations": 0}"#).expect("options written");
        assert!(CompilerOptions::from_file(path.to_str().expect("utf-8 path")).is_err());
    }

    #[test]
    fn test_loaded_artifact_runs() {
        let program = compile_graph(create_minimal_graph());
        let bytes = CompiledWorkflow::new(program).to_bytes().expect("encodes");
        let loaded = CompiledWorkflow::from_bytes(&bytes).expect("decodes");

        let procedure =
            ScriptedProcedure::new().with_script("d1", vec![Message::answer("forty-two")]);
        let mut runtime = Runtime::builder(&loaded.program, procedure, OfflineInvoker).build();
        let outcome = runtime.run(BTreeMap::new()).expect("runs");

        let messages = outcome.state.get("messages").expect("global log");
        assert_eq!(messages[0]["content"], json!("forty-two"));
        assert_eq!(outcome.trace.path().len(), 2);
    }
}
