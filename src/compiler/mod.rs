use crate::data::CapabilityCatalog;
use crate::error::CompileError;
use crate::program::{Program, RouterFallback};
use crate::ui::UiDocument;
use crate::workflow::{DEFAULT_ITERATION_WARNING, DEFAULT_MAX_ITERATIONS, IntoWorkflow, WorkflowGraph};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::{debug, info, warn};

#[cfg(feature = "debug-tools")]
use crate::program::render_symbol_table;

mod assembler;
mod binding;
mod builder;
mod edges;
pub mod parsing;
mod routines;
mod routing;
mod schema;
pub mod symbols;

use assembler::ProgramAssembler;
use binding::CapabilityBinder;
use builder::GraphModel;
use edges::EdgeClassifier;
use parsing::*;
use routines::GenerationContext;
use routing::RoutingTableBuilder;
use schema::StateSchemaGenerator;
use symbols::SymbolTable;

pub use schema::{COUNT_FIELD, MESSAGES_FIELD, ROUTING_REASON_FIELD};

/// Tunables that apply to the whole compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Cap for tool-bound nodes that do not set `max_tool_iterations`.
    pub default_max_iterations: u32,
    /// Warning text for tool-bound nodes that do not set `iteration_warning_message`.
    pub iteration_warning: String,
    pub router_fallback: RouterFallback,
    pub program_name: String,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            iteration_warning: DEFAULT_ITERATION_WARNING.to_string(),
            router_fallback: RouterFallback::default(),
            program_name: "workflow".to_string(),
        }
    }
}

impl CompilerOptions {
    /// Load options from a JSON file. Missing keys keep their defaults.
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let json = fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&json)?;
        if options.default_max_iterations == 0 {
            return Err("default_max_iterations must be positive".into());
        }
        Ok(options)
    }
}

pub struct Compiler {
    graph: WorkflowGraph,
    catalog: CapabilityCatalog,
    registry: AHashMap<String, Box<dyn NodeParser>>,
    options: CompilerOptions,
}

pub struct CompilerBuilder {
    graph: WorkflowGraph,
    catalog: CapabilityCatalog,
    registry: AHashMap<String, Box<dyn NodeParser>>,
    options: CompilerOptions,
}

impl CompilerBuilder {
    pub fn new(graph: WorkflowGraph) -> Self {
        let mut registry: AHashMap<String, Box<dyn NodeParser>> = AHashMap::new();
        register_default_parsers(&mut registry);
        Self {
            graph,
            catalog: CapabilityCatalog::default(),
            registry,
            options: CompilerOptions::default(),
        }
    }

    pub fn with_catalog(mut self, catalog: CapabilityCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Lets documents use their own name for one of the built-in node types.
    pub fn with_type_mapping(mut self, user_type_name: &str, kairo_type_name: &str) -> Self {
        match create_parser_by_name(kairo_type_name) {
            Some(parser) => {
                self.registry.insert(user_type_name.to_string(), parser);
            }
            None => {
                warn!(user_type = user_type_name, target = kairo_type_name, "type mapping targets an unknown node type, ignored");
            }
        }
        self
    }

    pub fn with_custom_parser(mut self, parser: Box<dyn NodeParser>) -> Self {
        self.registry.insert(parser.node_type().to_string(), parser);
        self
    }

    pub fn with_options(mut self, options: CompilerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_default_max_iterations(mut self, max_iterations: u32) -> Self {
        if max_iterations == 0 {
            warn!("a zero iteration cap is not allowed, keeping the current default");
        } else {
            self.options.default_max_iterations = max_iterations;
        }
        self
    }

    pub fn with_warning_message(mut self, message: &str) -> Self {
        self.options.iteration_warning = message.to_string();
        self
    }

    pub fn with_router_fallback(mut self, fallback: RouterFallback) -> Self {
        self.options.router_fallback = fallback;
        self
    }

    pub fn with_program_name(mut self, name: &str) -> Self {
        self.options.program_name = name.to_string();
        self
    }

    pub fn build(self) -> Compiler {
        Compiler {
            graph: self.graph,
            catalog: self.catalog,
            registry: self.registry,
            options: self.options,
        }
    }
}

impl Compiler {
    pub fn builder(graph: WorkflowGraph) -> CompilerBuilder {
        CompilerBuilder::new(graph)
    }

    /// Runs the full pipeline. Either every stage succeeds and a program is returned,
    /// or the first failure is returned and nothing is produced.
    pub fn compile(&self) -> Result<Program, CompileError> {
        info!(
            entrypoint = %self.graph.entrypoint,
            nodes = self.graph.nodes.len(),
            edges = self.graph.edges.len(),
            "compiling workflow"
        );

        // 1. Typed, validated model of the document
        let model = GraphModel::build(&self.graph, &self.registry)?;
        for node_id in model.isolated_nodes() {
            warn!(node_id = %node_id, "node has no edges and can never run");
        }

        // 2. Control flow: branches, tool owners, inferred return edges, successors
        let flow = EdgeClassifier::new(&model).classify()?;

        // 3. Capability lists per decision/worker node
        let bindings = CapabilityBinder::new(&model, &flow, &self.catalog).bind()?;

        // 4. Every generated name, claimed in document order
        let symbols = SymbolTable::build(
            &model,
            &bindings.tool_bound,
            &bindings.synthesized,
            &bindings.tool_names(),
        );

        // 5. Router and conditional tables
        let routing = RoutingTableBuilder::new(&model, &flow).build()?;

        // 6. Shared-state record
        let state = StateSchemaGenerator::new(&model, &bindings, &symbols).generate()?;

        // 7. Routines and assembly
        let ctx = GenerationContext {
            model: &model,
            flow: &flow,
            bindings: &bindings,
            symbols: &symbols,
            routing: &routing,
            state: &state,
            options: &self.options,
        };
        let program = ProgramAssembler::new(&ctx).assemble(&self.options.program_name)?;

        #[cfg(feature = "debug-tools")]
        {
            self.write_debug_file("tmp/program.txt", &program.to_string())?;
            self.write_debug_file("tmp/symbols.txt", &render_symbol_table(&program))?;
        }

        info!(
            routines = program.routines.len(),
            capabilities = program.capabilities.len(),
            fields = program.state.fields.len(),
            "workflow compiled"
        );
        Ok(program)
    }

    /// Structural check only: builds and validates the graph model without generating anything.
    pub fn validate(&self) -> Result<(), CompileError> {
        let model = GraphModel::build(&self.graph, &self.registry)?;
        EdgeClassifier::new(&model).classify()?;
        debug!(entrypoint = %self.graph.entrypoint, "document is structurally valid");
        Ok(())
    }

    #[cfg(feature = "debug-tools")]
    fn write_debug_file(&self, path: &str, content: &str) -> Result<(), CompileError> {
        let generation_error = |e: std::io::Error| CompileError::Generation {
            fragment: path.to_string(),
            message: format!("failed to write debug file: {}", e),
        };
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent).map_err(generation_error)?;
        }
        fs::write(path, content).map_err(generation_error)
    }
}

/// Compiles a JSON document against a catalog and returns the program text.
pub fn compile(document: &str, catalog: &CapabilityCatalog) -> Result<String, CompileError> {
    compile_program(document, catalog).map(|program| program.to_string())
}

/// Compiles a JSON document against a catalog and returns the typed program.
pub fn compile_program(
    document: &str,
    catalog: &CapabilityCatalog,
) -> Result<Program, CompileError> {
    let graph = UiDocument::from_json(document)?.into_workflow()?;
    Compiler::builder(graph)
        .with_catalog(catalog.clone())
        .build()
        .compile()
}

/// Checks a JSON document for structural and graph-level defects without generating code.
pub fn validate_document(document: &str) -> Result<(), CompileError> {
    let graph = UiDocument::from_json(document)?.into_workflow()?;
    Compiler::builder(graph).build().validate()
}

/// `true` if the document passes `validate_document`.
pub fn validate_only(document: &str) -> bool {
    match validate_document(document) {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "validation failed");
            false
        }
    }
}
