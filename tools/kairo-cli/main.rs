use clap::Parser;
use kairo::compiler::CompilerOptions;
use kairo::prelude::*;
use std::fs;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Compiles an agent workflow document into program text
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the workflow document JSON file
    input: String,
    /// Where to write the program text; printed to stdout when omitted
    output: Option<String>,

    /// Capability catalog JSON used to resolve tools the document does not declare
    #[arg(short, long)]
    catalog: Option<String>,

    /// Compiler options JSON (iteration defaults, router fallback, program name)
    #[arg(short, long)]
    options: Option<String>,

    /// Also save the compiled program as a binary artifact
    #[arg(short, long)]
    artifact: Option<String>,

    /// Only check the document; nothing is generated
    #[arg(long)]
    validate_only: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    run(cli);
}

fn run(cli: Cli) {
    let total_start = Instant::now();

    // --- 1. Loading ---
    let document = fs::read_to_string(&cli.input).unwrap_or_else(|e| {
        exit_with_error(&format!("Failed to read workflow file '{}': {}", cli.input, e))
    });
    let catalog = match &cli.catalog {
        Some(path) => CapabilityCatalog::from_file(path).unwrap_or_else(|e| {
            exit_with_error(&format!("Failed to load catalog from '{}': {}", path, e))
        }),
        None => CapabilityCatalog::new(),
    };
    let options = match &cli.options {
        Some(path) => CompilerOptions::from_file(path).unwrap_or_else(|e| {
            exit_with_error(&format!("Failed to load options from '{}': {}", path, e))
        }),
        None => CompilerOptions::default(),
    };

    // --- 2. Conversion ---
    let graph = UiDocument::from_json(&document)
        .and_then(IntoWorkflow::into_workflow)
        .unwrap_or_else(|e| exit_with_error(&format!("[{}] {}", e.category(), e)));
    let compiler = Compiler::builder(graph)
        .with_catalog(catalog)
        .with_options(options)
        .build();

    if cli.validate_only {
        compiler
            .validate()
            .unwrap_or_else(|e| exit_with_error(&format!("[{}] {}", e.category(), e)));
        info!(input = %cli.input, "workflow is valid");
        return;
    }

    // --- 3. Compilation ---
    let compile_start = Instant::now();
    let program = compiler
        .compile()
        .unwrap_or_else(|e| exit_with_error(&format!("[{}] {}", e.category(), e)));
    info!(
        routines = program.routines.len(),
        capabilities = program.capabilities.len(),
        elapsed = ?compile_start.elapsed(),
        "compilation finished"
    );

    // --- 4. Output ---
    let text = program.to_string();
    match &cli.output {
        Some(path) => {
            fs::write(path, &text).unwrap_or_else(|e| {
                exit_with_error(&format!("Failed to write program to '{}': {}", path, e))
            });
            info!(output = %path, "program text written");
        }
        None => print!("{}", text),
    }

    if let Some(path) = &cli.artifact {
        CompiledWorkflow::new(program)
            .save(path)
            .unwrap_or_else(|e| exit_with_error(&format!("Failed to save artifact '{}': {}", path, e)));
        info!(artifact = %path, "artifact saved");
    }

    info!(elapsed = ?total_start.elapsed(), "done");
}

fn exit_with_error(message: &str) -> ! {
    eprintln!("\nError: {}", message);
    std::process::exit(1);
}
