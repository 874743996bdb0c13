//! Prelude module for convenient imports
//!
//! Re-exports the types most callers need to load, compile and run a workflow.
//!
//! # Example
//!
//! ```rust,no_run
//! use kairo::prelude::*;
//!
//! # fn run_example() -> Result<()> {
//! let document = std::fs::read_to_string("path/to/workflow.json")?;
//! let graph = UiDocument::from_json(&document)?.into_workflow()?;
//! let program = Compiler::builder(graph).build().compile()?;
//!
//! CompiledWorkflow::new(program).save("path/to/workflow.bin")?;
//! # Ok(())
//! # }
//! ```

// Compilation
pub use crate::compiler::{Compiler, CompilerBuilder, CompilerOptions};

// Program and runtime
pub use crate::program::{Program, Routine, RoutineBody, RouterFallback, Target};
pub use crate::runtime::{
    CapabilityInvoker, DecisionProcedure, Message, RunOutcome, Runtime, RunTrace,
};

// Documents and workflow model
pub use crate::data::CapabilityCatalog;
pub use crate::ui::UiDocument;
pub use crate::workflow::{CompiledWorkflow, IntoWorkflow, WorkflowGraph};

// Error types
pub use crate::error::{CompileError, ErrorCategory, RuntimeError};

// Trace formatting
pub use crate::trace::TraceFormatter;

// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;
