//! # Kairo - Agent Workflow Compiler
//!
//! **Kairo** compiles visual agent workflows (graphs of decision, router, worker, tool and
//! conditional nodes) into executable programs. A compiled program is a typed state machine:
//! a shared-state schema with merge policies, one routine per node, capability groups for
//! tool-bound nodes and the routing tables that connect them.
//!
//! ## Core Workflow
//!
//! The compiler is format-agnostic. It works on a canonical [`workflow::WorkflowGraph`]:
//!
//! 1.  **Load Your Document**: Parse the visual editor's JSON with [`ui::UiDocument`], or bring your
//!     own format and implement [`workflow::IntoWorkflow`] for it.
//! 2.  **Compile**: Use [`compiler::Compiler::builder`] to configure a compiler (capability catalog,
//!     iteration defaults, router fallback) and call `compile()` to get a [`program::Program`].
//! 3.  **Emit or Store**: `Program` renders as program text through `Display`; wrap it in a
//!     [`workflow::CompiledWorkflow`] to save a binary artifact.
//! 4.  **Run**: Drive the program with [`runtime::Runtime`], supplying a
//!     [`runtime::DecisionProcedure`] and a [`runtime::CapabilityInvoker`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kairo::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let document = std::fs::read_to_string("workflow.json")?;
//!     let catalog = CapabilityCatalog::from_file("tools.json")?;
//!
//!     let graph = UiDocument::from_json(&document)?.into_workflow()?;
//!     let program = Compiler::builder(graph)
//!         .with_catalog(catalog)
//!         .with_default_max_iterations(10)
//!         .build()
//!         .compile()?;
//!
//!     println!("{}", program);
//!     Ok(())
//! }
//! ```

pub mod compiler;
pub mod condition;
pub mod data;
pub mod error;
pub mod prelude;
pub mod program;
pub mod runtime;
pub mod trace;
pub mod ui;
pub mod workflow;

pub use compiler::{compile, compile_program, validate_document, validate_only};
