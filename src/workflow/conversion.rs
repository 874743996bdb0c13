use super::definition::WorkflowGraph;
use crate::error::CompileError;

/// A trait for document models that can be converted into a canonical `WorkflowGraph`.
///
/// This is the extension point that keeps the compiler independent of any one authoring
/// format. The bundled `ui::UiDocument` implements it for the JSON graph documents produced
/// by the visual editor; other front ends implement it on their own structs.
///
/// # Example
///
/// ```rust,no_run
/// use kairo::prelude::*;
/// use kairo::workflow::{EdgeDefinition, NodeDefinition};
/// use std::result::Result;
///
/// struct Pipeline { steps: Vec<String> }
///
/// impl IntoWorkflow for Pipeline {
///     fn into_workflow(self) -> Result<WorkflowGraph, CompileError> {
///         let mut nodes = vec![NodeDefinition::new("start", "EntryPoint", "Start")];
///         let mut edges = Vec::new();
///         let mut previous = "start".to_string();
///         for (i, step) in self.steps.iter().enumerate() {
///             let id = format!("step{}", i);
///             nodes.push(
///                 NodeDefinition::new(&id, "Decision", step)
///                     .with_config("human_prompt", serde_json::json!(step)),
///             );
///             edges.push(EdgeDefinition::direct(&previous, &id));
///             previous = id;
///         }
///         Ok(WorkflowGraph {
///             entrypoint: "start".to_string(),
///             nodes,
///             edges,
///             ..Default::default()
///         })
///     }
/// }
/// ```
pub trait IntoWorkflow {
    /// Consumes the object and converts it into a compilable workflow graph.
    fn into_workflow(self) -> Result<WorkflowGraph, CompileError>;
}

impl IntoWorkflow for WorkflowGraph {
    fn into_workflow(self) -> Result<WorkflowGraph, CompileError> {
        Ok(self)
    }
}
