use super::builder::{GraphModel, ModelNode};
use super::edges::ControlFlow;
use super::parsing::NodeKind;
use crate::data::CapabilityCatalog;
use crate::error::CompileError;
use crate::workflow::ToolDefinition;
use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use tracing::{debug, warn};

/// What a bound capability name resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum CapabilityRef {
    /// A tool, by name.
    Tool(String),
    /// A worker node, by id.
    Worker(String),
}

/// The resolved capability lists of every decision and worker node.
#[derive(Debug, Default)]
pub(crate) struct Bindings {
    pub per_node: AHashMap<String, Vec<CapabilityRef>>,
    /// Nodes that get a capability group and an iteration policy.
    pub tool_bound: AHashSet<String>,
    /// Tool-bound decision nodes without an authored tool node.
    pub synthesized: AHashSet<String>,
    /// Distinct tool definitions in first-binding order.
    pub tools: Vec<ToolDefinition>,
    /// Distinct bound workers in first-binding order.
    pub workers: Vec<String>,
}

impl Bindings {
    pub(crate) fn capabilities_of(&self, node_id: &str) -> &[CapabilityRef] {
        self.per_node.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub(crate) fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }
}

/// Unions each node's selected capabilities with the workers bound to it by edges.
pub(crate) struct CapabilityBinder<'m, 'a> {
    model: &'m GraphModel<'a>,
    flow: &'m ControlFlow,
    catalog: &'m CapabilityCatalog,
}

impl<'m, 'a> CapabilityBinder<'m, 'a> {
    pub(crate) fn new(
        model: &'m GraphModel<'a>,
        flow: &'m ControlFlow,
        catalog: &'m CapabilityCatalog,
    ) -> Self {
        Self {
            model,
            flow,
            catalog,
        }
    }

    pub(crate) fn bind(&self) -> Result<Bindings, CompileError> {
        let mut bindings = Bindings::default();

        for node in self.model.nodes() {
            let Some(agent) = node.agent() else {
                continue;
            };
            let mut refs = Vec::with_capacity(agent.selected_tools.len());
            for name in &agent.selected_tools {
                refs.push(self.resolve(node, name, &mut bindings)?);
            }
            refs.extend(
                self.flow
                    .bound_workers(&node.id)
                    .into_iter()
                    .map(|w| CapabilityRef::Worker(w.to_string())),
            );
            let refs: Vec<CapabilityRef> = refs.into_iter().unique().collect();

            for capability in &refs {
                if let CapabilityRef::Worker(worker) = capability {
                    if !bindings.workers.contains(worker) {
                        bindings.workers.push(worker.clone());
                    }
                }
            }

            let owns_tool_node = self.flow.owned_tools.contains_key(&node.id);
            if !refs.is_empty() || owns_tool_node {
                bindings.tool_bound.insert(node.id.clone());
                if node.kind == NodeKind::Decision && !owns_tool_node {
                    bindings.synthesized.insert(node.id.clone());
                }
            }
            if owns_tool_node && refs.is_empty() {
                warn!(node_id = %node.id, "decision owns a tool node but has no capabilities bound");
            }
            debug!(node_id = %node.id, capabilities = refs.len(), "capabilities bound");
            bindings.per_node.insert(node.id.clone(), refs);
        }

        self.check_worker_cycles(&bindings)?;
        Ok(bindings)
    }

    /// Document tools first, then the catalog, then worker nodes by id or label.
    fn resolve(
        &self,
        node: &ModelNode,
        name: &str,
        bindings: &mut Bindings,
    ) -> Result<CapabilityRef, CompileError> {
        let declared = self
            .model
            .graph()
            .tools
            .iter()
            .find(|t| t.name == name)
            .or_else(|| self.catalog.get(name));
        if let Some(definition) = declared {
            if bindings.tool(name).is_none() {
                bindings.tools.push(definition.clone());
            }
            return Ok(CapabilityRef::Tool(name.to_string()));
        }
        if let Some(worker) = self.model.worker_by_reference(name) {
            return Ok(CapabilityRef::Worker(worker.id.clone()));
        }
        Err(CompileError::UnresolvedCapability {
            node_id: node.id.clone(),
            capability: name.to_string(),
        })
    }

    /// A worker that can reach itself through worker capabilities would recurse forever.
    fn check_worker_cycles(&self, bindings: &Bindings) -> Result<(), CompileError> {
        let edges: AHashMap<&str, Vec<&str>> = self
            .model
            .nodes_of(NodeKind::Worker)
            .map(|w| {
                let targets = bindings
                    .capabilities_of(&w.id)
                    .iter()
                    .filter_map(|c| match c {
                        CapabilityRef::Worker(id) => Some(id.as_str()),
                        CapabilityRef::Tool(_) => None,
                    })
                    .collect();
                (w.id.as_str(), targets)
            })
            .collect();

        for worker in self.model.nodes_of(NodeKind::Worker) {
            let mut stack: Vec<&str> = edges.get(worker.id.as_str()).cloned().unwrap_or_default();
            let mut seen: AHashSet<&str> = AHashSet::new();
            while let Some(current) = stack.pop() {
                if current == worker.id {
                    return Err(CompileError::CyclicWorkerBinding {
                        node_id: worker.id.clone(),
                    });
                }
                if seen.insert(current) {
                    if let Some(next) = edges.get(current) {
                        stack.extend(next.iter().copied());
                    }
                }
            }
        }
        Ok(())
    }
}
