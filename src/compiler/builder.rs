use super::parsing::{AgentConfig, NodeConfig, NodeKind, NodeParser};
use crate::error::CompileError;
use crate::workflow::WorkflowGraph;
use ahash::AHashMap;
use tracing::debug;

/// A validated node with its typed configuration.
#[derive(Debug, Clone)]
pub(crate) struct ModelNode {
    pub id: String,
    pub label: String,
    pub kind: NodeKind,
    pub config: NodeConfig,
}

impl ModelNode {
    /// Decision and worker nodes share one configuration shape.
    pub(crate) fn agent(&self) -> Option<&AgentConfig> {
        match &self.config {
            NodeConfig::Decision(agent) | NodeConfig::Worker(agent) => Some(agent),
            _ => None,
        }
    }
}

/// The typed, validated view of a `WorkflowGraph` every later stage works on.
pub(crate) struct GraphModel<'a> {
    graph: &'a WorkflowGraph,
    nodes: Vec<ModelNode>,
    index: AHashMap<String, usize>,
    out_degrees: AHashMap<String, usize>,
    in_degrees: AHashMap<String, usize>,
}

impl<'a> GraphModel<'a> {
    /// Builds the model, failing on the first structural or graph-level defect.
    pub(crate) fn build(
        graph: &'a WorkflowGraph,
        registry: &AHashMap<String, Box<dyn NodeParser>>,
    ) -> Result<Self, CompileError> {
        if graph.entrypoint.trim().is_empty() {
            return Err(CompileError::MissingKey {
                key: "entrypoint".to_string(),
            });
        }
        if graph.nodes.is_empty() {
            return Err(CompileError::EmptyNodeList);
        }

        let mut nodes = Vec::with_capacity(graph.nodes.len());
        let mut index = AHashMap::new();
        for definition in &graph.nodes {
            if definition.id.trim().is_empty() {
                return Err(CompileError::MalformedElement {
                    element: "node".to_string(),
                    message: "every node needs a non-empty id".to_string(),
                });
            }
            if index.contains_key(&definition.id) {
                return Err(CompileError::DuplicateNodeId {
                    node_id: definition.id.clone(),
                });
            }
            let parser = registry.get(&definition.node_type).ok_or_else(|| {
                CompileError::UnsupportedNodeType {
                    node_id: definition.id.clone(),
                    type_name: definition.node_type.clone(),
                }
            })?;
            let config = parser.parse(definition)?;
            index.insert(definition.id.clone(), nodes.len());
            nodes.push(ModelNode {
                id: definition.id.clone(),
                label: definition.label.clone(),
                kind: config.kind(),
                config,
            });
        }

        let mut model = Self {
            graph,
            nodes,
            index,
            out_degrees: AHashMap::new(),
            in_degrees: AHashMap::new(),
        };
        model.validate_entrypoint()?;

        for edge in &graph.edges {
            model.find_node(&edge.from, &edge.to)?;
            model.find_node(&edge.to, &edge.from)?;
            *model.out_degrees.entry(edge.from.clone()).or_default() += 1;
            *model.in_degrees.entry(edge.to.clone()).or_default() += 1;
        }

        debug!(
            nodes = model.nodes.len(),
            edges = graph.edges.len(),
            "graph model built"
        );
        Ok(model)
    }

    fn validate_entrypoint(&self) -> Result<(), CompileError> {
        let entry_nodes: Vec<&ModelNode> = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::EntryPoint)
            .collect();
        let entry = self.find_node(&self.graph.entrypoint, "entrypoint")?;
        if entry.kind != NodeKind::EntryPoint {
            return Err(CompileError::InvalidEntrypoint {
                node_id: entry.id.clone(),
                message: "the entrypoint must reference an EntryPoint node".to_string(),
            });
        }
        if entry_nodes.len() > 1 {
            let others = entry_nodes
                .iter()
                .filter(|n| n.id != entry.id)
                .map(|n| n.id.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(CompileError::InvalidEntrypoint {
                node_id: entry.id.clone(),
                message: format!("exactly one EntryPoint node is allowed, also found: {}", others),
            });
        }
        Ok(())
    }

    pub(crate) fn find_node(
        &self,
        node_id: &str,
        source_node_id: &str,
    ) -> Result<&ModelNode, CompileError> {
        self.node(node_id).ok_or_else(|| CompileError::NodeNotFound {
            missing_node_id: node_id.to_string(),
            source_node_id: source_node_id.to_string(),
        })
    }

    pub(crate) fn node(&self, node_id: &str) -> Option<&ModelNode> {
        self.index.get(node_id).map(|&i| &self.nodes[i])
    }

    pub(crate) fn kind(&self, node_id: &str) -> Option<NodeKind> {
        self.node(node_id).map(|n| n.kind)
    }

    /// Nodes in document order.
    pub(crate) fn nodes(&self) -> &[ModelNode] {
        &self.nodes
    }

    pub(crate) fn nodes_of(&self, kind: NodeKind) -> impl Iterator<Item = &ModelNode> {
        self.nodes.iter().filter(move |n| n.kind == kind)
    }

    pub(crate) fn entry(&self) -> &ModelNode {
        // validate_entrypoint guarantees presence
        &self.nodes[self.index[&self.graph.entrypoint]]
    }

    pub(crate) fn graph(&self) -> &'a WorkflowGraph {
        self.graph
    }

    pub(crate) fn has_output_schema(&self, node_id: &str) -> bool {
        self.node(node_id)
            .and_then(ModelNode::agent)
            .is_some_and(|agent| !agent.output_fields.is_empty())
    }

    /// Resolves a worker reference by id first, then by unique label.
    pub(crate) fn worker_by_reference(&self, reference: &str) -> Option<&ModelNode> {
        if let Some(node) = self.node(reference) {
            return (node.kind == NodeKind::Worker).then_some(node);
        }
        let mut matches = self
            .nodes_of(NodeKind::Worker)
            .filter(|n| n.label == reference);
        let first = matches.next()?;
        matches.next().is_none().then_some(first)
    }

    /// Resolves a node reference by id first, then by unique label.
    pub(crate) fn node_by_reference(&self, reference: &str) -> Option<&ModelNode> {
        if let Some(node) = self.node(reference) {
            return Some(node);
        }
        let mut matches = self.nodes.iter().filter(|n| n.label == reference);
        let first = matches.next()?;
        matches.next().is_none().then_some(first)
    }

    /// Number of edges leaving a node.
    fn out_degree(&self, node_id: &str) -> usize {
        self.out_degrees.get(node_id).copied().unwrap_or(0)
    }

    /// Number of edges entering a node.
    fn in_degree(&self, node_id: &str) -> usize {
        self.in_degrees.get(node_id).copied().unwrap_or(0)
    }

    /// Node ids declared but never connected; they still compile but can never run.
    pub(crate) fn isolated_nodes(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.kind != NodeKind::EntryPoint && n.kind != NodeKind::Worker)
            .filter(|n| self.out_degree(&n.id) == 0 && self.in_degree(&n.id) == 0)
            .map(|n| n.id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parsing::register_default_parsers;
    use crate::workflow::{EdgeDefinition, NodeDefinition};

    fn registry() -> AHashMap<String, Box<dyn NodeParser>> {
        let mut registry: AHashMap<String, Box<dyn NodeParser>> = AHashMap::new();
        register_default_parsers(&mut registry);
        registry
    }

    #[test]
    fn test_isolated_nodes_ignore_entry_and_workers() {
        let graph = WorkflowGraph {
            entrypoint: "start".to_string(),
            nodes: vec![
                NodeDefinition::new("start", "EntryPoint", "Start"),
                NodeDefinition::new("writer", "LLMNode", "Writer"),
                NodeDefinition::new("orphan", "LLMNode", "Orphan"),
                NodeDefinition::new("helper", "WorkerNode", "Helper"),
            ],
            edges: vec![EdgeDefinition::direct("start", "writer")],
            ..Default::default()
        };
        let registry = registry();
        let model = GraphModel::build(&graph, &registry).unwrap();
        assert_eq!(model.isolated_nodes(), vec!["orphan"]);
    }

    #[test]
    fn test_dangling_edge_names_both_ends() {
        let graph = WorkflowGraph {
            entrypoint: "start".to_string(),
            nodes: vec![NodeDefinition::new("start", "EntryPoint", "Start")],
            edges: vec![EdgeDefinition::direct("start", "nowhere")],
            ..Default::default()
        };
        let registry = registry();
        let err = GraphModel::build(&graph, &registry).err().unwrap();
        assert_eq!(
            err,
            CompileError::NodeNotFound {
                missing_node_id: "nowhere".to_string(),
                source_node_id: "start".to_string(),
            }
        );
    }
}
