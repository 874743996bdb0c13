use super::builder::GraphModel;
use super::parsing::NodeKind;
use crate::error::CompileError;
use crate::workflow::{EdgeDefinition, EdgeKind};
use ahash::{AHashMap, AHashSet};
use itertools::Itertools;
use tracing::{debug, warn};

/// The two branches of a conditional block, as node ids. A missing `on_false` means terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BranchPair {
    pub on_true: String,
    pub on_false: Option<String>,
}

/// Control-flow facts recovered from the raw edge list.
#[derive(Debug, Default)]
pub(crate) struct ControlFlow {
    /// All edges after normalization, inferred tool-return edges last.
    pub edges: Vec<EdgeDefinition>,
    /// Tool-return edges synthesized by inference.
    pub inferred: Vec<EdgeDefinition>,
    /// Direct successor of entry and decision nodes; `None` is terminal.
    pub successors: AHashMap<String, Option<String>>,
    /// Conditional node -> its nearest non-conditional ancestor.
    pub conditional_parents: AHashMap<String, String>,
    pub branches: AHashMap<String, BranchPair>,
    /// ToolExec node -> owning decision node.
    pub tool_owners: AHashMap<String, String>,
    /// Decision node -> the ToolExec node it owns.
    pub owned_tools: AHashMap<String, String>,
    /// Router node -> target ids of its outgoing edges, in edge order.
    pub router_targets: AHashMap<String, Vec<String>>,
    /// (binder, worker) pairs in edge order, already de-duplicated.
    pub worker_bindings: Vec<(String, String)>,
}

impl ControlFlow {
    /// Workers bound to `binder`, in edge order.
    pub(crate) fn bound_workers(&self, binder: &str) -> Vec<&str> {
        self.worker_bindings
            .iter()
            .filter(|(b, _)| b == binder)
            .map(|(_, w)| w.as_str())
            .collect()
    }
}

/// Separates direct from branch edges, recovers conditional parents and tool owners,
/// and synthesizes the tool-return edges the author left implicit.
pub(crate) struct EdgeClassifier<'m, 'a> {
    model: &'m GraphModel<'a>,
    flow: ControlFlow,
}

impl<'m, 'a> EdgeClassifier<'m, 'a> {
    pub(crate) fn new(model: &'m GraphModel<'a>) -> Self {
        Self {
            model,
            flow: ControlFlow::default(),
        }
    }

    pub(crate) fn classify(mut self) -> Result<ControlFlow, CompileError> {
        self.normalize()?;
        self.resolve_conditionals()?;
        self.resolve_tool_owners()?;
        self.infer_tool_returns();
        self.resolve_bindings()?;
        self.resolve_successors()?;
        self.collect_router_targets();
        debug!(
            edges = self.flow.edges.len(),
            inferred = self.flow.inferred.len(),
            bindings = self.flow.worker_bindings.len(),
            "edges classified"
        );
        Ok(self.flow)
    }

    fn kind_of(&self, node_id: &str) -> Result<NodeKind, CompileError> {
        self.model
            .kind(node_id)
            .ok_or_else(|| CompileError::NodeNotFound {
                missing_node_id: node_id.to_string(),
                source_node_id: "edge list".to_string(),
            })
    }

    /// Branch labels only mean something on edges leaving a conditional block.
    fn normalize(&mut self) -> Result<(), CompileError> {
        let model = self.model;
        for edge in &model.graph().edges {
            let mut edge = edge.clone();
            if self.kind_of(&edge.from)? == NodeKind::Conditional {
                let label = edge
                    .branch_label
                    .as_deref()
                    .map(|l| l.trim().to_ascii_lowercase());
                match label.as_deref() {
                    Some("true") | Some("false") => {
                        edge.kind = EdgeKind::Branch;
                        edge.branch_label = label;
                    }
                    _ => {
                        return Err(CompileError::InvalidConditional {
                            node_id: edge.from.clone(),
                            message: format!(
                                "edge to '{}' must be labeled \"true\" or \"false\"",
                                edge.to
                            ),
                        });
                    }
                }
            } else if edge.kind == EdgeKind::Branch {
                warn!(from = %edge.from, to = %edge.to, "branch edge from a non-conditional node, treating as direct");
                edge.kind = EdgeKind::Direct;
            }
            self.flow.edges.push(edge);
        }
        Ok(())
    }

    fn resolve_conditionals(&mut self) -> Result<(), CompileError> {
        let model = self.model;
        for node in model.nodes_of(NodeKind::Conditional) {
            let incoming: Vec<&EdgeDefinition> = self
                .flow
                .edges
                .iter()
                .filter(|e| e.to == node.id)
                .collect();
            match incoming.len() {
                0 => {
                    return Err(CompileError::ConditionalWithoutParent {
                        node_id: node.id.clone(),
                    });
                }
                1 => {}
                _ => {
                    return Err(CompileError::InvalidConditional {
                        node_id: node.id.clone(),
                        message: format!(
                            "expected exactly one incoming edge, found {} (from {})",
                            incoming.len(),
                            incoming.iter().map(|e| e.from.as_str()).join(", ")
                        ),
                    });
                }
            }

            let parent = self.find_parent(&node.id)?;
            self.flow
                .conditional_parents
                .insert(node.id.clone(), parent);

            let outgoing: Vec<&EdgeDefinition> = self
                .flow
                .edges
                .iter()
                .filter(|e| e.from == node.id)
                .collect();
            let targets_for = |label: &str| -> Vec<String> {
                outgoing
                    .iter()
                    .filter(|e| e.branch_label.as_deref() == Some(label))
                    .map(|e| e.to.clone())
                    .collect()
            };
            let trues = targets_for("true");
            let falses = targets_for("false");
            if trues.len() != 1 || falses.len() > 1 {
                return Err(CompileError::InvalidConditional {
                    node_id: node.id.clone(),
                    message: format!(
                        "expected one \"true\" and at most one \"false\" branch, found {} and {}",
                        trues.len(),
                        falses.len()
                    ),
                });
            }
            for target in trues.iter().chain(falses.iter()) {
                if self.kind_of(target)? == NodeKind::Worker {
                    return Err(CompileError::InvalidConditional {
                        node_id: node.id.clone(),
                        message: format!(
                            "branch target '{}' is a worker; workers are bound as capabilities, not states",
                            target
                        ),
                    });
                }
            }
            self.flow.branches.insert(
                node.id.clone(),
                BranchPair {
                    on_true: trues[0].clone(),
                    on_false: falses.into_iter().next(),
                },
            );
        }
        Ok(())
    }

    /// Walks up through chained conditionals to the first non-conditional node.
    fn find_parent(&self, conditional_id: &str) -> Result<String, CompileError> {
        let mut visited: AHashSet<&str> = AHashSet::new();
        let mut current = conditional_id;
        loop {
            if !visited.insert(current) {
                return Err(CompileError::ConditionalWithoutParent {
                    node_id: conditional_id.to_string(),
                });
            }
            let mut sources = self
                .flow
                .edges
                .iter()
                .filter(|e| e.to == current)
                .map(|e| e.from.as_str());
            let (Some(source), None) = (sources.next(), sources.next()) else {
                return Err(CompileError::ConditionalWithoutParent {
                    node_id: conditional_id.to_string(),
                });
            };
            if self.kind_of(source)? != NodeKind::Conditional {
                return Ok(source.to_string());
            }
            current = source;
        }
    }

    /// Claims a ToolExec node for the decision reached through a `true` branch or a direct edge.
    fn resolve_tool_owners(&mut self) -> Result<(), CompileError> {
        let model = self.model;
        let mut claims: Vec<(String, String)> = Vec::new();
        for edge in &self.flow.edges {
            if self.kind_of(&edge.to)? != NodeKind::ToolExec {
                continue;
            }
            let claimant = match self.kind_of(&edge.from)? {
                NodeKind::Conditional if edge.branch_label.as_deref() == Some("true") => {
                    let parent = &self.flow.conditional_parents[&edge.from];
                    if self.kind_of(parent)? != NodeKind::Decision {
                        return Err(CompileError::InvalidConditional {
                            node_id: edge.from.clone(),
                            message: format!(
                                "tool branch to '{}' must originate from a decision node, found '{}'",
                                edge.to, parent
                            ),
                        });
                    }
                    parent.clone()
                }
                NodeKind::Decision => edge.from.clone(),
                _ => continue,
            };
            claims.push((edge.to.clone(), claimant));
        }

        for (tool_id, owner) in claims {
            match self.flow.tool_owners.get(&tool_id) {
                Some(existing) if *existing != owner => {
                    return Err(CompileError::AmbiguousToolOwner {
                        node_id: tool_id,
                        first_owner: existing.clone(),
                        second_owner: owner,
                    });
                }
                Some(_) => {}
                None => {
                    self.flow.tool_owners.insert(tool_id, owner);
                }
            }
        }

        for tool in model.nodes_of(NodeKind::ToolExec) {
            if !self.flow.tool_owners.contains_key(&tool.id) {
                return Err(CompileError::UnownedToolNode {
                    node_id: tool.id.clone(),
                });
            }
        }

        let mut per_owner: AHashMap<&str, Vec<&str>> = AHashMap::new();
        for tool in model.nodes_of(NodeKind::ToolExec) {
            let owner = self.flow.tool_owners[&tool.id].as_str();
            per_owner.entry(owner).or_default().push(tool.id.as_str());
        }
        for decision in model.nodes_of(NodeKind::Decision) {
            match per_owner.get(decision.id.as_str()).map(Vec::as_slice) {
                None => {}
                Some([single]) => {
                    self.flow
                        .owned_tools
                        .insert(decision.id.clone(), (*single).to_string());
                }
                Some(many) => {
                    return Err(CompileError::MultipleToolNodes {
                        node_id: decision.id.clone(),
                        tools: many.join(", "),
                    });
                }
            }
        }
        Ok(())
    }

    /// Adds `ToolExec -> owner` unless the author already drew it.
    fn infer_tool_returns(&mut self) {
        let model = self.model;
        for tool in model.nodes_of(NodeKind::ToolExec) {
            let owner = &self.flow.tool_owners[&tool.id];
            let exists = self
                .flow
                .edges
                .iter()
                .any(|e| e.from == tool.id && e.to == *owner);
            if exists {
                continue;
            }
            let mut edge = EdgeDefinition::direct(&tool.id, owner);
            edge.implicit = true;
            debug!(from = %tool.id, to = %owner, "inferred tool-return edge");
            self.flow.inferred.push(edge.clone());
            self.flow.edges.push(edge);
        }
    }

    /// Direct edges into a worker bind it as a capability of the source's decision loop.
    fn resolve_bindings(&mut self) -> Result<(), CompileError> {
        let mut bindings: Vec<(String, String)> = Vec::new();
        for edge in &self.flow.edges {
            if self.kind_of(&edge.to)? != NodeKind::Worker {
                continue;
            }
            let binder = match self.kind_of(&edge.from)? {
                NodeKind::Decision | NodeKind::Worker => edge.from.clone(),
                NodeKind::ToolExec => self.flow.tool_owners[&edge.from].clone(),
                NodeKind::EntryPoint => {
                    return Err(CompileError::InvalidEntrypoint {
                        node_id: edge.from.clone(),
                        message: format!(
                            "'{}' is a worker; the entrypoint must lead to a graph state",
                            edge.to
                        ),
                    });
                }
                NodeKind::Router => {
                    return Err(CompileError::InvalidRouter {
                        node_id: edge.from.clone(),
                        message: format!("route target '{}' is a worker", edge.to),
                    });
                }
                // Rejected while resolving conditionals.
                NodeKind::Conditional => continue,
            };
            bindings.push((binder, edge.to.clone()));
        }
        self.flow.worker_bindings = bindings.into_iter().unique().collect();
        Ok(())
    }

    fn resolve_successors(&mut self) -> Result<(), CompileError> {
        let model = self.model;
        for node in model.nodes() {
            match node.kind {
                NodeKind::EntryPoint | NodeKind::Decision => {}
                NodeKind::ToolExec => {
                    for edge in self.flow.edges.iter().filter(|e| e.from == node.id) {
                        let owner = &self.flow.tool_owners[&node.id];
                        if edge.to != *owner && self.kind_of(&edge.to)? != NodeKind::Worker {
                            warn!(node_id = %node.id, target = %edge.to, "tool node edge ignored; tool routines always return to their owner");
                        }
                    }
                    continue;
                }
                NodeKind::Worker => {
                    for edge in self.flow.edges.iter().filter(|e| e.from == node.id) {
                        if self.kind_of(&edge.to)? != NodeKind::Worker {
                            warn!(node_id = %node.id, target = %edge.to, "worker edge ignored; workers run as capabilities");
                        }
                    }
                    continue;
                }
                NodeKind::Router | NodeKind::Conditional => continue,
            }

            let mut targets: Vec<&str> = Vec::new();
            for edge in self.flow.edges.iter().filter(|e| e.from == node.id) {
                match self.kind_of(&edge.to)? {
                    NodeKind::Worker => {}
                    NodeKind::ToolExec if node.kind == NodeKind::Decision => {}
                    _ => targets.push(edge.to.as_str()),
                }
            }
            let targets: Vec<&str> = targets.into_iter().unique().collect();

            let successor = match (node.kind, targets.as_slice()) {
                (_, [single]) => Some((*single).to_string()),
                (NodeKind::EntryPoint, []) => {
                    return Err(CompileError::InvalidEntrypoint {
                        node_id: node.id.clone(),
                        message: "the entrypoint needs exactly one outgoing edge, found none"
                            .to_string(),
                    });
                }
                (NodeKind::EntryPoint, many) => {
                    return Err(CompileError::InvalidEntrypoint {
                        node_id: node.id.clone(),
                        message: format!(
                            "the entrypoint needs exactly one outgoing edge, found {}",
                            many.join(", ")
                        ),
                    });
                }
                (_, []) => None,
                (_, many) => {
                    return Err(CompileError::AmbiguousSuccessor {
                        node_id: node.id.clone(),
                        targets: many.join(", "),
                    });
                }
            };
            self.flow.successors.insert(node.id.clone(), successor);
        }
        Ok(())
    }

    fn collect_router_targets(&mut self) {
        let model = self.model;
        for router in model.nodes_of(NodeKind::Router) {
            let targets = self
                .flow
                .edges
                .iter()
                .filter(|e| e.from == router.id)
                .map(|e| e.to.clone())
                .unique()
                .collect();
            self.flow.router_targets.insert(router.id.clone(), targets);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parsing::{NodeParser, register_default_parsers};
    use crate::workflow::{NodeDefinition, WorkflowGraph};
    use serde_json::json;

    fn tool_loop(extra: Vec<EdgeDefinition>) -> WorkflowGraph {
        let mut edges = vec![
            EdgeDefinition::direct("start", "agent"),
            EdgeDefinition::direct("agent", "check"),
            EdgeDefinition::branch("check", "tools", "true"),
        ];
        edges.extend(extra);
        WorkflowGraph {
            entrypoint: "start".to_string(),
            nodes: vec![
                NodeDefinition::new("start", "EntryPoint", "Start"),
                NodeDefinition::new("agent", "LLMNode", "Agent")
                    .with_config("selected_tools", json!(["search"])),
                NodeDefinition::new("check", "ConditionalBlock", "Check")
                    .with_config("condition", json!("tool_detection")),
                NodeDefinition::new("tools", "ToolNode", "Tools"),
            ],
            edges,
            ..Default::default()
        }
    }

    fn classify(graph: &WorkflowGraph) -> ControlFlow {
        let mut registry: AHashMap<String, Box<dyn NodeParser>> = AHashMap::new();
        register_default_parsers(&mut registry);
        let model = GraphModel::build(graph, &registry).unwrap();
        EdgeClassifier::new(&model).classify().unwrap()
    }

    #[test]
    fn test_missing_return_edge_is_inferred() {
        let flow = classify(&tool_loop(Vec::new()));
        assert_eq!(flow.inferred.len(), 1);
        assert_eq!(flow.inferred[0].from, "tools");
        assert_eq!(flow.inferred[0].to, "agent");
        assert!(flow.inferred[0].implicit);
        assert_eq!(flow.tool_owners["tools"], "agent");
        assert_eq!(flow.conditional_parents["check"], "agent");
    }

    #[test]
    fn test_authored_return_edge_is_not_duplicated() {
        let flow = classify(&tool_loop(vec![EdgeDefinition::direct("tools", "agent")]));
        assert!(flow.inferred.is_empty());
        let returns = flow
            .edges
            .iter()
            .filter(|e| e.from == "tools" && e.to == "agent")
            .count();
        assert_eq!(returns, 1);
    }
}
