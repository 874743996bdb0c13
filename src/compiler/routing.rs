use super::builder::GraphModel;
use super::edges::{BranchPair, ControlFlow};
use super::parsing::{NodeConfig, NodeKind, RouteChoice};
use crate::error::CompileError;
use ahash::{AHashMap, AHashSet};
use tracing::debug;

/// Destinations that name the terminal state instead of a node.
const TERMINAL_NAMES: &[&str] = &["END", "__end__", "TERMINAL"];

/// One resolved router choice. `node_id` is `None` for a terminal route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedRoute {
    pub label: String,
    pub description: Option<String>,
    pub node_id: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct RoutingTables {
    pub routers: AHashMap<String, Vec<ResolvedRoute>>,
    pub conditionals: AHashMap<String, BranchPair>,
}

/// Builds label -> destination tables for routers and true/false tables for conditionals.
pub(crate) struct RoutingTableBuilder<'m, 'a> {
    model: &'m GraphModel<'a>,
    flow: &'m ControlFlow,
}

impl<'m, 'a> RoutingTableBuilder<'m, 'a> {
    pub(crate) fn new(model: &'m GraphModel<'a>, flow: &'m ControlFlow) -> Self {
        Self { model, flow }
    }

    pub(crate) fn build(&self) -> Result<RoutingTables, CompileError> {
        let mut tables = RoutingTables::default();
        for router in self.model.nodes_of(NodeKind::Router) {
            let NodeConfig::Router(config) = &router.config else {
                continue;
            };
            let routes = self.router_table(&router.id, &config.choices)?;
            debug!(node_id = %router.id, routes = routes.len(), "router table built");
            tables.routers.insert(router.id.clone(), routes);
        }
        for conditional in self.model.nodes_of(NodeKind::Conditional) {
            if let Some(pair) = self.flow.branches.get(&conditional.id) {
                tables.conditionals.insert(conditional.id.clone(), pair.clone());
            }
        }
        Ok(tables)
    }

    fn router_table(
        &self,
        router_id: &str,
        configured: &[RouteChoice],
    ) -> Result<Vec<ResolvedRoute>, CompileError> {
        let edge_targets = self
            .flow
            .router_targets
            .get(router_id)
            .cloned()
            .unwrap_or_default();

        // Without configured choices every outgoing edge becomes a choice labeled by its target.
        let choices: Vec<RouteChoice> = if configured.is_empty() {
            edge_targets
                .iter()
                .map(|target| {
                    let label = self
                        .model
                        .node(target)
                        .map(|n| n.label.clone())
                        .unwrap_or_else(|| target.clone());
                    RouteChoice {
                        label,
                        destination: target.clone(),
                        description: None,
                    }
                })
                .collect()
        } else {
            configured.to_vec()
        };

        if choices.is_empty() {
            return Err(CompileError::InvalidRouter {
                node_id: router_id.to_string(),
                message: "a router needs at least one choice or outgoing edge".to_string(),
            });
        }

        let mut labels: AHashSet<&str> = AHashSet::new();
        let mut routes = Vec::with_capacity(choices.len());
        for choice in &choices {
            if !labels.insert(choice.label.as_str()) {
                return Err(CompileError::InvalidRouter {
                    node_id: router_id.to_string(),
                    message: format!("label '{}' is used by more than one choice", choice.label),
                });
            }
            let node_id = self.resolve_destination(router_id, choice)?;
            routes.push(ResolvedRoute {
                label: choice.label.clone(),
                description: choice.description.clone(),
                node_id,
            });
        }

        // Every drawn edge must correspond to a choice, or the router could never take it.
        for target in &edge_targets {
            if !routes.iter().any(|r| r.node_id.as_deref() == Some(target.as_str())) {
                return Err(CompileError::UnmappedRouteTarget {
                    router_id: router_id.to_string(),
                    target_id: target.clone(),
                });
            }
        }
        Ok(routes)
    }

    fn resolve_destination(
        &self,
        router_id: &str,
        choice: &RouteChoice,
    ) -> Result<Option<String>, CompileError> {
        if TERMINAL_NAMES.contains(&choice.destination.as_str()) {
            return Ok(None);
        }
        let node = self
            .model
            .node_by_reference(&choice.destination)
            .ok_or_else(|| CompileError::UnresolvedRoute {
                router_id: router_id.to_string(),
                label: choice.label.clone(),
                destination: choice.destination.clone(),
            })?;
        match node.kind {
            NodeKind::Worker => Err(CompileError::InvalidRouter {
                node_id: router_id.to_string(),
                message: format!(
                    "choice '{}' leads to worker '{}'; workers are bound as capabilities",
                    choice.label, node.id
                ),
            }),
            NodeKind::EntryPoint => Err(CompileError::InvalidRouter {
                node_id: router_id.to_string(),
                message: format!("choice '{}' leads back to the entrypoint", choice.label),
            }),
            _ => Ok(Some(node.id.clone())),
        }
    }
}
