use super::builder::GraphModel;
use super::parsing::NodeKind;
use ahash::{AHashMap, AHashSet};

/// Names the rendered program already uses for itself.
const RESERVED: &[&str] = &["run", "entry", "state", "terminal", "workflowstate", "node"];

/// Turns an arbitrary label into a lowercase identifier of `[a-z0-9_]`.
///
/// Runs of invalid characters collapse into one underscore, leading and trailing
/// underscores are dropped, and a leading digit gets an `n_` prefix.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        return "node".to_string();
    }
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        format!("n_{}", trimmed)
    } else {
        trimmed.to_string()
    }
}

/// Hands out collision-free identifiers. Claims are first-come: the first claimant of a
/// base name gets it verbatim, later ones get `_1`, `_2`, ...
#[derive(Debug, Default)]
pub struct IdentifierResolver {
    taken: AHashSet<String>,
}

impl IdentifierResolver {
    pub fn new() -> Self {
        let mut resolver = Self::default();
        for word in RESERVED {
            resolver.taken.insert((*word).to_string());
        }
        resolver
    }

    pub fn claim(&mut self, raw: &str) -> String {
        let base = sanitize_identifier(raw);
        if self.taken.insert(base.clone()) {
            return base;
        }
        let mut suffix = 1usize;
        loop {
            let candidate = format!("{}_{}", base, suffix);
            if self.taken.insert(candidate.clone()) {
                return candidate;
            }
            suffix += 1;
        }
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.taken.contains(name)
    }
}

/// Every generated name of one compilation, keyed by node id.
///
/// Symbols are claimed in document order, so recompiling the same input yields the same table.
#[derive(Debug, Default)]
pub(crate) struct SymbolTable {
    keys: AHashMap<String, String>,
    routines: AHashMap<String, String>,
    procedures: AHashMap<String, String>,
    groups: AHashMap<String, String>,
    output_schemas: AHashMap<String, String>,
    synthesized_tools: AHashMap<String, String>,
    workers: AHashMap<String, String>,
    capabilities: AHashMap<String, String>,
}

impl SymbolTable {
    /// Claims every name the program will need.
    ///
    /// `tool_bound` lists the nodes that get a capability group; `synthesized` lists the
    /// decision nodes whose tool routine is generated rather than authored; `tools` lists
    /// the distinct tool names in first-binding order.
    pub(crate) fn build(
        model: &GraphModel,
        tool_bound: &AHashSet<String>,
        synthesized: &AHashSet<String>,
        tools: &[String],
    ) -> Self {
        let mut table = SymbolTable::default();

        // Node keys live in their own namespace: they are only ever used as infixes.
        let mut key_resolver = IdentifierResolver::default();
        for node in model.nodes() {
            table
                .keys
                .insert(node.id.clone(), key_resolver.claim(&node.id));
        }

        let mut resolver = IdentifierResolver::new();
        for node in model.nodes() {
            let key = table.keys[&node.id].clone();
            let suffix = match node.kind {
                NodeKind::EntryPoint => Some("entry"),
                NodeKind::Decision => Some("node"),
                NodeKind::Router => Some("router"),
                NodeKind::ToolExec => Some("tools"),
                NodeKind::Conditional => Some("branch"),
                NodeKind::Worker => None,
            };
            match suffix {
                Some(suffix) => {
                    let raw = if sanitize_identifier(&node.label) == sanitize_identifier(&node.id) {
                        format!("{}_{}", node.id, suffix)
                    } else {
                        format!("{}_{}_{}", node.label, node.id, suffix)
                    };
                    table.routines.insert(node.id.clone(), resolver.claim(&raw));
                }
                None => {
                    let raw = format!("worker_{}_{}", node.label, node.id);
                    table.workers.insert(node.id.clone(), resolver.claim(&raw));
                }
            }

            if matches!(
                node.kind,
                NodeKind::Decision | NodeKind::Router | NodeKind::Worker
            ) {
                let symbol = resolver.claim(&format!("model_{}", key));
                table.procedures.insert(node.id.clone(), symbol);
            }
            if tool_bound.contains(&node.id) {
                let symbol = resolver.claim(&format!("tools_for_{}", key));
                table.groups.insert(node.id.clone(), symbol);
            }
            if model.has_output_schema(&node.id) {
                let symbol = resolver.claim(&format!("{}_output", key));
                table.output_schemas.insert(node.id.clone(), symbol);
            }
            if synthesized.contains(&node.id) {
                let symbol = resolver.claim(&format!("{}_tools", key));
                table.synthesized_tools.insert(node.id.clone(), symbol);
            }
        }

        for tool in tools {
            table.capabilities.insert(tool.clone(), resolver.claim(tool));
        }
        table
    }

    /// The per-node infix used for namespaced state fields.
    pub(crate) fn key<'s>(&'s self, node_id: &'s str) -> &'s str {
        self.keys.get(node_id).map(String::as_str).unwrap_or(node_id)
    }

    /// The routine generated for a node. Workers have none.
    pub(crate) fn routine(&self, node_id: &str) -> Option<&str> {
        self.routines.get(node_id).map(String::as_str)
    }

    pub(crate) fn procedure(&self, node_id: &str) -> Option<&str> {
        self.procedures.get(node_id).map(String::as_str)
    }

    pub(crate) fn group(&self, node_id: &str) -> Option<&str> {
        self.groups.get(node_id).map(String::as_str)
    }

    pub(crate) fn output_schema(&self, node_id: &str) -> Option<&str> {
        self.output_schemas.get(node_id).map(String::as_str)
    }

    pub(crate) fn synthesized_tools(&self, node_id: &str) -> Option<&str> {
        self.synthesized_tools.get(node_id).map(String::as_str)
    }

    pub(crate) fn worker(&self, node_id: &str) -> Option<&str> {
        self.workers.get(node_id).map(String::as_str)
    }

    pub(crate) fn tool(&self, name: &str) -> Option<&str> {
        self.capabilities.get(name).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("Research Agent"), "research_agent");
        assert_eq!(sanitize_identifier("  --Plan!!  step--"), "plan_step");
        assert_eq!(sanitize_identifier("42 answers"), "n_42_answers");
        assert_eq!(sanitize_identifier("???"), "node");
        assert_eq!(sanitize_identifier("Überblick"), "berblick");
    }

    #[test]
    fn test_resolver_suffixes_collisions() {
        let mut resolver = IdentifierResolver::new();
        assert_eq!(resolver.claim("Search"), "search");
        assert_eq!(resolver.claim("search!"), "search_1");
        assert_eq!(resolver.claim("SEARCH"), "search_2");
        assert!(resolver.is_taken("search_1"));
    }

    #[test]
    fn test_resolver_avoids_reserved_words() {
        let mut resolver = IdentifierResolver::new();
        assert_eq!(resolver.claim("run"), "run_1");
        assert_eq!(resolver.claim("State"), "state_1");
    }

    #[test]
    fn test_suffixed_name_cannot_be_stolen() {
        let mut resolver = IdentifierResolver::new();
        assert_eq!(resolver.claim("a_1"), "a_1");
        assert_eq!(resolver.claim("a"), "a");
        assert_eq!(resolver.claim("a"), "a_2");
    }

    #[test]
    fn test_key_falls_back_to_the_node_id() {
        let mut table = SymbolTable::default();
        table.keys.insert("Research Agent".to_string(), "research_agent".to_string());
        assert_eq!(table.key("Research Agent"), "research_agent");

        let unknown = String::from("ghost");
        assert_eq!(table.key(&unknown), "ghost");
    }
}
