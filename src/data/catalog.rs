use crate::error::CompileError;
use crate::ui::UiTools;
use crate::workflow::ToolDefinition;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;

/// Capability definitions supplied by the surrounding configuration layer, keyed by name.
///
/// Names declared in a document's own `tools` section take precedence over catalog entries.
#[derive(Debug, Clone, Default)]
pub struct CapabilityCatalog {
    entries: BTreeMap<String, ToolDefinition>,
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, definition: ToolDefinition) -> Self {
        self.insert(definition);
        self
    }

    pub fn insert(&mut self, definition: ToolDefinition) {
        self.entries.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Parses a catalog given as a name-keyed object, a list of named entries, or either of
    /// those wrapped in `{"tools": ...}`.
    pub fn from_json(json: &str) -> Result<Self, CompileError> {
        let mut value: Value =
            serde_json::from_str(json).map_err(|e| CompileError::JsonParseError(e.to_string()))?;
        if let Some(inner) = value.get_mut("tools") {
            value = inner.take();
        }
        let tools: UiTools =
            serde_json::from_value(value).map_err(|e| CompileError::MalformedElement {
                element: "capability catalog".to_string(),
                message: e.to_string(),
            })?;

        let mut catalog = Self::new();
        match tools {
            UiTools::Map(map) => {
                for (name, tool) in map {
                    catalog.insert(tool.into_definition(&name));
                }
            }
            UiTools::List(list) => {
                for tool in list {
                    let name = tool.name.clone().ok_or_else(|| CompileError::MalformedElement {
                        element: "capability catalog".to_string(),
                        message: "catalog entries given as a list need a 'name'".to_string(),
                    })?;
                    catalog.insert(tool.into_definition(&name));
                }
            }
        }
        Ok(catalog)
    }

    /// Load a catalog from a JSON file.
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(Self::from_json(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::ToolKind;

    #[test]
    fn test_catalog_accepts_wrapped_lists() {
        let catalog = CapabilityCatalog::from_json(
            r#"{"tools": [
                {"name": "search", "type": "mcp", "mcp_server": "http://h:1", "mcp_method": "GET /mcp/search"},
                {"name": "sum", "type": "custom", "implementation": "def sum(a, b):\n    return a + b"}
            ]}"#,
        )
        .expect("catalog");
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("search").map(|t| t.kind), Some(ToolKind::Remote));
        assert_eq!(catalog.get("sum").map(|t| t.kind), Some(ToolKind::Inline));
    }
}
