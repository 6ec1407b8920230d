//! Tool catalog: the tools discovered from the connected server.
//!
//! Built once per successful handshake and never mutated afterwards. The
//! connection manager swaps in a whole new catalog on reconnect, so readers
//! holding an `Arc<ToolCatalog>` never see a half-updated set.

use std::collections::HashMap;

use super::types::Tool;

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// Ordered set of tools, indexed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    /// Tools in the order the server reported them.
    tools: Vec<Tool>,
    /// `tool_name → index into tools`.
    index: HashMap<String, usize>,
}

impl ToolCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a server's `tools/list` response.
    ///
    /// Names must be unique; a repeated name keeps its first definition.
    pub fn from_tools(tools: Vec<Tool>) -> Self {
        let mut catalog = Self {
            tools: Vec::with_capacity(tools.len()),
            index: HashMap::with_capacity(tools.len()),
        };

        for tool in tools {
            if catalog.index.contains_key(&tool.name) {
                tracing::warn!(tool = %tool.name, "duplicate tool name in catalog, keeping first");
                continue;
            }
            catalog.index.insert(tool.name.clone(), catalog.tools.len());
            catalog.tools.push(tool);
        }

        catalog
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.index.get(name).and_then(|&i| self.tools.get(i))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All tools, in discovery order.
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tool> {
        self.tools.iter()
    }

    /// Tool names, in discovery order.
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Export the catalog in OpenAI function-calling format.
    ///
    /// For callers that feed the tool list to a text-generation provider.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description.clone().unwrap_or_default(),
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect()
    }
}

impl<'a> IntoIterator for &'a ToolCatalog {
    type Item = &'a Tool;
    type IntoIter = std::slice::Iter<'a, Tool>;

    fn into_iter(self) -> Self::IntoIter {
        self.tools.iter()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
