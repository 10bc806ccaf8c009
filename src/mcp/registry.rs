//! Merged tool manifest across all ready servers.
//!
//! Visible names are unique: when two servers expose the same tool name, the
//! first-registered server keeps the bare name and later entrants are
//! qualified as `server__tool`. Disabling a server hides its tools from the
//! manifest without touching its connection.

use std::collections::HashSet;

use rust_mcp_schema::Tool;
use serde_json::Value;
use tracing::debug;

use crate::api::ChatToolDefinition;

#[derive(Debug, Clone)]
pub struct RegisteredTool {
    /// Owning server name; its connection is Ready while the entry exists.
    pub server: String,
    /// Name offered to the model. Bare, or `server__tool` after a collision.
    pub visible_name: String,
    pub tool: Tool,
}

impl RegisteredTool {
    pub fn is_qualified(&self) -> bool {
        self.visible_name != self.tool.name
    }
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    /// Registration order is preserved; collision qualification and bare-name
    /// resolution both depend on it.
    entries: Vec<RegisteredTool>,
    disabled: HashSet<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces `server`'s entries with `tools`, qualifying any name already
    /// claimed by an earlier-registered server.
    pub fn merge(&mut self, server: &str, tools: Vec<Tool>) {
        self.entries.retain(|entry| entry.server != server);
        for tool in tools {
            if self
                .entries
                .iter()
                .any(|entry| entry.server == server && entry.tool.name == tool.name)
            {
                debug!(server, tool = %tool.name, "Skipping duplicate tool from the same server");
                continue;
            }
            let bare_taken = self
                .entries
                .iter()
                .any(|entry| entry.visible_name == tool.name);
            let visible_name = if bare_taken {
                format!("{server}__{}", tool.name)
            } else {
                tool.name.clone()
            };
            self.entries.push(RegisteredTool {
                server: server.to_string(),
                visible_name,
                tool,
            });
        }
    }

    /// Drops every entry owned by `server` (its connection left Ready).
    pub fn remove(&mut self, server: &str) {
        self.entries.retain(|entry| entry.server != server);
        self.disabled.remove(server);
    }

    /// Hides or restores a server's tools in the manifest. Returns false when
    /// the server owns no entries.
    pub fn set_server_enabled(&mut self, server: &str, enabled: bool) -> bool {
        if !self.entries.iter().any(|entry| entry.server == server) {
            return false;
        }
        if enabled {
            self.disabled.remove(server);
        } else {
            self.disabled.insert(server.to_string());
        }
        true
    }

    pub fn is_server_enabled(&self, server: &str) -> bool {
        !self.disabled.contains(server)
    }

    /// Enabled entries, in registration order. Visible names are unique.
    pub fn manifest(&self) -> Vec<&RegisteredTool> {
        self.entries
            .iter()
            .filter(|entry| self.is_server_enabled(&entry.server))
            .collect()
    }

    /// Resolves a name the model may select: the visible (possibly
    /// qualified) name, or a bare name, which maps to its first-registered
    /// enabled owner.
    pub fn resolve(&self, name: &str) -> Option<&RegisteredTool> {
        self.entries
            .iter()
            .filter(|entry| self.is_server_enabled(&entry.server))
            .find(|entry| entry.visible_name == name || entry.tool.name == name)
    }

    /// Like [`resolve`](Self::resolve) but ignores the enabled flag. Forced
    /// invocations only require the tool to exist.
    pub fn resolve_any(&self, name: &str) -> Option<&RegisteredTool> {
        self.entries
            .iter()
            .find(|entry| entry.visible_name == name || entry.tool.name == name)
    }

    /// Server names that currently own entries, in registration order.
    pub fn servers(&self) -> Vec<String> {
        let mut servers: Vec<String> = Vec::new();
        for entry in &self.entries {
            if !servers.iter().any(|name| name == &entry.server) {
                servers.push(entry.server.clone());
            }
        }
        servers
    }

    pub fn tools_for(&self, server: &str) -> Vec<&RegisteredTool> {
        self.entries
            .iter()
            .filter(|entry| entry.server == server)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Function declarations for the completion request, one per enabled
    /// tool, under visible names.
    pub fn tool_definitions(&self) -> Vec<ChatToolDefinition> {
        self.manifest()
            .into_iter()
            .map(|entry| {
                let parameters = serde_json::to_value(&entry.tool.input_schema)
                    .unwrap_or_else(|_| serde_json::json!({"type": "object"}));
                ChatToolDefinition::function(
                    entry.visible_name.clone(),
                    entry.tool.description.clone(),
                    parameters,
                )
            })
            .collect()
    }

    /// JSON schema of a registered tool's arguments.
    pub fn input_schema_value(entry: &RegisteredTool) -> Value {
        serde_json::to_value(&entry.tool.input_schema)
            .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::tool;

    fn registry_with_collision() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.merge("alpha", vec![tool("search"), tool("fetch")]);
        registry.merge("beta", vec![tool("search")]);
        registry
    }

    #[test]
    fn first_registered_owner_keeps_the_bare_name() {
        let registry = registry_with_collision();
        let names: Vec<&str> = registry
            .manifest()
            .iter()
            .map(|entry| entry.visible_name.as_str())
            .collect();
        assert_eq!(names, vec!["search", "fetch", "beta__search"]);
    }

    #[test]
    fn manifest_never_repeats_a_visible_name() {
        let registry = registry_with_collision();
        let manifest = registry.manifest();
        let mut seen = HashSet::new();
        assert!(manifest
            .iter()
            .all(|entry| seen.insert(entry.visible_name.as_str())));
    }

    #[test]
    fn bare_and_qualified_names_both_resolve() {
        let registry = registry_with_collision();
        assert_eq!(registry.resolve("search").expect("bare").server, "alpha");
        assert_eq!(
            registry.resolve("beta__search").expect("qualified").server,
            "beta"
        );
    }

    #[test]
    fn resolution_is_deterministic_across_calls() {
        let registry = registry_with_collision();
        for _ in 0..3 {
            assert_eq!(registry.resolve("search").expect("bare").server, "alpha");
        }
    }

    #[test]
    fn disabling_hides_tools_without_removing_them() {
        let mut registry = registry_with_collision();
        assert!(registry.set_server_enabled("alpha", false));
        let names: Vec<&str> = registry
            .manifest()
            .iter()
            .map(|entry| entry.visible_name.as_str())
            .collect();
        assert_eq!(names, vec!["beta__search"]);
        assert!(registry.resolve("fetch").is_none());
        // Forced resolution still sees the disabled server's tools.
        assert_eq!(registry.resolve_any("fetch").expect("any").server, "alpha");

        assert!(registry.set_server_enabled("alpha", true));
        assert_eq!(registry.manifest().len(), 3);
    }

    #[test]
    fn bare_resolution_skips_disabled_owners() {
        let mut registry = registry_with_collision();
        registry.set_server_enabled("alpha", false);
        assert_eq!(registry.resolve("search").expect("bare").server, "beta");
    }

    #[test]
    fn unknown_server_toggle_reports_false() {
        let mut registry = ToolRegistry::new();
        assert!(!registry.set_server_enabled("ghost", false));
    }

    #[test]
    fn remove_drops_entries_and_disabled_state() {
        let mut registry = registry_with_collision();
        registry.set_server_enabled("beta", false);
        registry.remove("beta");
        assert!(registry.tools_for("beta").is_empty());
        // A later re-merge starts enabled again.
        registry.merge("beta", vec![tool("search")]);
        assert!(registry.is_server_enabled("beta"));
        assert_eq!(registry.manifest().len(), 3);
    }

    #[test]
    fn re_merge_requalifies_against_current_entries() {
        let mut registry = ToolRegistry::new();
        registry.merge("alpha", vec![tool("search")]);
        registry.merge("beta", vec![tool("search")]);
        // Alpha goes away; beta re-merges and now owns the bare name.
        registry.remove("alpha");
        registry.merge("beta", vec![tool("search")]);
        assert_eq!(
            registry.resolve("search").expect("bare").visible_name,
            "search"
        );
    }

    #[test]
    fn tool_definitions_use_visible_names() {
        let registry = registry_with_collision();
        let definitions = registry.tool_definitions();
        assert_eq!(definitions.len(), 3);
        assert_eq!(definitions[2].function.name, "beta__search");
        assert_eq!(definitions[0].function.parameters["type"], "object");
    }
}
