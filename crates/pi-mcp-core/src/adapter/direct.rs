//! Direct tool exposure.
//!
//! A direct tool is registered with the host under its cached name and
//! schema, bypassing the proxy. Exposure is decided per server from
//! config (or globally from settings), can be overridden wholesale via
//! `MCP_DIRECT_TOOLS`, and only draws from servers whose cache entry
//! is valid; everything else waits for a live connect.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::McpAdapter;
use crate::content::ToolMetadata;
use crate::names::RESERVED_HOST_TOOLS;

/// One tool to register directly with the host.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectToolSpec {
    /// The server that owns the tool.
    pub server: String,
    /// Cached metadata: name, schema, description.
    pub metadata: ToolMetadata,
}

/// Parsed `MCP_DIRECT_TOOLS` override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectOverride {
    /// `__none__`: no direct tools at all.
    Disabled,
    /// Only the listed servers are exposed; a `None` tool set means
    /// all of that server's tools.
    Entries(HashMap<String, Option<HashSet<String>>>),
}

/// Parse the `MCP_DIRECT_TOOLS` value, if set.
///
/// Entries are comma-separated, each either `<server>` (all tools) or
/// `<server>/<tool>`. A bare server entry wins over tool entries for
/// the same server.
pub fn parse_direct_override(raw: Option<&str>) -> Option<DirectOverride> {
    let raw = raw?;
    if raw.trim() == "__none__" {
        return Some(DirectOverride::Disabled);
    }
    let mut entries: HashMap<String, Option<HashSet<String>>> = HashMap::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('/') {
            Some((server, tool)) => {
                let slot = entries
                    .entry(server.to_string())
                    .or_insert_with(|| Some(HashSet::new()));
                if let Some(tools) = slot {
                    tools.insert(tool.to_string());
                }
            }
            None => {
                entries.insert(part.to_string(), None);
            }
        }
    }
    Some(DirectOverride::Entries(entries))
}

impl McpAdapter {
    /// Direct tool specs, honoring the `MCP_DIRECT_TOOLS` environment
    /// override.
    pub async fn direct_tool_specs(&self) -> Vec<DirectToolSpec> {
        let env = std::env::var("MCP_DIRECT_TOOLS").ok();
        self.direct_tool_specs_with(parse_direct_override(env.as_deref()))
            .await
    }

    /// Direct tool specs under an explicit override decision.
    pub async fn direct_tool_specs_with(
        &self,
        override_: Option<DirectOverride>,
    ) -> Vec<DirectToolSpec> {
        let entries = match override_ {
            Some(DirectOverride::Disabled) => return Vec::new(),
            Some(DirectOverride::Entries(entries)) => Some(entries),
            None => None,
        };

        let metadata = self.tool_metadata.lock().await;
        let mut taken: HashSet<String> =
            RESERVED_HOST_TOOLS.iter().map(|s| s.to_string()).collect();
        let mut specs = Vec::new();

        let mut servers: Vec<&String> = self.loaded.config.servers.keys().collect();
        servers.sort();

        for server in servers {
            let def = &self.loaded.config.servers[server];
            // Without a valid cache entry there is nothing trustworthy
            // to register; exposure waits for the first connect.
            if !self.valid_cache.contains(server) {
                continue;
            }

            let allows = |tool: &ToolMetadata| -> bool {
                match &entries {
                    Some(entries) => match entries.get(server) {
                        Some(None) => true,
                        Some(Some(tools)) => tools.contains(&tool.original_name),
                        None => false,
                    },
                    None => match &def.direct_tools {
                        Some(direct) => direct.includes(&tool.original_name),
                        None => self.loaded.config.settings.direct_tools.unwrap_or(false),
                    },
                }
            };

            for tool in metadata.get(server).map(Vec::as_slice).unwrap_or_default() {
                if !allows(tool) {
                    continue;
                }
                if taken.contains(&tool.prefixed_name) {
                    debug!(
                        server = %server,
                        tool = %tool.prefixed_name,
                        "skipping direct tool with taken name"
                    );
                    continue;
                }
                taken.insert(tool.prefixed_name.clone());
                specs.push(DirectToolSpec {
                    server: server.clone(),
                    metadata: tool.clone(),
                });
            }
        }
        specs
    }
}
