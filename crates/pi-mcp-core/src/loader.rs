//! Config loading and import merging.
//!
//! The canonical [`McpConfig`] is assembled from three layers:
//! a base file (`<agent_dir>/mcp.json` unless overridden), server
//! definitions imported from well-known third-party configs, and a
//! project-local overlay at `<cwd>/.pi/mcp.json`. Imports never
//! overwrite names that are already present; the project overlay does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use pi_mcp_types::config::{McpConfig, ServerDefinition};

use crate::error::{McpError, Result};
use crate::util::expand_tilde;

/// Where a server definition came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// `"config"`, `"project"`, or the import source tag.
    pub source: String,
    /// The file the definition was read from.
    pub path: PathBuf,
}

/// A merged config plus per-server provenance.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    /// The canonical merged configuration.
    pub config: McpConfig,
    /// Source tag and resolved path per server name.
    pub provenance: HashMap<String, Provenance>,
}

/// Load and merge the configuration layers.
///
/// The base path is `override_path` when given, else `$MCP_CONFIG`,
/// else `<agent_dir>/mcp.json`. A missing base yields an empty config;
/// a malformed base is fatal. Malformed or absent imports are skipped
/// silently.
pub fn load(agent_dir: &Path, cwd: &Path, override_path: Option<&Path>) -> Result<LoadedConfig> {
    let base_path = override_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var("MCP_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| agent_dir.join("mcp.json"));

    let mut loaded = LoadedConfig::default();

    match std::fs::read_to_string(&base_path) {
        Ok(raw) => {
            let base: McpConfig = serde_json::from_str(&raw)
                .map_err(|e| McpError::Config(format!("{}: {e}", base_path.display())))?;
            loaded.config = base;
            for name in loaded.config.servers.keys() {
                loaded.provenance.insert(
                    name.clone(),
                    Provenance {
                        source: "config".into(),
                        path: base_path.clone(),
                    },
                );
            }
        }
        Err(_) => {
            debug!(path = %base_path.display(), "no base mcp config");
        }
    }

    // Imports merge without overwriting accumulated names.
    for import in loaded.config.imports.clone() {
        let Some(path) = resolve_import_path(&import, cwd) else {
            continue;
        };
        let Ok(raw) = std::fs::read_to_string(&path) else {
            debug!(import = %import, path = %path.display(), "import file absent, skipping");
            continue;
        };
        let Ok(doc) = serde_json::from_str::<Value>(&raw) else {
            debug!(import = %import, "malformed import file, skipping");
            continue;
        };
        for (name, def) in extract_servers(&import, &doc) {
            if loaded.config.servers.contains_key(&name) {
                continue;
            }
            loaded.provenance.insert(
                name.clone(),
                Provenance {
                    source: import.clone(),
                    path: path.clone(),
                },
            );
            loaded.config.servers.insert(name, def);
        }
    }

    // Project overlay: definitions overwrite, settings merge per field.
    let project_path = cwd.join(".pi").join("mcp.json");
    if let Ok(raw) = std::fs::read_to_string(&project_path) {
        match serde_json::from_str::<McpConfig>(&raw) {
            Ok(project) => {
                for (name, def) in project.servers {
                    loaded.provenance.insert(
                        name.clone(),
                        Provenance {
                            source: "project".into(),
                            path: project_path.clone(),
                        },
                    );
                    loaded.config.servers.insert(name, def);
                }
                loaded.config.settings.overlay(&project.settings);
            }
            Err(e) => {
                warn!(path = %project_path.display(), error = %e, "malformed project mcp config, skipping");
            }
        }
    }

    // Definitions that set both or neither transport cannot be used.
    let mut invalid = Vec::new();
    for (name, def) in &loaded.config.servers {
        if let Err(reason) = def.validate() {
            warn!(server = %name, reason = %reason, "dropping invalid server definition");
            invalid.push(name.clone());
        }
    }
    for name in invalid {
        loaded.config.servers.remove(&name);
        loaded.provenance.remove(&name);
    }

    Ok(loaded)
}

/// Map an import source to its config path.
///
/// Known names resolve to fixed home-relative locations (`vscode` is
/// cwd-relative); anything else is a file path with `~` expansion.
/// Returns `None` when no home directory is available for a
/// home-relative source.
pub fn resolve_import_path(import: &str, cwd: &Path) -> Option<PathBuf> {
    let home = dirs::home_dir();
    match import {
        "cursor" => Some(home?.join(".cursor").join("mcp.json")),
        "claude-code" => Some(home?.join(".claude.json")),
        "claude-desktop" => Some(
            home?
                .join("Library")
                .join("Application Support")
                .join("Claude")
                .join("claude_desktop_config.json"),
        ),
        "codex" => Some(home?.join(".codex").join("config.json")),
        "windsurf" => Some(
            home?
                .join(".codeium")
                .join("windsurf")
                .join("mcp_config.json"),
        ),
        "vscode" => Some(cwd.join(".vscode").join("mcp.json")),
        path => Some(expand_tilde(path)),
    }
}

/// Pull server definitions out of an imported document.
///
/// All sources use a root `mcpServers` / `mcp-servers` object; `codex`
/// additionally nests under `mcp.servers` and `vscode` under a root
/// `servers`. Entries that fail to parse are skipped.
pub fn extract_servers(source: &str, doc: &Value) -> HashMap<String, ServerDefinition> {
    let mut found = HashMap::new();
    let mut candidates: Vec<&Value> = Vec::new();
    if let Some(v) = doc.get("mcpServers") {
        candidates.push(v);
    }
    if let Some(v) = doc.get("mcp-servers") {
        candidates.push(v);
    }
    if source == "codex"
        && let Some(v) = doc.get("mcp").and_then(|m| m.get("servers"))
    {
        candidates.push(v);
    }
    if source == "vscode"
        && let Some(v) = doc.get("servers")
    {
        candidates.push(v);
    }

    for candidate in candidates {
        let Some(map) = candidate.as_object() else {
            continue;
        };
        for (name, raw) in map {
            if found.contains_key(name) {
                continue;
            }
            match serde_json::from_value::<ServerDefinition>(raw.clone()) {
                Ok(def) => {
                    found.insert(name.clone(), def);
                }
                Err(e) => {
                    debug!(source = %source, server = %name, error = %e, "skipping malformed import entry");
                }
            }
        }
    }
    found
}
