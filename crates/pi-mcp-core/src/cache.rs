//! Persistent tool metadata cache.
//!
//! Maps server name to the tools and resources it advertised on a
//! previous run, so the host can register direct tools before any
//! server is contacted. An entry is valid only while its config hash
//! matches the current definition and it is younger than seven days.
//!
//! Writes are read-merge-write with an atomic rename so concurrent
//! host processes do not clobber each other's entries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use pi_mcp_types::config::{ServerDefinition, ToolPrefix};

use crate::content::{ResourceInfo, ToolInfo, ToolMetadata};
use crate::error::Result;
use crate::names::{format_tool_name, resource_tool_name};

/// Cache schema version; entries with any other version are discarded.
pub const CACHE_VERSION: u32 = 1;

/// Entry lifetime.
pub const SEVEN_DAYS_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Cached advertisement of one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCacheEntry {
    /// Hash of the identity-affecting definition fields at cache time.
    #[serde(rename = "configHash", alias = "config_hash")]
    pub config_hash: String,
    /// Tools the server advertised.
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
    /// Resources the server advertised.
    #[serde(default)]
    pub resources: Vec<ResourceInfo>,
    /// Unix milliseconds at cache time.
    #[serde(rename = "cachedAt", alias = "cached_at")]
    pub cached_at: i64,
}

/// On-disk envelope.
///
/// `servers` is a BTreeMap so that serialization is key-sorted and a
/// load-then-save round trip is byte-identical.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    #[serde(default)]
    servers: BTreeMap<String, ServerCacheEntry>,
}

/// Handle on `<agent_dir>/mcp-cache.json`.
#[derive(Debug, Clone)]
pub struct MetadataCache {
    path: PathBuf,
}

impl MetadataCache {
    /// Cache rooted in the agent directory.
    pub fn new(agent_dir: &Path) -> Self {
        Self {
            path: agent_dir.join("mcp-cache.json"),
        }
    }

    /// Load the cache; `None` when absent, undecodable, or a different
    /// schema version.
    pub fn load(&self) -> Option<BTreeMap<String, ServerCacheEntry>> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let file: CacheFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding undecodable mcp cache");
                return None;
            }
        };
        if file.version != CACHE_VERSION {
            debug!(version = file.version, "discarding mcp cache with wrong version");
            return None;
        }
        Some(file.servers)
    }

    /// Merge `partial` over the on-disk cache and write it back.
    ///
    /// Each entry in `partial` replaces the whole entry for that
    /// server; entries for other servers are preserved. The write goes
    /// to `<path>.<pid>.tmp` and is renamed over the target; if the
    /// rename fails the content is written directly as a best effort.
    pub fn save(&self, partial: &BTreeMap<String, ServerCacheEntry>) -> Result<()> {
        let mut servers = self.load().unwrap_or_default();
        for (name, entry) in partial {
            servers.insert(name.clone(), entry.clone());
        }
        let file = CacheFile {
            version: CACHE_VERSION,
            servers,
        };
        let body = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        if std::fs::write(&tmp, &body).is_ok() {
            match std::fs::rename(&tmp, &self.path) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "atomic cache rename failed, writing directly");
                    let _ = std::fs::remove_file(&tmp);
                }
            }
        }
        std::fs::write(&self.path, &body)?;
        Ok(())
    }

    /// Store a single server's fresh advertisement.
    pub fn save_server(&self, name: &str, entry: ServerCacheEntry) -> Result<()> {
        let mut partial = BTreeMap::new();
        partial.insert(name.to_string(), entry);
        self.save(&partial)
    }
}

/// Whether `entry` is still usable for `def` at time `now_ms`.
pub fn validate(entry: &ServerCacheEntry, def: &ServerDefinition, now_ms: i64) -> bool {
    entry.config_hash == config_hash(def) && now_ms - entry.cached_at < SEVEN_DAYS_MS
}

/// Rebuild the tool metadata a fresh connection to `server` would
/// produce from its cache entry.
pub fn reconstruct_tool_metadata(
    server: &str,
    entry: &ServerCacheEntry,
    prefix: ToolPrefix,
    expose_resources: bool,
) -> Vec<ToolMetadata> {
    let mut out = Vec::new();
    for tool in &entry.tools {
        out.push(ToolMetadata {
            prefixed_name: format_tool_name(prefix, server, &tool.name),
            original_name: tool.name.clone(),
            description: tool.description.clone().unwrap_or_default(),
            input_schema: tool.input_schema.clone(),
            resource_uri: None,
        });
    }
    if expose_resources {
        for resource in &entry.resources {
            let tool_name = resource_tool_name(&resource.name);
            out.push(ToolMetadata {
                prefixed_name: format_tool_name(prefix, server, &tool_name),
                original_name: tool_name,
                description: resource
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Read resource {}", resource.uri)),
                input_schema: None,
                resource_uri: Some(resource.uri.clone()),
            });
        }
    }
    out
}

// ── Config hash ──────────────────────────────────────────────────────────

/// Stable hash of the identity-affecting fields of a definition.
///
/// The JSON encoding sorts object keys at every level and omits absent
/// fields, so two definitions equal up to map-iteration order hash
/// identically. Output is lowercase hex SHA-256.
pub fn config_hash(def: &ServerDefinition) -> String {
    let mut identity = serde_json::Map::new();
    if let Some(command) = &def.command {
        identity.insert("command".into(), Value::from(command.clone()));
    }
    if !def.args.is_empty() {
        identity.insert("args".into(), Value::from(def.args.clone()));
    }
    if !def.env.is_empty() {
        identity.insert("env".into(), map_value(&def.env));
    }
    if let Some(cwd) = &def.cwd {
        identity.insert("cwd".into(), Value::from(cwd.clone()));
    }
    if let Some(url) = &def.url {
        identity.insert("url".into(), Value::from(url.clone()));
    }
    if !def.headers.is_empty() {
        identity.insert("headers".into(), map_value(&def.headers));
    }
    if let Some(auth) = &def.auth {
        identity.insert("auth".into(), serde_json::to_value(auth).unwrap_or(Value::Null));
    }
    if let Some(token) = &def.bearer_token {
        identity.insert("bearerToken".into(), Value::from(token.clone()));
    }
    if let Some(token_env) = &def.bearer_token_env {
        identity.insert("bearerTokenEnv".into(), Value::from(token_env.clone()));
    }
    identity.insert("exposeResources".into(), Value::from(def.expose_resources));

    let canonical = canonical_json(&Value::Object(identity));
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

fn map_value(map: &std::collections::HashMap<String, String>) -> Value {
    let sorted: BTreeMap<&String, &String> = map.iter().collect();
    Value::Object(
        sorted
            .into_iter()
            .map(|(k, v)| (k.clone(), Value::from(v.clone())))
            .collect(),
    )
}

/// Serialize with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
