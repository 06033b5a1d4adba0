//! Adapter façade.
//!
//! Composes the loader, caches, pool, and lifecycle for the host:
//! direct tool specs come from the metadata cache before any server is
//! contacted, the unified proxy tool multiplexes
//! search/describe/connect/call/status, and session start/shutdown
//! drive the async init and teardown.

mod direct;
mod proxy;

pub use direct::{DirectOverride, DirectToolSpec, parse_direct_override};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(test)]
use pi_mcp_types::config::ServerDefinition;
use pi_mcp_types::config::Lifecycle;

use crate::cache::{MetadataCache, ServerCacheEntry, config_hash, reconstruct_tool_metadata, validate};
use crate::content::{ContentBlock, ToolMetadata, to_content_block};
use crate::error::{McpError, Result};
use crate::lifecycle::{HEALTH_CHECK_INTERVAL, LifecycleManager};
use crate::loader::{self, LoadedConfig};
use crate::manager::{ConnectionSnapshot, Connector, DefaultConnector, ServerManager};
use crate::names::names_match;
use crate::util::now_ms;

/// Backoff window after a failed call or connect.
pub const FAILURE_BACKOFF_MS: i64 = 60_000;

/// Startup connects run at most this many in parallel.
const MAX_PARALLEL_CONNECTS: usize = 10;

/// Tracks recent per-server failures for the backoff sentinel.
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: std::sync::Mutex<HashMap<String, i64>>,
}

impl FailureTracker {
    /// Record a failure at `now_ms`.
    pub fn record(&self, server: &str, now_ms: i64) {
        if let Ok(mut map) = self.failures.lock() {
            map.insert(server.to_string(), now_ms);
        }
    }

    /// Clear the failure record after a success.
    pub fn clear(&self, server: &str) {
        if let Ok(mut map) = self.failures.lock() {
            map.remove(server);
        }
    }

    /// Milliseconds left in the backoff window, if `server` failed
    /// less than a minute ago.
    pub fn remaining(&self, server: &str, now_ms: i64) -> Option<i64> {
        let map = self.failures.lock().ok()?;
        let failed_at = map.get(server)?;
        let remaining = FAILURE_BACKOFF_MS - (now_ms - failed_at);
        (remaining > 0).then_some(remaining)
    }
}

/// The MCP adapter: everything the host talks to.
pub struct McpAdapter {
    agent_dir: PathBuf,
    loaded: LoadedConfig,
    cache: MetadataCache,
    /// Servers whose cache entry was valid at load time.
    valid_cache: HashSet<String>,
    /// Whether any cache file existed at load time; when it did not,
    /// startup connects every server to populate it.
    had_cache_file: bool,
    /// Host-visible tool metadata per server.
    tool_metadata: Mutex<HashMap<String, Vec<ToolMetadata>>>,
    manager: Arc<ServerManager>,
    lifecycle: Arc<LifecycleManager>,
    failures: FailureTracker,
}

impl McpAdapter {
    /// Load config and cache and build the adapter with the production
    /// connector. Everything here is synchronous so the host can
    /// register tools before async init runs.
    pub fn new(agent_dir: &Path, cwd: &Path, override_path: Option<&Path>) -> Result<Arc<Self>> {
        let connector = Arc::new(DefaultConnector::new(agent_dir.to_path_buf()));
        Self::with_connector(agent_dir, cwd, override_path, connector)
    }

    /// Adapter with an injected connector (tests).
    pub fn with_connector(
        agent_dir: &Path,
        cwd: &Path,
        override_path: Option<&Path>,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>> {
        let loaded = loader::load(agent_dir, cwd, override_path)?;
        let cache = MetadataCache::new(agent_dir);
        let cache_entries = cache.load();
        let had_cache_file = cache_entries.is_some();

        // Seed metadata from valid cache entries so tools exist before
        // any connection.
        let now = now_ms();
        let prefix = loaded.config.settings.tool_prefix();
        let mut valid_cache = HashSet::new();
        let mut tool_metadata = HashMap::new();
        if let Some(entries) = &cache_entries {
            for (name, entry) in entries {
                let Some(def) = loaded.config.servers.get(name) else {
                    continue;
                };
                if !validate(entry, def, now) {
                    debug!(server = %name, "ignoring stale or mismatched cache entry");
                    continue;
                }
                valid_cache.insert(name.clone());
                tool_metadata.insert(
                    name.clone(),
                    reconstruct_tool_metadata(name, entry, prefix, def.expose_resources),
                );
            }
        }

        let manager = Arc::new(ServerManager::new(connector));
        let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&manager)));

        Ok(Arc::new(Self {
            agent_dir: agent_dir.to_path_buf(),
            loaded,
            cache,
            valid_cache,
            had_cache_file,
            tool_metadata: Mutex::new(tool_metadata),
            manager,
            lifecycle,
            failures: FailureTracker::default(),
        }))
    }

    /// The agent directory this adapter is rooted in.
    pub fn agent_dir(&self) -> &Path {
        &self.agent_dir
    }

    /// The merged configuration.
    pub fn config(&self) -> &pi_mcp_types::config::McpConfig {
        &self.loaded.config
    }

    /// Provenance for one server.
    pub fn provenance(&self, server: &str) -> Option<&loader::Provenance> {
        self.loaded.provenance.get(server)
    }

    /// The connection pool (status reporting).
    pub fn manager(&self) -> &Arc<ServerManager> {
        &self.manager
    }

    // ── Async init / shutdown ───────────────────────────────────────────

    /// Async init: register servers with the lifecycle manager, run the
    /// eager connect fan-out, wire callbacks, start the health loop.
    pub async fn start(self: &Arc<Self>) {
        let global_idle = self.loaded.config.settings.idle_timeout;
        for (name, def) in &self.loaded.config.servers {
            self.lifecycle
                .register(name, def.clone(), def.effective_idle_timeout_ms(global_idle))
                .await;
        }

        // Eager set: eager + keep-alive servers, or every server when
        // there was no cache to bootstrap tools from.
        let eager: Vec<String> = self
            .loaded
            .config
            .servers
            .iter()
            .filter(|(_, def)| {
                !self.had_cache_file
                    || matches!(def.lifecycle, Lifecycle::Eager | Lifecycle::KeepAlive)
            })
            .map(|(name, _)| name.clone())
            .collect();

        futures_util::stream::iter(eager.into_iter().map(|name| {
            let adapter = Arc::clone(self);
            async move {
                if let Err(e) = adapter.connect_and_refresh(&name).await {
                    warn!(server = %name, error = %e, "startup connect failed");
                }
            }
        }))
        .buffer_unordered(MAX_PARALLEL_CONNECTS)
        .collect::<Vec<()>>()
        .await;

        // Lifecycle callbacks: refresh metadata on reconnect, log on
        // idle shutdown.
        let reconnect_adapter = Arc::clone(self);
        self.lifecycle
            .on_reconnect(Arc::new(move |name: String| {
                let adapter = Arc::clone(&reconnect_adapter);
                Box::pin(async move {
                    if let Some(snapshot) = adapter.manager.snapshot(&name).await {
                        adapter.refresh_metadata(&name, &snapshot).await;
                    }
                })
            }))
            .await;
        self.lifecycle
            .on_idle_shutdown(Arc::new(|name: String| {
                Box::pin(async move {
                    info!(server = %name, "idle mcp server shut down");
                })
            }))
            .await;

        self.lifecycle.start(HEALTH_CHECK_INTERVAL);
    }

    /// Session shutdown: stop the health loop and close every server.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
        self.tool_metadata.lock().await.clear();
        info!("mcp adapter shut down");
    }

    /// The lifecycle manager (tests tick it directly).
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    // ── Connections and metadata ────────────────────────────────────────

    /// Connect `name` and refresh metadata and the on-disk cache.
    pub async fn connect_and_refresh(self: &Arc<Self>, name: &str) -> Result<ConnectionSnapshot> {
        let def = self
            .loaded
            .config
            .servers
            .get(name)
            .ok_or_else(|| McpError::Config(format!("unknown server \"{name}\"")))?;
        match self.manager.connect(name, def).await {
            Ok(snapshot) => {
                self.failures.clear(name);
                self.refresh_metadata(name, &snapshot).await;
                Ok(snapshot)
            }
            Err(e) => {
                self.failures.record(name, now_ms());
                Err(e)
            }
        }
    }

    /// Rebuild `name`'s tool metadata from a live snapshot and rewrite
    /// its cache entry.
    async fn refresh_metadata(&self, name: &str, snapshot: &ConnectionSnapshot) {
        let Some(def) = self.loaded.config.servers.get(name) else {
            return;
        };
        let entry = ServerCacheEntry {
            config_hash: config_hash(def),
            tools: snapshot.tools.clone(),
            resources: snapshot.resources.clone(),
            cached_at: now_ms(),
        };
        let prefix = self.loaded.config.settings.tool_prefix();
        let metadata = reconstruct_tool_metadata(name, &entry, prefix, def.expose_resources);
        self.tool_metadata
            .lock()
            .await
            .insert(name.to_string(), metadata);

        let mut partial = BTreeMap::new();
        partial.insert(name.to_string(), entry);
        if let Err(e) = self.cache.save(&partial) {
            warn!(server = %name, error = %e, "failed to write metadata cache");
        }
    }

    /// Snapshot of all known tool metadata, keyed by server.
    pub async fn tool_metadata(&self) -> HashMap<String, Vec<ToolMetadata>> {
        self.tool_metadata.lock().await.clone()
    }

    /// Find a tool by host-visible name: exact prefixed match first,
    /// then `-`/`_` normalized, optionally restricted to one server.
    pub async fn find_tool(
        &self,
        tool_name: &str,
        server_filter: Option<&str>,
    ) -> Option<(String, ToolMetadata)> {
        let metadata = self.tool_metadata.lock().await;
        let candidates = metadata
            .iter()
            .filter(|(server, _)| server_filter.is_none_or(|f| f == server.as_str()));

        let mut normalized: Option<(String, ToolMetadata)> = None;
        for (server, tools) in candidates {
            for tool in tools {
                if tool.prefixed_name == tool_name {
                    return Some((server.clone(), tool.clone()));
                }
                if normalized.is_none() && names_match(&tool.prefixed_name, tool_name) {
                    normalized = Some((server.clone(), tool.clone()));
                }
            }
        }
        normalized
    }

    // ── Tool invocation ─────────────────────────────────────────────────

    /// Invoke a tool on behalf of the host.
    ///
    /// Applies the failure backoff, lazy-connects, tracks in-flight
    /// counts, and transforms MCP content into host content blocks.
    /// Failures come back as text blocks, never as errors.
    pub async fn call_tool(
        self: &Arc<Self>,
        tool_name: &str,
        args: Value,
        server_filter: Option<&str>,
    ) -> Vec<ContentBlock> {
        let Some((server, tool)) = self.find_tool(tool_name, server_filter).await else {
            let available = self.known_tool_names().await;
            return vec![ContentBlock::text(format!(
                "Tool \"{tool_name}\" not found. Available: {}",
                available.join(", ")
            ))];
        };

        let now = now_ms();
        if let Some(remaining) = self.failures.remaining(&server, now) {
            let seconds = (remaining + 999) / 1000;
            return vec![ContentBlock::text(format!(
                "Server \"{server}\" recently failed. Retry in {seconds}s or use {{\"connect\": \"{server}\"}} to reconnect."
            ))];
        }

        let client = match self.manager.client(&server).await {
            Some(client) => client,
            None => match self.connect_and_refresh(&server).await {
                Ok(snapshot) => snapshot.client,
                Err(e) => {
                    return vec![ContentBlock::text(format!(
                        "Failed to connect to \"{server}\": {e}"
                    ))];
                }
            },
        };

        self.manager.increment_in_flight(&server, now).await;
        let outcome = match &tool.resource_uri {
            Some(uri) => client.read_resource(uri).await.map(|raw| {
                vec![ContentBlock::text(render_resource_contents(uri, &raw))]
            }),
            None => client
                .call_tool(&tool.original_name, args)
                .await
                .map(|result| result.content.iter().map(to_content_block).collect()),
        };
        self.manager.decrement_in_flight(&server).await;

        match outcome {
            Ok(blocks) => {
                self.failures.clear(&server);
                blocks
            }
            Err(e) => {
                self.failures.record(&server, now_ms());
                vec![ContentBlock::text(format!(
                    "Tool \"{tool_name}\" failed on \"{server}\": {e}"
                ))]
            }
        }
    }

    /// All host-visible tool names, sorted.
    pub async fn known_tool_names(&self) -> Vec<String> {
        let metadata = self.tool_metadata.lock().await;
        let mut names: Vec<String> = metadata
            .values()
            .flatten()
            .map(|t| t.prefixed_name.clone())
            .collect();
        names.sort();
        names
    }

    /// The failure tracker (proxy + tests).
    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }
}

/// Render a `resources/read` result as text.
fn render_resource_contents(uri: &str, raw: &Value) -> String {
    let body = raw
        .get("contents")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    item.get("text")
                        .or_else(|| item.get("blob"))
                        .and_then(|v| v.as_str())
                })
                .collect::<Vec<&str>>()
                .join("\n")
        })
        .unwrap_or_default();
    format!("[Resource: {uri}]\n{body}")
}
