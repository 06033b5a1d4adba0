//! Server connection pool.
//!
//! One [`ServerConnection`] per server name, every mutation serialized
//! through a single async mutex. Connecting inserts a `connecting`
//! placeholder so concurrent callers wait instead of spawning a second
//! process; failed connects leave an `error` sentinel behind for
//! status reporting until the next attempt rebuilds it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use pi_mcp_types::config::ServerDefinition;

use crate::auth::resolve_authorization;
use crate::client::McpClient;
use crate::content::{ResourceInfo, ToolInfo};
use crate::error::{McpError, Result};
use crate::npx::NpxResolver;
use crate::transport::Transport;
use crate::transport::http::HttpTransport;
use crate::transport::stdio::StdioTransport;
use crate::util::now_ms;

/// Connection state of a pooled server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Handshake in progress.
    Connecting,
    /// Ready to serve calls.
    Connected,
    /// Not currently connected.
    Disconnected,
    /// The last connect attempt failed.
    Error,
}

/// Pool entry for one server.
struct ServerConnection {
    client: Option<Arc<McpClient>>,
    tools: Vec<ToolInfo>,
    resources: Vec<ResourceInfo>,
    last_used_at: i64,
    in_flight: u32,
    status: ServerStatus,
}

impl ServerConnection {
    fn placeholder(status: ServerStatus) -> Self {
        Self {
            client: None,
            tools: Vec::new(),
            resources: Vec::new(),
            last_used_at: now_ms(),
            in_flight: 0,
            status,
        }
    }
}

/// What a successful connect hands back to the caller.
#[derive(Clone, Debug)]
pub struct ConnectionSnapshot {
    /// The live client.
    pub client: Arc<McpClient>,
    /// Tools the server advertised.
    pub tools: Vec<ToolInfo>,
    /// Resources the server advertised (empty unless requested).
    pub resources: Vec<ResourceInfo>,
}

/// Per-server status line for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    /// Server name.
    pub name: String,
    /// Connection state.
    pub status: ServerStatus,
    /// Advertised tool count.
    pub tool_count: usize,
    /// Calls currently in flight.
    pub in_flight: u32,
}

/// Builds a transport for a server definition.
///
/// The seam between pool bookkeeping and real I/O; tests plug in
/// scripted servers here.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Build (and for stdio, spawn) the transport for `name`.
    async fn connect(&self, name: &str, def: &ServerDefinition) -> Result<Arc<dyn Transport>>;
}

/// Production connector: HTTP for `url` servers, spawned child for
/// `command` servers with npx invocations rewritten first.
pub struct DefaultConnector {
    agent_dir: PathBuf,
    npx: NpxResolver,
}

impl DefaultConnector {
    /// Connector rooted at the agent directory.
    pub fn new(agent_dir: PathBuf) -> Self {
        let npx = NpxResolver::new(&agent_dir);
        Self { agent_dir, npx }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, name: &str, def: &ServerDefinition) -> Result<Arc<dyn Transport>> {
        if let Some(url) = &def.url {
            let authorization = resolve_authorization(name, def, &self.agent_dir, now_ms())?;
            return Ok(Arc::new(HttpTransport::new(
                name,
                url,
                &def.headers,
                authorization,
            )));
        }

        let Some(command) = &def.command else {
            return Err(McpError::Config(format!(
                "server \"{name}\" has neither command nor url"
            )));
        };

        // npx/npm invocations are rewritten to the resolved binary;
        // anything else (and resolution failures) spawns as configured.
        let (command, args) = match self.npx.resolve(command, &def.args, now_ms()).await {
            Some(resolution) => {
                debug!(server = %name, bin = %resolution.bin_path.display(), "npx resolved");
                resolution.into_command()
            }
            None => (command.clone(), def.args.clone()),
        };

        let transport =
            StdioTransport::spawn(name, &command, &args, &def.env, def.cwd.as_deref(), def.debug)
                .await?;
        Ok(Arc::new(transport))
    }
}

/// The connection pool.
pub struct ServerManager {
    connector: Arc<dyn Connector>,
    connections: Mutex<HashMap<String, ServerConnection>>,
    connect_notify: Notify,
}

impl ServerManager {
    /// Pool using the given connector.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: Mutex::new(HashMap::new()),
            connect_notify: Notify::new(),
        }
    }

    /// Connect `name`, or return the existing connection.
    ///
    /// A concurrent connect to the same name waits for the first one
    /// instead of racing it.
    pub async fn connect(&self, name: &str, def: &ServerDefinition) -> Result<ConnectionSnapshot> {
        loop {
            // Register for completion notifications before inspecting
            // the map, so a connect finishing in between still wakes us.
            let notified = self.connect_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut map = self.connections.lock().await;
                match map.get(name).map(|c| c.status) {
                    Some(ServerStatus::Connected) => {
                        let conn = &map[name];
                        if let Some(client) = &conn.client {
                            return Ok(ConnectionSnapshot {
                                client: Arc::clone(client),
                                tools: conn.tools.clone(),
                                resources: conn.resources.clone(),
                            });
                        }
                    }
                    Some(ServerStatus::Connecting) => {
                        // Fall through to wait for the in-progress attempt.
                    }
                    _ => {
                        map.insert(
                            name.to_string(),
                            ServerConnection::placeholder(ServerStatus::Connecting),
                        );
                        break;
                    }
                }
            }
            notified.await;
        }

        match self.establish(name, def).await {
            Ok(snapshot) => {
                let mut map = self.connections.lock().await;
                map.insert(
                    name.to_string(),
                    ServerConnection {
                        client: Some(Arc::clone(&snapshot.client)),
                        tools: snapshot.tools.clone(),
                        resources: snapshot.resources.clone(),
                        last_used_at: now_ms(),
                        in_flight: 0,
                        status: ServerStatus::Connected,
                    },
                );
                drop(map);
                self.connect_notify.notify_waiters();
                info!(server = %name, tools = snapshot.tools.len(), "mcp server connected");
                Ok(snapshot)
            }
            Err(e) => {
                let mut map = self.connections.lock().await;
                if let Some(conn) = map.get_mut(name) {
                    conn.status = ServerStatus::Error;
                }
                drop(map);
                self.connect_notify.notify_waiters();
                warn!(server = %name, error = %e, "mcp connect failed");
                Err(McpError::connection_failed(name, e))
            }
        }
    }

    /// Transport + handshake + discovery, outside the pool lock.
    async fn establish(&self, name: &str, def: &ServerDefinition) -> Result<ConnectionSnapshot> {
        let transport = self.connector.connect(name, def).await?;
        let client = Arc::new(McpClient::connect(name, transport).await?);

        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                client.close().await;
                return Err(e);
            }
        };
        let resources = if def.expose_resources {
            match client.list_resources().await {
                Ok(resources) => resources,
                Err(e) => {
                    client.close().await;
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };

        Ok(ConnectionSnapshot {
            client,
            tools,
            resources,
        })
    }

    /// Close and remove one server. Returns whether it was tracked.
    pub async fn close(&self, name: &str) -> bool {
        let removed = self.connections.lock().await.remove(name);
        match removed {
            Some(conn) => {
                if let Some(client) = conn.client {
                    client.close().await;
                }
                info!(server = %name, "mcp server closed");
                true
            }
            None => false,
        }
    }

    /// Close every connection (shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<(String, ServerConnection)> =
            self.connections.lock().await.drain().collect();
        for (name, conn) in drained {
            if let Some(client) = conn.client {
                client.close().await;
            }
            debug!(server = %name, "closed during shutdown");
        }
    }

    /// Refresh a server's last-used time.
    pub async fn touch(&self, name: &str, now_ms: i64) {
        if let Some(conn) = self.connections.lock().await.get_mut(name) {
            conn.last_used_at = now_ms;
        }
    }

    /// Mark a call started: bump in-flight and refresh last-used.
    pub async fn increment_in_flight(&self, name: &str, now_ms: i64) {
        if let Some(conn) = self.connections.lock().await.get_mut(name) {
            conn.in_flight += 1;
            conn.last_used_at = now_ms;
        }
    }

    /// Mark a call finished; underflow is clamped.
    pub async fn decrement_in_flight(&self, name: &str) {
        if let Some(conn) = self.connections.lock().await.get_mut(name) {
            conn.in_flight = conn.in_flight.saturating_sub(1);
        }
    }

    /// Whether `name` is connected, call-free, and untouched for
    /// longer than `timeout_ms`.
    pub async fn is_idle(&self, name: &str, timeout_ms: i64, now_ms: i64) -> bool {
        let map = self.connections.lock().await;
        match map.get(name) {
            Some(conn) => {
                conn.status == ServerStatus::Connected
                    && conn.in_flight == 0
                    && now_ms - conn.last_used_at > timeout_ms
            }
            None => false,
        }
    }

    /// Whether `name` currently has a live connection.
    pub async fn is_connected(&self, name: &str) -> bool {
        self.status(name).await == Some(ServerStatus::Connected)
    }

    /// Current status of `name`, if tracked.
    pub async fn status(&self, name: &str) -> Option<ServerStatus> {
        self.connections.lock().await.get(name).map(|c| c.status)
    }

    /// The live client for `name`, when connected.
    pub async fn client(&self, name: &str) -> Option<Arc<McpClient>> {
        let map = self.connections.lock().await;
        map.get(name)
            .filter(|c| c.status == ServerStatus::Connected)
            .and_then(|c| c.client.clone())
    }

    /// Client plus discovered tools/resources for `name`, when connected.
    pub async fn snapshot(&self, name: &str) -> Option<ConnectionSnapshot> {
        let map = self.connections.lock().await;
        let conn = map.get(name).filter(|c| c.status == ServerStatus::Connected)?;
        Some(ConnectionSnapshot {
            client: Arc::clone(conn.client.as_ref()?),
            tools: conn.tools.clone(),
            resources: conn.resources.clone(),
        })
    }

    /// Names of every tracked connection.
    pub async fn tracked(&self) -> Vec<String> {
        self.connections.lock().await.keys().cloned().collect()
    }

    /// Status lines for every tracked connection, sorted by name.
    pub async fn report(&self) -> Vec<ServerReport> {
        let map = self.connections.lock().await;
        let mut report: Vec<ServerReport> = map
            .iter()
            .map(|(name, conn)| ServerReport {
                name: name.clone(),
                status: conn.status,
                tool_count: conn.tools.len(),
                in_flight: conn.in_flight,
            })
            .collect();
        report.sort_by(|a, b| a.name.cmp(&b.name));
        report
    }
}
