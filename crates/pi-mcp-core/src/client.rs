//! MCP protocol client.
//!
//! One client per server connection. Outbound JSON-RPC requests are
//! multiplexed over the transport by request id: each request parks a
//! oneshot slot in the pending map, and a single reader task
//! dispatches inbound frames to their slots. Responses may arrive in
//! any order; frames without an id (server notifications) are dropped
//! in this version.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::content::{CallToolResult, ResourceInfo, ToolInfo};
use crate::error::{McpError, Result};
use crate::rpc::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::transport::Transport;
use crate::{CLIENT_NAME, CLIENT_VERSION, MCP_PROTOCOL_VERSION};

/// Server identification from the initialize handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    #[serde(default)]
    pub name: String,
    /// Server version.
    #[serde(default)]
    pub version: String,
}

/// Pending response registry: request id to oneshot slot.
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

/// A connected MCP client that has completed the initialize handshake.
pub struct McpClient {
    server: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: PendingMap,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Capabilities reported by the server, kept raw.
    pub capabilities: Value,
    /// Server identification (name + version).
    pub server_info: ServerInfo,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.server)
            .field("server_info", &self.server_info)
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Connect over `transport`: start the reader, run the initialize
    /// handshake, and send the `notifications/initialized` notification.
    pub async fn connect(server: &str, transport: Arc<dyn Transport>) -> Result<Self> {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = spawn_reader(server, Arc::clone(&transport), Arc::clone(&pending));

        let mut client = Self {
            server: server.to_string(),
            transport,
            next_id: AtomicU64::new(1),
            pending,
            reader: Mutex::new(Some(reader)),
            capabilities: Value::Null,
            server_info: ServerInfo::default(),
        };

        let init = client
            .request(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": { "name": CLIENT_NAME, "version": CLIENT_VERSION },
                }),
            )
            .await?;

        client.capabilities = init.get("capabilities").cloned().unwrap_or(Value::Null);
        client.server_info =
            serde_json::from_value(init.get("serverInfo").cloned().unwrap_or_default())
                .unwrap_or_default();

        client
            .notify("notifications/initialized", json!({}))
            .await?;

        debug!(
            server = %client.server,
            server_name = %client.server_info.name,
            "mcp handshake complete"
        );
        Ok(client)
    }

    /// Send one request and await its response by id.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        if let Err(e) = self.transport.send(frame).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(outcome) => outcome,
            // Slot dropped: the reader exited and drained the map.
            Err(_) => Err(McpError::TransportClosed),
        }
    }

    /// Send a notification (no id, no response expected).
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.transport.send(frame).await
    }

    /// List all tools, following `nextCursor` pagination to the end.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        self.list_paginated("tools/list", "tools").await
    }

    /// List all resources, following `nextCursor` pagination to the end.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>> {
        self.list_paginated("resources/list", "resources").await
    }

    async fn list_paginated<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        key: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.request(method, params).await?;
            if let Some(page) = result.get(key).and_then(|v| v.as_array()) {
                for item in page {
                    match serde_json::from_value(item.clone()) {
                        Ok(parsed) => items.push(parsed),
                        Err(e) => {
                            warn!(server = %self.server, error = %e, "skipping malformed {key} entry");
                        }
                    }
                }
            }
            match result.get("nextCursor").and_then(|v| v.as_str()) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Invoke a tool.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        Ok(CallToolResult::from_value(&result))
    }

    /// Read a resource; returns the raw `resources/read` result.
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.request("resources/read", json!({ "uri": uri })).await
    }

    /// Close the client: close the transport, let the reader drain and
    /// fail every pending slot, and wait for it to finish.
    pub async fn close(&self) {
        self.transport.close().await;
        if let Some(handle) = self.reader.lock().await.take() {
            let _ = handle.await;
        }
    }
}

/// Reader task: dispatch inbound frames by id until the transport
/// closes or a frame fails to decode, then fail all pending slots.
fn spawn_reader(server: &str, transport: Arc<dyn Transport>, pending: PendingMap) -> JoinHandle<()> {
    let server = server.to_string();
    tokio::spawn(async move {
        loop {
            let frame = match transport.receive().await {
                Ok(frame) => frame,
                Err(_) => break,
            };
            match serde_json::from_str::<JsonRpcResponse>(&frame) {
                Ok(response) => {
                    let Some(id) = response.id else {
                        debug!(server = %server, "dropping server notification");
                        continue;
                    };
                    let slot = pending.lock().await.remove(&id);
                    match slot {
                        Some(tx) => {
                            let outcome = match response.error {
                                Some(err) => Err(McpError::Rpc {
                                    code: err.code,
                                    message: err.message,
                                }),
                                None => Ok(response.result.unwrap_or(Value::Null)),
                            };
                            let _ = tx.send(outcome);
                        }
                        None => {
                            warn!(server = %server, id, "response with no pending request");
                        }
                    }
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "undecodable frame, closing client");
                    break;
                }
            }
        }

        let mut map = pending.lock().await;
        for (_, tx) in map.drain() {
            let _ = tx.send(Err(McpError::TransportClosed));
        }
    })
}
