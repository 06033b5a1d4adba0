//! Shared test fixtures: a scripted in-memory MCP server and a
//! connector that serves it, so pool and adapter tests run without
//! processes or sockets.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use pi_mcp_types::config::ServerDefinition;

use crate::error::{McpError, Result};
use crate::manager::Connector;
use crate::transport::{MockTransport, Transport};

/// Behavior of one scripted server.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    /// Tool objects for `tools/list`.
    pub tools: Vec<Value>,
    /// Resource objects for `resources/list`.
    pub resources: Vec<Value>,
    /// Make every `tools/call` return a JSON-RPC error.
    pub fail_calls: bool,
}

impl FakeServer {
    pub fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names.iter().map(|n| tool_json(n)).collect(),
            ..Default::default()
        }
    }
}

/// A tool object as a server would advertise it.
pub fn tool_json(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("The {name} tool"),
        "inputSchema": { "type": "object", "properties": {} },
    })
}

/// Script closure implementing the MCP conversation for `server`.
pub fn mcp_script(server: FakeServer) -> impl Fn(&str) -> Vec<String> + Send + Sync {
    move |frame: &str| {
        let req: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        let Some(id) = req.get("id").and_then(|v| v.as_u64()) else {
            return Vec::new();
        };
        let method = req.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let response = match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "fake", "version": "0.0.1" },
                },
            }),
            "tools/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "tools": server.tools.clone() },
            }),
            "resources/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "resources": server.resources.clone() },
            }),
            "tools/call" if server.fail_calls => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32000, "message": "scripted failure" },
            }),
            "tools/call" => {
                let name = req["params"]["name"].as_str().unwrap_or("");
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "content": [{ "type": "text", "text": format!("ran {name}") }],
                        "isError": false,
                    },
                })
            }
            "resources/read" => {
                let uri = req["params"]["uri"].as_str().unwrap_or("");
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "contents": [{ "uri": uri, "text": format!("contents of {uri}") }],
                    },
                })
            }
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "method not found" },
            }),
        };
        vec![response.to_string()]
    }
}

/// Connector serving scripted servers by name.
pub struct FakeConnector {
    servers: HashMap<String, FakeServer>,
    refuse: HashSet<String>,
    pub connect_count: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            servers: HashMap::new(),
            refuse: HashSet::new(),
            connect_count: AtomicUsize::new(0),
        }
    }

    pub fn serve(mut self, name: &str, server: FakeServer) -> Self {
        self.servers.insert(name.to_string(), server);
        self
    }

    /// Make connects to `name` fail.
    pub fn refuse(mut self, name: &str) -> Self {
        self.refuse.insert(name.to_string());
        self
    }

    pub fn connects(&self) -> usize {
        self.connect_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, name: &str, _def: &ServerDefinition) -> Result<Arc<dyn Transport>> {
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        if self.refuse.contains(name) {
            return Err(McpError::Protocol(format!("refused connect to {name}")));
        }
        let server = self
            .servers
            .get(name)
            .cloned()
            .unwrap_or_default();
        Ok(Arc::new(MockTransport::scripted(mcp_script(server))))
    }
}
