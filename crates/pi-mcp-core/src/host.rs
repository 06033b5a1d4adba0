//! Host integration surface.
//!
//! The host exposes tools at session construction, so the adapter
//! publishes ready-to-register [`ToolSpec`] descriptors
//! ([`build_proxy_tool`], [`build_direct_tools`]) and wires everything
//! else (flags, commands, session events) through a [`HookApi`] the
//! host hands to [`install`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::adapter::McpAdapter;
use crate::auth::oauth_token_path;
use crate::content::ContentBlock;

/// Async tool body: JSON arguments in, host content blocks out.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Vec<ContentBlock>> + Send>> + Send + Sync>;

/// Async command body: CLI-style arguments in, printable text out.
pub type CommandHandler =
    Arc<dyn Fn(Vec<String>) -> Pin<Box<dyn Future<Output = String> + Send>> + Send + Sync>;

/// Async session event handler.
pub type EventHandler =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Session lifecycle events the adapter subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// Session construction finished; async init may begin.
    Start,
    /// Session is shutting down.
    Shutdown,
}

/// The registration surface the host offers to extensions.
pub trait HookApi {
    /// Register a CLI flag.
    fn register_flag(&mut self, name: &str, description: &str);
    /// Register a slash command.
    fn register_command(&mut self, name: &str, description: &str, handler: CommandHandler);
    /// Subscribe to a session event.
    fn on(&mut self, event: SessionEvent, handler: EventHandler);
}

/// A ready-to-register host tool descriptor.
#[derive(Clone)]
pub struct ToolSpec {
    /// Host-visible tool name.
    pub name: String,
    /// Description shown to the model.
    pub description: String,
    /// JSON Schema for the tool parameters.
    pub input_schema: Value,
    /// The tool body.
    pub handler: ToolHandler,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Parameter schema of the unified proxy tool.
fn proxy_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "tool": { "type": "string", "description": "Tool to call (prefixed name)" },
            "args": { "type": "string", "description": "JSON arguments for the tool" },
            "connect": { "type": "string", "description": "Server to (re)connect" },
            "describe": { "type": "string", "description": "Tool to describe" },
            "search": { "type": "string", "description": "Query over tool names and descriptions" },
            "regex": { "type": "boolean", "description": "Treat search as a regex" },
            "includeSchemas": { "type": "boolean", "description": "Include input schemas in search output" },
            "server": { "type": "string", "description": "Restrict to one server" }
        }
    })
}

/// Build the unified `mcp` proxy tool.
pub async fn build_proxy_tool(adapter: Arc<McpAdapter>) -> ToolSpec {
    let description = adapter.proxy_description().await;
    let handler_adapter = Arc::clone(&adapter);
    ToolSpec {
        name: "mcp".into(),
        description,
        input_schema: proxy_schema(),
        handler: Arc::new(move |params| {
            let adapter = Arc::clone(&handler_adapter);
            Box::pin(async move { adapter.proxy_call(params).await })
        }),
    }
}

/// Build one direct tool per cached spec; each lazily connects and
/// forwards on invocation.
pub async fn build_direct_tools(adapter: Arc<McpAdapter>) -> Vec<ToolSpec> {
    let mut specs = Vec::new();
    for direct in adapter.direct_tool_specs().await {
        let name = direct.metadata.prefixed_name.clone();
        let schema = direct
            .metadata
            .input_schema
            .clone()
            .unwrap_or_else(|| json!({"type": "object"}));
        let handler_adapter = Arc::clone(&adapter);
        let handler_name = name.clone();
        let server = direct.server.clone();
        specs.push(ToolSpec {
            name,
            description: direct.metadata.description.clone(),
            input_schema: schema,
            handler: Arc::new(move |params| {
                let adapter = Arc::clone(&handler_adapter);
                let tool = handler_name.clone();
                let server = server.clone();
                Box::pin(async move { adapter.call_tool(&tool, params, Some(&server)).await })
            }),
        });
    }
    specs
}

/// Wire the adapter into the host: flags, the `mcp` and `mcp-auth`
/// commands, and the session start/shutdown events.
pub fn install(adapter: Arc<McpAdapter>, api: &mut dyn HookApi) {
    api.register_flag("mcp-config", "Override the MCP config file path");

    let status_adapter = Arc::clone(&adapter);
    api.register_command(
        "mcp",
        "Show MCP server status",
        Arc::new(move |_args| {
            let adapter = Arc::clone(&status_adapter);
            Box::pin(async move { blocks_to_text(&adapter.proxy_call(json!({})).await) })
        }),
    );

    let auth_adapter = Arc::clone(&adapter);
    api.register_command(
        "mcp-auth",
        "Print OAuth setup instructions for an MCP server",
        Arc::new(move |args| {
            let adapter = Arc::clone(&auth_adapter);
            Box::pin(async move { auth_instructions(&adapter, args.first().map(String::as_str)) })
        }),
    );

    let start_adapter = Arc::clone(&adapter);
    api.on(
        SessionEvent::Start,
        Arc::new(move || {
            let adapter = Arc::clone(&start_adapter);
            Box::pin(async move { adapter.start().await })
        }),
    );

    let shutdown_adapter = Arc::clone(&adapter);
    api.on(
        SessionEvent::Shutdown,
        Arc::new(move || {
            let adapter = Arc::clone(&shutdown_adapter);
            Box::pin(async move { adapter.shutdown().await })
        }),
    );
}

/// Flatten content blocks into printable text.
pub fn blocks_to_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => text.clone(),
            ContentBlock::Image { mime_type, .. } => format!("[image: {mime_type}]"),
        })
        .collect::<Vec<String>>()
        .join("\n")
}

/// The `mcp-auth <server>` command body.
fn auth_instructions(adapter: &McpAdapter, server: Option<&str>) -> String {
    let Some(server) = server else {
        return format!(
            "Usage: mcp-auth <server>\nConfigured servers: {}",
            adapter.server_names().join(", ")
        );
    };
    if !adapter.server_names().iter().any(|s| s == server) {
        return format!(
            "Unknown server \"{server}\". Configured: {}",
            adapter.server_names().join(", ")
        );
    }
    let path = oauth_token_path(adapter.agent_dir(), server);
    format!(
        "To authenticate \"{server}\", complete the provider's OAuth flow and store the \
         token file at:\n  {}\nThe file must contain at least {{\"access_token\": \"...\"}}; \
         an \"expiresAt\" timestamp (unix millis) is honored when present.",
        path.display()
    )
}
