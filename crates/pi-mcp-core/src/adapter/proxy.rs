//! The unified `mcp` proxy tool.
//!
//! One host tool multiplexing every configured server. Field
//! precedence in an invocation: `tool` > `connect` > `describe` >
//! `search` > `server` > `status`. Every outcome, including failures,
//! is a text block.

use std::sync::Arc;

use regex::RegexBuilder;
use serde_json::{Value, json};

use super::McpAdapter;
use crate::content::{ContentBlock, ToolMetadata};

impl McpAdapter {
    /// Dispatch one proxy invocation.
    pub async fn proxy_call(self: &Arc<Self>, params: Value) -> Vec<ContentBlock> {
        let get_str =
            |key: &str| params.get(key).and_then(|v| v.as_str()).map(String::from);
        let get_bool = |key: &str| {
            params
                .get(key)
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
        };
        let server = get_str("server");

        if let Some(tool) = get_str("tool") {
            let args = match parse_args(params.get("args")) {
                Ok(args) => args,
                Err(message) => return vec![ContentBlock::text(message)],
            };
            return self.call_tool(&tool, args, server.as_deref()).await;
        }
        if let Some(name) = get_str("connect") {
            return self.proxy_connect(&name).await;
        }
        if let Some(name) = get_str("describe") {
            return self.proxy_describe(&name).await;
        }
        if let Some(query) = get_str("search") {
            return self
                .proxy_search(
                    &query,
                    get_bool("regex"),
                    server.as_deref(),
                    get_bool("includeSchemas"),
                )
                .await;
        }
        if let Some(server) = server {
            return self.proxy_server_list(&server).await;
        }
        self.proxy_status().await
    }

    /// `connect` mode: force a reconnect and report what was found.
    async fn proxy_connect(self: &Arc<Self>, name: &str) -> Vec<ContentBlock> {
        if !self.loaded.config.servers.contains_key(name) {
            return vec![ContentBlock::text(format!(
                "Unknown server \"{name}\". Configured: {}",
                self.server_names().join(", ")
            ))];
        }
        self.manager.close(name).await;
        match self.connect_and_refresh(name).await {
            Ok(snapshot) => vec![ContentBlock::text(format!(
                "Connected to \"{name}\": {} tools, {} resources.",
                snapshot.tools.len(),
                snapshot.resources.len()
            ))],
            Err(e) => vec![ContentBlock::text(format!(
                "Failed to connect to \"{name}\": {e}"
            ))],
        }
    }

    /// `describe` mode: full detail for one tool.
    async fn proxy_describe(&self, tool_name: &str) -> Vec<ContentBlock> {
        let Some((server, tool)) = self.find_tool(tool_name, None).await else {
            return vec![ContentBlock::text(format!(
                "Tool \"{tool_name}\" not found. Available: {}",
                self.known_tool_names().await.join(", ")
            ))];
        };

        let mut text = format!(
            "Tool: {}\nServer: {}\nOriginal name: {}\nDescription: {}",
            tool.prefixed_name, server, tool.original_name, tool.description
        );
        if let Some(uri) = &tool.resource_uri {
            text.push_str(&format!("\nResource URI: {uri}"));
        }
        let schema = tool
            .input_schema
            .clone()
            .unwrap_or_else(|| json!({"type": "object"}));
        text.push_str(&format!(
            "\nInput schema:\n{}",
            serde_json::to_string_pretty(&schema).unwrap_or_default()
        ));
        vec![ContentBlock::text(text)]
    }

    /// `search` mode: token or regex match over names and descriptions.
    async fn proxy_search(
        &self,
        query: &str,
        use_regex: bool,
        server_filter: Option<&str>,
        include_schemas: bool,
    ) -> Vec<ContentBlock> {
        // Compile once, match many.
        let pattern = if use_regex {
            match RegexBuilder::new(query).case_insensitive(true).build() {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    return vec![ContentBlock::text(format!("Invalid regex \"{query}\": {e}"))];
                }
            }
        } else {
            None
        };
        let tokens: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();

        let matches_tool = |tool: &ToolMetadata| -> bool {
            let name = &tool.prefixed_name;
            let description = &tool.description;
            match &pattern {
                Some(pattern) => pattern.is_match(name) || pattern.is_match(description),
                None => {
                    let name = name.to_lowercase();
                    let description = description.to_lowercase();
                    tokens
                        .iter()
                        .all(|t| name.contains(t) || description.contains(t))
                }
            }
        };

        let metadata = self.tool_metadata().await;
        let mut lines = Vec::new();
        let mut servers: Vec<&String> = metadata.keys().collect();
        servers.sort();
        for server in servers {
            if server_filter.is_some_and(|f| f != server.as_str()) {
                continue;
            }
            for tool in &metadata[server] {
                if matches_tool(tool) {
                    lines.push(render_tool_line(server, tool, include_schemas));
                }
            }
        }

        if lines.is_empty() {
            return vec![ContentBlock::text(format!(
                "No tools matching \"{query}\"."
            ))];
        }
        vec![ContentBlock::text(format!(
            "Found {} tool(s) matching \"{query}\":\n{}",
            lines.len(),
            lines.join("\n")
        ))]
    }

    /// Bare `server` mode: list that server's cached tools.
    async fn proxy_server_list(&self, server: &str) -> Vec<ContentBlock> {
        let metadata = self.tool_metadata().await;
        let Some(tools) = metadata.get(server) else {
            return vec![ContentBlock::text(format!(
                "No tools known for \"{server}\". Configured: {}",
                self.server_names().join(", ")
            ))];
        };
        let lines: Vec<String> = tools
            .iter()
            .map(|tool| render_tool_line(server, tool, false))
            .collect();
        vec![ContentBlock::text(format!(
            "Tools on \"{server}\" ({}):\n{}",
            tools.len(),
            lines.join("\n")
        ))]
    }

    /// `status` mode: per-server summary plus totals.
    async fn proxy_status(&self) -> Vec<ContentBlock> {
        let metadata = self.tool_metadata().await;
        let mut lines = Vec::new();
        let mut total_tools = 0usize;

        for name in self.server_names() {
            let def = &self.loaded.config.servers[&name];
            let tool_count = metadata.get(&name).map(Vec::len).unwrap_or(0);
            total_tools += tool_count;
            let status = match self.manager.status(&name).await {
                Some(status) => format!("{status:?}").to_lowercase(),
                None => "disconnected".to_string(),
            };
            let lifecycle = serde_json::to_string(&def.lifecycle)
                .unwrap_or_default()
                .trim_matches('"')
                .to_string();
            let source = self
                .provenance(&name)
                .map(|p| p.source.clone())
                .unwrap_or_else(|| "config".into());
            lines.push(format!(
                "  {name}: {status}, {tool_count} tools, lifecycle {lifecycle}, from {source}"
            ));
        }

        vec![ContentBlock::text(format!(
            "MCP servers ({}, {} tools):\n{}",
            lines.len(),
            total_tools,
            lines.join("\n")
        ))]
    }

    /// Human-readable summary used as the proxy tool's description.
    pub async fn proxy_description(&self) -> String {
        let metadata = self.tool_metadata().await;
        let mut parts = Vec::new();
        for name in self.server_names() {
            let count = metadata.get(&name).map(Vec::len).unwrap_or(0);
            parts.push(format!("{name} ({count} tools)"));
        }
        if parts.is_empty() {
            "Interact with MCP servers. No servers configured.".to_string()
        } else {
            format!(
                "Interact with MCP servers: search/describe/call tools, connect servers, report status. Servers: {}.",
                parts.join(", ")
            )
        }
    }

    /// Configured server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded.config.servers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// One search/list line for a tool, optionally with its schema.
fn render_tool_line(server: &str, tool: &ToolMetadata, include_schema: bool) -> String {
    let mut line = format!(
        "- {} ({server}): {}",
        tool.prefixed_name, tool.description
    );
    if include_schema && let Some(schema) = &tool.input_schema {
        line.push_str("\n  schema: ");
        line.push_str(&serde_json::to_string_pretty(schema).unwrap_or_default());
    }
    line
}

/// Parse the proxy `args` field: a JSON string, an object, or absent.
fn parse_args(raw: Option<&Value>) -> Result<Value, String> {
    match raw {
        None | Some(Value::Null) => Ok(json!({})),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(json!({})),
        Some(Value::String(s)) => {
            serde_json::from_str(s).map_err(|e| format!("Invalid args JSON: {e}"))
        }
        Some(value) => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{seed_cache, write_config};
    use super::*;
    use crate::manager::Connector;
    use crate::testkit::{FakeConnector, FakeServer};
    use pi_mcp_types::config::ServerDefinition;
    use std::path::Path;

    fn echo_def() -> ServerDefinition {
        ServerDefinition {
            command: Some("/bin/echo".into()),
            ..Default::default()
        }
    }

    fn text_of(blocks: &[ContentBlock]) -> String {
        match &blocks[0] {
            ContentBlock::Text { text } => text.clone(),
            other => panic!("expected text, got {other:?}"),
        }
    }

    fn xcode_adapter(agent: &Path, cwd: &Path) -> Arc<McpAdapter> {
        write_config(
            agent,
            &serde_json::json!({"mcpServers": {"xcode-mcp": {"command": "/bin/echo"}}}),
        );
        seed_cache(agent, "xcode-mcp", &echo_def(), &["xcodebuild_list_sims", "xcodebuild_run"]);
        McpAdapter::with_connector(
            agent,
            cwd,
            None,
            Arc::new(
                FakeConnector::new().serve(
                    "xcode-mcp",
                    FakeServer::with_tools(&["xcodebuild_list_sims", "xcodebuild_run"]),
                ),
            ) as Arc<dyn Connector>,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn search_then_call_with_prefix() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let blocks = adapter.proxy_call(json!({"search": "sims"})).await;
        let text = text_of(&blocks);
        assert!(text.contains("xcode_mcp_xcodebuild_list_sims"), "got: {text}");

        let blocks = adapter
            .proxy_call(json!({"tool": "xcode_mcp_xcodebuild_list_sims", "args": "{}"}))
            .await;
        assert_eq!(text_of(&blocks), "ran xcodebuild_list_sims");
        assert!(adapter.manager().is_connected("xcode-mcp").await);
    }

    #[tokio::test]
    async fn tool_takes_precedence_over_other_fields() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let blocks = adapter
            .proxy_call(json!({
                "tool": "xcode_mcp_xcodebuild_run",
                "search": "ignored",
                "describe": "ignored"
            }))
            .await;
        assert_eq!(text_of(&blocks), "ran xcodebuild_run");
    }

    #[tokio::test]
    async fn search_tokens_all_must_match() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let text = text_of(&adapter.proxy_call(json!({"search": "xcodebuild list"})).await);
        assert!(text.contains("list_sims"));
        assert!(!text.contains("xcodebuild_run\n"));

        let text = text_of(&adapter.proxy_call(json!({"search": "nothing matches this"})).await);
        assert!(text.contains("No tools matching"));
    }

    #[tokio::test]
    async fn search_regex_mode() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let text = text_of(
            &adapter
                .proxy_call(json!({"search": "SIMS$", "regex": true}))
                .await,
        );
        assert!(text.contains("list_sims"), "got: {text}");

        let text = text_of(
            &adapter
                .proxy_call(json!({"search": "[unclosed", "regex": true}))
                .await,
        );
        assert!(text.contains("Invalid regex"));
    }

    #[tokio::test]
    async fn search_includes_schemas_when_asked() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let text = text_of(
            &adapter
                .proxy_call(json!({"search": "run", "includeSchemas": true}))
                .await,
        );
        assert!(text.contains("\"type\": \"object\""), "got: {text}");
    }

    #[tokio::test]
    async fn describe_shows_schema_and_origin() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let text = text_of(
            &adapter
                .proxy_call(json!({"describe": "xcode_mcp_xcodebuild_run"}))
                .await,
        );
        assert!(text.contains("Server: xcode-mcp"));
        assert!(text.contains("Original name: xcodebuild_run"));
        assert!(text.contains("Input schema:"));
    }

    #[tokio::test]
    async fn connect_mode_reports_counts() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let text = text_of(&adapter.proxy_call(json!({"connect": "xcode-mcp"})).await);
        assert!(text.contains("Connected to \"xcode-mcp\": 2 tools"), "got: {text}");

        let text = text_of(&adapter.proxy_call(json!({"connect": "ghost"})).await);
        assert!(text.contains("Unknown server"));
    }

    #[tokio::test]
    async fn server_filter_alone_lists_tools() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let text = text_of(&adapter.proxy_call(json!({"server": "xcode-mcp"})).await);
        assert!(text.contains("Tools on \"xcode-mcp\" (2)"));
        assert!(text.contains("xcode_mcp_xcodebuild_run"));
    }

    #[tokio::test]
    async fn status_mode_is_default() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let text = text_of(&adapter.proxy_call(json!({})).await);
        assert!(text.contains("MCP servers (1, 2 tools)"), "got: {text}");
        assert!(text.contains("xcode-mcp: disconnected"));
        assert!(text.contains("lifecycle lazy"));
        assert!(text.contains("from config"));
    }

    #[tokio::test]
    async fn invalid_args_json_is_reported() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let text = text_of(
            &adapter
                .proxy_call(json!({"tool": "xcode_mcp_xcodebuild_run", "args": "{not json"}))
                .await,
        );
        assert!(text.contains("Invalid args JSON"));
    }

    #[tokio::test]
    async fn args_accepts_object_form() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());

        let blocks = adapter
            .proxy_call(json!({"tool": "xcode_mcp_xcodebuild_run", "args": {"target": "app"}}))
            .await;
        assert_eq!(text_of(&blocks), "ran xcodebuild_run");
    }

    #[tokio::test]
    async fn proxy_description_summarizes_servers() {
        let agent = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        let adapter = xcode_adapter(agent.path(), cwd.path());
        let description = adapter.proxy_description().await;
        assert!(description.contains("xcode-mcp (2 tools)"));
    }

    #[test]
    fn parse_args_forms() {
        assert_eq!(parse_args(None).unwrap(), json!({}));
        assert_eq!(parse_args(Some(&json!(""))).unwrap(), json!({}));
        assert_eq!(
            parse_args(Some(&json!("{\"a\":1}"))).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            parse_args(Some(&json!({"a": 1}))).unwrap(),
            json!({"a": 1})
        );
        assert!(parse_args(Some(&json!("{bad"))).is_err());
    }
}
