//! MCP configuration schema types.
//!
//! All structs accept both camelCase (the wire form used by
//! `mcp.json` and the third-party configs we import) and snake_case
//! field names via `#[serde(alias)]`. Unknown fields are silently
//! ignored for forward compatibility.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── Server definition ────────────────────────────────────────────────────

/// How a server authenticates outbound HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    /// Static bearer token from config or an environment variable.
    Bearer,
    /// Token file previously stored by the host's OAuth flow.
    Oauth,
}

/// Connection lifecycle policy for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lifecycle {
    /// Connect on first use, evict when idle.
    #[default]
    Lazy,
    /// Connect at session start, never evict.
    Eager,
    /// Connect at session start, reconnect whenever the connection drops.
    KeepAlive,
}

/// Which of a server's tools are registered directly with the host.
///
/// Accepts either a bare boolean or `{"tools": ["name", ...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DirectTools {
    /// Expose all tools (`true`) or none (`false`).
    All(bool),
    /// Expose only the named tools.
    Selected {
        /// Tool names (unprefixed, as the server advertises them).
        tools: Vec<String>,
    },
}

impl DirectTools {
    /// Whether any tool at all may be exposed directly.
    pub fn is_enabled(&self) -> bool {
        match self {
            DirectTools::All(enabled) => *enabled,
            DirectTools::Selected { tools } => !tools.is_empty(),
        }
    }

    /// Whether the named tool may be exposed directly.
    pub fn includes(&self, tool: &str) -> bool {
        match self {
            DirectTools::All(enabled) => *enabled,
            DirectTools::Selected { tools } => tools.iter().any(|t| t == tool),
        }
    }
}

/// Configuration record describing how to reach one MCP server.
///
/// Exactly one of `command` (stdio) or `url` (HTTP) must be set;
/// [`ServerDefinition::validate`] enforces this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerDefinition {
    /// Executable to spawn for a stdio server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Arguments passed to `command`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Extra environment variables for the child process. Values may
    /// reference the parent environment via `${VAR}` or `$env:VAR`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Working directory for the child process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Endpoint for an HTTP server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra HTTP headers. Values support the same `${VAR}` interpolation
    /// as `env`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Authentication scheme for HTTP servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthScheme>,

    /// Literal bearer token (prefer `bearer_token_env` in checked-in config).
    #[serde(
        default,
        rename = "bearerToken",
        alias = "bearer_token",
        skip_serializing_if = "Option::is_none"
    )]
    pub bearer_token: Option<String>,

    /// Name of an environment variable holding the bearer token.
    #[serde(
        default,
        rename = "bearerTokenEnv",
        alias = "bearer_token_env",
        skip_serializing_if = "Option::is_none"
    )]
    pub bearer_token_env: Option<String>,

    /// Connection lifecycle policy.
    #[serde(default)]
    pub lifecycle: Lifecycle,

    /// Idle timeout in minutes before a lazy connection is closed.
    #[serde(
        default,
        rename = "idleTimeout",
        alias = "idle_timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_timeout: Option<u64>,

    /// Whether to list the server's resources and expose them as
    /// `get_*` pseudo-tools.
    #[serde(default, rename = "exposeResources", alias = "expose_resources")]
    pub expose_resources: bool,

    /// Direct tool exposure for this server; falls back to
    /// [`McpSettings::direct_tools`] when absent.
    #[serde(
        default,
        rename = "directTools",
        alias = "direct_tools",
        skip_serializing_if = "Option::is_none"
    )]
    pub direct_tools: Option<DirectTools>,

    /// Forward the child's stderr to the host log.
    #[serde(default)]
    pub debug: bool,
}

impl ServerDefinition {
    /// Check the command/url invariant.
    ///
    /// Returns a human-readable description of the problem when the
    /// definition sets both or neither.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.command, &self.url) {
            (Some(_), Some(_)) => Err("sets both `command` and `url`".into()),
            (None, None) => Err("sets neither `command` nor `url`".into()),
            _ => Ok(()),
        }
    }

    /// Whether this server speaks over a spawned child process.
    pub fn is_stdio(&self) -> bool {
        self.command.is_some()
    }

    /// Effective idle timeout in milliseconds.
    ///
    /// Resolution order: per-server `idle_timeout` (minutes), else 0
    /// (never evict) for eager servers, else the global setting, else
    /// ten minutes. A result of 0 disables eviction.
    pub fn effective_idle_timeout_ms(&self, global_minutes: Option<u64>) -> i64 {
        const MINUTE_MS: i64 = 60_000;
        if let Some(minutes) = self.idle_timeout {
            return minutes as i64 * MINUTE_MS;
        }
        if self.lifecycle == Lifecycle::Eager {
            return 0;
        }
        global_minutes.map(|m| m as i64 * MINUTE_MS).unwrap_or(10 * MINUTE_MS)
    }
}

// ── Root config ──────────────────────────────────────────────────────────

/// Global adapter settings from the `settings` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpSettings {
    /// How tool names are disambiguated across servers.
    #[serde(
        default,
        rename = "toolPrefix",
        alias = "tool_prefix",
        skip_serializing_if = "Option::is_none"
    )]
    pub tool_prefix: Option<ToolPrefix>,

    /// Global idle timeout in minutes.
    #[serde(
        default,
        rename = "idleTimeout",
        alias = "idle_timeout",
        skip_serializing_if = "Option::is_none"
    )]
    pub idle_timeout: Option<u64>,

    /// Default direct tool exposure when a server does not set its own.
    #[serde(
        default,
        rename = "directTools",
        alias = "direct_tools",
        skip_serializing_if = "Option::is_none"
    )]
    pub direct_tools: Option<bool>,
}

impl McpSettings {
    /// The prefix mode, defaulting to [`ToolPrefix::Server`].
    pub fn tool_prefix(&self) -> ToolPrefix {
        self.tool_prefix.unwrap_or(ToolPrefix::Server)
    }

    /// Merge `other` over `self`, field by field (last write wins).
    pub fn overlay(&mut self, other: &McpSettings) {
        if other.tool_prefix.is_some() {
            self.tool_prefix = other.tool_prefix;
        }
        if other.idle_timeout.is_some() {
            self.idle_timeout = other.idle_timeout;
        }
        if other.direct_tools.is_some() {
            self.direct_tools = other.direct_tools;
        }
    }
}

/// Tool name prefix mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPrefix {
    /// Tool names pass through verbatim.
    None,
    /// Server name with a trailing `-mcp`/`mcp` dropped.
    Short,
    /// Full server name (the default).
    Server,
}

/// The canonical merged configuration: servers, imports, settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    /// Server definitions keyed by name.
    #[serde(
        default,
        rename = "mcpServers",
        alias = "mcp-servers",
        alias = "mcp_servers",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub servers: HashMap<String, ServerDefinition>,

    /// Third-party config sources to merge in.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,

    /// Global adapter settings.
    #[serde(default)]
    pub settings: McpSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_parses_camel_case() {
        let json = r#"{
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-foo"],
            "env": {"TOKEN": "${GH_TOKEN}"},
            "idleTimeout": 5,
            "exposeResources": true,
            "bearerTokenEnv": "FOO_TOKEN",
            "lifecycle": "keep-alive"
        }"#;
        let def: ServerDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.command.as_deref(), Some("npx"));
        assert_eq!(def.args.len(), 2);
        assert_eq!(def.idle_timeout, Some(5));
        assert!(def.expose_resources);
        assert_eq!(def.bearer_token_env.as_deref(), Some("FOO_TOKEN"));
        assert_eq!(def.lifecycle, Lifecycle::KeepAlive);
    }

    #[test]
    fn definition_parses_snake_case_aliases() {
        let json = r#"{"url": "https://example.com/mcp", "idle_timeout": 2, "expose_resources": true}"#;
        let def: ServerDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.url.as_deref(), Some("https://example.com/mcp"));
        assert_eq!(def.idle_timeout, Some(2));
        assert!(def.expose_resources);
    }

    #[test]
    fn definition_defaults() {
        let def: ServerDefinition = serde_json::from_str(r#"{"command": "echo"}"#).unwrap();
        assert_eq!(def.lifecycle, Lifecycle::Lazy);
        assert!(def.args.is_empty());
        assert!(def.env.is_empty());
        assert!(!def.expose_resources);
        assert!(!def.debug);
        assert!(def.direct_tools.is_none());
    }

    #[test]
    fn validate_requires_exactly_one_transport() {
        let stdio: ServerDefinition = serde_json::from_str(r#"{"command": "echo"}"#).unwrap();
        assert!(stdio.validate().is_ok());

        let http: ServerDefinition =
            serde_json::from_str(r#"{"url": "http://localhost:3000"}"#).unwrap();
        assert!(http.validate().is_ok());

        let both: ServerDefinition =
            serde_json::from_str(r#"{"command": "echo", "url": "http://x"}"#).unwrap();
        assert!(both.validate().is_err());

        let neither = ServerDefinition::default();
        assert!(neither.validate().is_err());
    }

    #[test]
    fn lifecycle_kebab_case() {
        let lc: Lifecycle = serde_json::from_str("\"keep-alive\"").unwrap();
        assert_eq!(lc, Lifecycle::KeepAlive);
        assert_eq!(serde_json::to_string(&Lifecycle::KeepAlive).unwrap(), "\"keep-alive\"");
        assert_eq!(serde_json::to_string(&Lifecycle::Lazy).unwrap(), "\"lazy\"");
    }

    #[test]
    fn direct_tools_forms() {
        let all: DirectTools = serde_json::from_str("true").unwrap();
        assert!(all.is_enabled());
        assert!(all.includes("anything"));

        let none: DirectTools = serde_json::from_str("false").unwrap();
        assert!(!none.is_enabled());
        assert!(!none.includes("anything"));

        let picked: DirectTools = serde_json::from_str(r#"{"tools": ["a", "b"]}"#).unwrap();
        assert!(picked.is_enabled());
        assert!(picked.includes("a"));
        assert!(!picked.includes("c"));
    }

    #[test]
    fn effective_idle_timeout_resolution() {
        let mut def = ServerDefinition {
            command: Some("echo".into()),
            ..Default::default()
        };
        // Global default: ten minutes.
        assert_eq!(def.effective_idle_timeout_ms(None), 600_000);
        // Global setting wins over the built-in default.
        assert_eq!(def.effective_idle_timeout_ms(Some(2)), 120_000);
        // Per-server value wins over everything.
        def.idle_timeout = Some(1);
        assert_eq!(def.effective_idle_timeout_ms(Some(2)), 60_000);
        // Eager servers are never evicted unless they opt in.
        def.idle_timeout = None;
        def.lifecycle = Lifecycle::Eager;
        assert_eq!(def.effective_idle_timeout_ms(Some(2)), 0);
        def.idle_timeout = Some(3);
        assert_eq!(def.effective_idle_timeout_ms(Some(2)), 180_000);
    }

    #[test]
    fn config_accepts_both_server_keys() {
        let camel: McpConfig =
            serde_json::from_str(r#"{"mcpServers": {"a": {"command": "x"}}}"#).unwrap();
        assert!(camel.servers.contains_key("a"));

        let kebab: McpConfig =
            serde_json::from_str(r#"{"mcp-servers": {"b": {"command": "x"}}}"#).unwrap();
        assert!(kebab.servers.contains_key("b"));
    }

    #[test]
    fn settings_overlay_last_write_wins() {
        let mut base = McpSettings {
            tool_prefix: Some(ToolPrefix::Short),
            idle_timeout: Some(5),
            direct_tools: None,
        };
        let project = McpSettings {
            tool_prefix: None,
            idle_timeout: Some(1),
            direct_tools: Some(true),
        };
        base.overlay(&project);
        assert_eq!(base.tool_prefix, Some(ToolPrefix::Short));
        assert_eq!(base.idle_timeout, Some(1));
        assert_eq!(base.direct_tools, Some(true));
    }

    #[test]
    fn settings_default_prefix_is_server() {
        let settings = McpSettings::default();
        assert_eq!(settings.tool_prefix(), ToolPrefix::Server);
    }

    #[test]
    fn unknown_fields_ignored() {
        let json = r#"{"command": "x", "someFutureField": {"nested": true}}"#;
        let def: ServerDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.command.as_deref(), Some("x"));
    }
}
