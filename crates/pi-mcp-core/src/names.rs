//! Tool and resource naming.
//!
//! Tools from different servers land in one flat host namespace, so
//! names get a server-derived prefix (configurable), resources become
//! `get_*` pseudo-tools, and a reserved set protects the host's own
//! built-in tools from being shadowed.

use pi_mcp_types::config::ToolPrefix;

/// Built-in host tools that adapter tools must never shadow.
pub const RESERVED_HOST_TOOLS: &[&str] = &[
    "read", "bash", "edit", "write", "grep", "find", "ls", "mcp", "subagent",
];

/// Produce the host-visible name for `tool` on `server`.
pub fn format_tool_name(prefix: ToolPrefix, server: &str, tool: &str) -> String {
    match prefix {
        ToolPrefix::None => tool.to_string(),
        ToolPrefix::Short => format!("{}_{tool}", short_prefix(server)),
        ToolPrefix::Server => format!("{}_{tool}", server.replace('-', "_")),
    }
}

/// Server name with a trailing `-mcp`/`mcp` dropped and `-` mapped to
/// `_`; an empty result becomes `"mcp"`.
fn short_prefix(server: &str) -> String {
    let lower = server.to_ascii_lowercase();
    let mut trimmed = server;
    if lower.ends_with("mcp") {
        trimmed = &trimmed[..trimmed.len() - 3];
        if trimmed.ends_with('-') {
            trimmed = &trimmed[..trimmed.len() - 1];
        }
    }
    let prefix = trimmed.replace('-', "_");
    if prefix.is_empty() {
        "mcp".to_string()
    } else {
        prefix
    }
}

/// Turn a resource name into its pseudo-tool name.
///
/// Lowercases, maps every non-alphanumeric to `_`, guards names that
/// would start with a digit with `resource_`, and prepends `get_`.
pub fn resource_tool_name(resource_name: &str) -> String {
    let mut sanitized: String = resource_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if sanitized.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        sanitized = format!("resource_{sanitized}");
    }
    format!("get_{sanitized}")
}

/// Compare tool names treating `-` and `_` as equivalent.
pub fn names_match(a: &str, b: &str) -> bool {
    a == b || a.replace('-', "_") == b.replace('-', "_")
}
