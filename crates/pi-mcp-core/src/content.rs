//! Data model shared between the client, the caches, and the adapter.
//!
//! MCP content is schemaless by design, so [`McpContent`] keeps an
//! [`McpContent::Other`] variant holding the raw JSON of any type this
//! version does not know, and input schemas travel as opaque
//! `serde_json::Value`s all the way to the host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Tools and resources as servers advertise them ────────────────────────

/// One tool from a `tools/list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    /// Tool name as the server advertises it.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input, forwarded unchanged.
    #[serde(
        default,
        rename = "inputSchema",
        alias = "input_schema",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_schema: Option<Value>,
}

/// One resource from a `resources/list` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Resource URI.
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

// ── Host-visible tool metadata ───────────────────────────────────────────

/// What the host knows about one adapter-provided tool.
///
/// `resource_uri` is set for resource-backed pseudo-tools, whose
/// invocation reads the resource instead of calling a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    /// Name after prefixing, as registered with the host.
    pub prefixed_name: String,
    /// Name as the server advertises it.
    pub original_name: String,
    /// Human-readable description.
    pub description: String,
    /// Opaque input schema, when the server provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// URI backing a resource pseudo-tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_uri: Option<String>,
}

// ── MCP content ──────────────────────────────────────────────────────────

/// One content item from a `tools/call` result.
#[derive(Debug, Clone, PartialEq)]
pub enum McpContent {
    /// Plain text.
    Text {
        /// The text payload.
        text: String,
    },
    /// Base64 image data.
    Image {
        /// Base64-encoded bytes.
        data: String,
        /// MIME type, defaulting to `image/png`.
        mime_type: String,
    },
    /// An embedded resource.
    Resource {
        /// Resource URI.
        uri: String,
        /// Inline text, when textual.
        text: Option<String>,
        /// Base64 blob, when binary.
        blob: Option<String>,
    },
    /// A link to a resource without its contents.
    ResourceLink {
        /// Display name.
        name: String,
        /// Resource URI.
        uri: String,
    },
    /// Audio data; only the MIME type is surfaced.
    Audio {
        /// MIME type of the audio payload.
        mime_type: String,
    },
    /// Any content type this version does not know, preserved raw so
    /// it can be re-serialized exactly.
    Other(Value),
}

impl McpContent {
    /// Decode one wire content item.
    pub fn from_value(value: &Value) -> Self {
        let get_str = |v: &Value, key: &str| -> Option<String> {
            v.get(key).and_then(|s| s.as_str()).map(String::from)
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("text") => McpContent::Text {
                text: get_str(value, "text").unwrap_or_default(),
            },
            Some("image") => McpContent::Image {
                data: get_str(value, "data").unwrap_or_default(),
                mime_type: get_str(value, "mimeType").unwrap_or_else(|| "image/png".into()),
            },
            Some("resource") => {
                let resource = value.get("resource").unwrap_or(value);
                McpContent::Resource {
                    uri: get_str(resource, "uri").unwrap_or_default(),
                    text: get_str(resource, "text"),
                    blob: get_str(resource, "blob"),
                }
            }
            Some("resource_link") => McpContent::ResourceLink {
                name: get_str(value, "name").unwrap_or_default(),
                uri: get_str(value, "uri").unwrap_or_default(),
            },
            Some("audio") => McpContent::Audio {
                mime_type: get_str(value, "mimeType").unwrap_or_default(),
            },
            _ => McpContent::Other(value.clone()),
        }
    }
}

/// The decoded result of a `tools/call`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallToolResult {
    /// Content items produced by the tool.
    pub content: Vec<McpContent>,
    /// Whether the tool reported a failure.
    pub is_error: bool,
}

impl CallToolResult {
    /// Decode a raw `tools/call` result value.
    pub fn from_value(result: &Value) -> Self {
        let content = result
            .get("content")
            .and_then(|c| c.as_array())
            .map(|items| items.iter().map(McpContent::from_value).collect())
            .unwrap_or_default();
        let is_error = result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Self { content, is_error }
    }
}

// ── Host content blocks ──────────────────────────────────────────────────

/// A content block in the shape the host's tool dispatch expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    /// Plain text.
    #[serde(rename = "text")]
    Text {
        /// The text payload.
        text: String,
    },
    /// Base64 image data.
    #[serde(rename = "image")]
    Image {
        /// Base64-encoded bytes.
        data: String,
        /// MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
}

impl ContentBlock {
    /// Convenience constructor for a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// Transform one MCP content item into a host content block.
pub fn to_content_block(content: &McpContent) -> ContentBlock {
    match content {
        McpContent::Text { text } => ContentBlock::text(text.clone()),
        McpContent::Image { data, mime_type } => ContentBlock::Image {
            data: data.clone(),
            mime_type: mime_type.clone(),
        },
        McpContent::Resource { uri, text, blob } => {
            let body = text
                .clone()
                .or_else(|| blob.clone())
                .unwrap_or_default();
            ContentBlock::text(format!("[Resource: {uri}]\n{body}"))
        }
        McpContent::ResourceLink { name, uri } => {
            ContentBlock::text(format!("[Resource Link: {name}]\nURI: {uri}"))
        }
        McpContent::Audio { mime_type } => {
            ContentBlock::text(format!("[Audio content: {mime_type}]"))
        }
        McpContent::Other(raw) => {
            ContentBlock::text(serde_json::to_string(raw).unwrap_or_default())
        }
    }
}
