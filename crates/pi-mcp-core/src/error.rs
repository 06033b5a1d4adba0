//! Adapter error types.

use thiserror::Error;

/// Errors produced by the MCP adapter core.
#[derive(Error, Debug)]
pub enum McpError {
    /// The base config file was present but malformed.
    #[error("config load failed: {0}")]
    Config(String),

    /// The transport was closed (process exit, stream EOF, explicit close).
    #[error("transport closed")]
    TransportClosed,

    /// Transport- or framing-level failure: non-2xx HTTP, bad SSE,
    /// undecodable frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error returned by the server.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Server-supplied message.
        message: String,
    },

    /// A bounded operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Connecting to a named server failed.
    #[error("failed to connect to \"{server}\": {source}")]
    ConnectionFailed {
        /// The server name from config.
        server: String,
        /// The underlying cause.
        #[source]
        source: Box<McpError>,
    },

    /// Bearer token or OAuth credentials could not be resolved.
    #[error("auth missing for \"{0}\": run /mcp-auth {0} to authenticate")]
    AuthMissing(String),

    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Wrap an error as a connect failure for `server`.
    pub fn connection_failed(server: impl Into<String>, source: McpError) -> Self {
        McpError::ConnectionFailed {
            server: server.into(),
            source: Box::new(source),
        }
    }
}

/// Convenience alias for results in this crate.
pub type Result<T> = std::result::Result<T, McpError>;
