//! MCP transports.
//!
//! A [`Transport`] moves opaque application-level frames (one JSON-RPC
//! message per frame) between the client and a server. Two
//! implementations exist: [`stdio::StdioTransport`] speaks
//! newline-delimited JSON to a spawned child process, and
//! [`http::HttpTransport`] posts JSON and consumes either a JSON body
//! or an SSE stream. Request/response correlation lives above the
//! transport, in [`crate::client::McpClient`].

pub mod http;
pub mod stdio;

use async_trait::async_trait;

use crate::error::Result;

/// Frame-level transport contract shared by stdio and HTTP.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one outbound frame. May block briefly on I/O but must
    /// not wait for a response.
    async fn send(&self, frame: String) -> Result<()>;

    /// Yield exactly one inbound frame, or fail with
    /// [`McpError::TransportClosed`](crate::error::McpError::TransportClosed)
    /// once the transport is closed and drained.
    async fn receive(&self) -> Result<String>;

    /// Close the transport. Idempotent; `send`/`receive` fail afterwards
    /// and any parked receiver is woken.
    async fn close(&self);
}

#[cfg(test)]
pub use mock::MockTransport;
