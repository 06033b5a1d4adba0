//! MCP (Model Context Protocol) adapter core for the pi coding agent.
//!
//! Lets the host discover, connect to, and invoke tools exposed by a
//! configurable fleet of external MCP servers. The crate owns the
//! JSON-RPC 2.0 client, the stdio and HTTP transports, the connection
//! pool with lazy connect and idle eviction, the persistent metadata
//! cache that registers tools before any server is contacted, and the
//! npx resolver that rewrites package-manager invocations into direct
//! executable paths.

pub mod adapter;
pub mod auth;
pub mod cache;
pub mod client;
pub mod content;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod names;
pub mod npx;
pub mod rpc;
#[cfg(test)]
pub(crate) mod testkit;
pub mod transport;
pub mod util;

pub use adapter::McpAdapter;
pub use client::McpClient;
pub use error::{McpError, Result};
pub use manager::{Connector, ServerManager, ServerStatus};

/// The MCP protocol version sent during initialize.
///
/// This constant is the single source of truth for the protocol
/// version string; the adapter does not negotiate other versions.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name reported in the initialize handshake.
pub const CLIENT_NAME: &str = "pi";

/// Client version reported in the initialize handshake.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
