//! Shared schema types for the pi MCP adapter.
//!
//! This crate holds the configuration schema ([`config`]) and the
//! environment-variable interpolation helper ([`env`]) used by both
//! the adapter core and the host integration. It deliberately has no
//! async or I/O dependencies so that every consumer can depend on it.

pub mod config;
pub mod env;

pub use config::{
    AuthScheme, DirectTools, Lifecycle, McpConfig, McpSettings, ServerDefinition, ToolPrefix,
};
