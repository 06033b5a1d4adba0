//! Authorization header resolution for HTTP servers.
//!
//! Bearer tokens come from config or the environment; OAuth tokens are
//! read from the file the host's auth flow stored earlier. The adapter
//! never runs an OAuth flow itself.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use pi_mcp_types::config::{AuthScheme, ServerDefinition};

use crate::error::{McpError, Result};

/// Token file stored by the host at `<agent_dir>/mcp-oauth/<server>/tokens.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// The bearer token to present.
    pub access_token: String,
    /// Token type, normally `"bearer"`.
    #[serde(default)]
    pub token_type: Option<String>,
    /// Refresh token, unused here (the host refreshes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds at issue time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    /// Absolute expiry as unix milliseconds. Past values make the
    /// token count as absent.
    #[serde(
        default,
        rename = "expiresAt",
        alias = "expires_at",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<i64>,
}

/// Resolve the `Authorization` header value for `server`, if any.
///
/// Returns `Ok(None)` when the definition has no `auth` scheme, and
/// [`McpError::AuthMissing`] when a scheme is configured but no usable
/// token can be found.
pub fn resolve_authorization(
    server: &str,
    def: &ServerDefinition,
    agent_dir: &Path,
    now_ms: i64,
) -> Result<Option<String>> {
    match def.auth {
        None => Ok(None),
        Some(AuthScheme::Bearer) => {
            let token = def
                .bearer_token
                .clone()
                .filter(|t| !t.is_empty())
                .or_else(|| {
                    def.bearer_token_env
                        .as_ref()
                        .and_then(|name| std::env::var(name).ok())
                        .filter(|t| !t.is_empty())
                });
            match token {
                Some(token) => Ok(Some(format!("Bearer {token}"))),
                None => Err(McpError::AuthMissing(server.to_string())),
            }
        }
        Some(AuthScheme::Oauth) => {
            let path = oauth_token_path(agent_dir, server);
            let raw = std::fs::read_to_string(&path)
                .map_err(|_| McpError::AuthMissing(server.to_string()))?;
            let tokens: OAuthTokens = serde_json::from_str(&raw)
                .map_err(|_| McpError::AuthMissing(server.to_string()))?;
            if let Some(expires_at) = tokens.expires_at
                && expires_at <= now_ms
            {
                debug!(server = %server, "stored oauth token is expired");
                return Err(McpError::AuthMissing(server.to_string()));
            }
            Ok(Some(format!("Bearer {}", tokens.access_token)))
        }
    }
}

/// Path of the stored token file for `server`.
pub fn oauth_token_path(agent_dir: &Path, server: &str) -> std::path::PathBuf {
    agent_dir.join("mcp-oauth").join(server).join("tokens.json")
}
