//! Small shared helpers.

use std::path::PathBuf;

/// Current time as unix milliseconds.
///
/// Time-dependent checks throughout the crate take a `now_ms`
/// parameter so tests can supply fixed clocks; this is the single
/// production source.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Expand a leading `~/` against the user's home directory.
pub fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(raw)
}
