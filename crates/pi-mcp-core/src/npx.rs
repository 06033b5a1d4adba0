//! npx / npm-exec resolution.
//!
//! Spawning `npx <pkg>` pays package-manager startup cost on every
//! connect. The resolver probes the local npm cache for the package's
//! actual binary so the stdio transport can spawn it directly,
//! rewriting JavaScript entry points to `node <path>`. Results are
//! cached on disk for a day. When nothing can be resolved the caller
//! falls back to spawning the original command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Resolution cache lifetime.
pub const NPX_CACHE_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Deadline for the force-populate subprocess.
const FORCE_POPULATE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// A parsed `npx` / `npm exec` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpxInvocation {
    /// Package spec, possibly with a version suffix.
    pub package_spec: String,
    /// Explicit binary name (`npm exec --package p -- bin`).
    pub bin_name: Option<String>,
    /// Arguments to pass to the resolved binary.
    pub extra_args: Vec<String>,
}

/// A resolved binary ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpxResolution {
    /// Path of the package's executable.
    pub bin_path: PathBuf,
    /// Whether the executable is a JavaScript file.
    pub is_js: bool,
    /// Arguments for the binary.
    pub extra_args: Vec<String>,
}

impl NpxResolution {
    /// The `(command, args)` pair to spawn: JavaScript entry points run
    /// under `node`, anything else runs directly.
    pub fn into_command(self) -> (String, Vec<String>) {
        if self.is_js {
            let mut args = vec![self.bin_path.to_string_lossy().into_owned()];
            args.extend(self.extra_args);
            ("node".to_string(), args)
        } else {
            (
                self.bin_path.to_string_lossy().into_owned(),
                self.extra_args,
            )
        }
    }
}

// ── Argument parsing ─────────────────────────────────────────────────────

/// Parse an `npx` or `npm exec` argument list.
///
/// Returns `None` when the invocation does not name a package (or, for
/// `npm`, is not an `exec` subcommand).
pub fn parse_invocation(command: &str, args: &[String]) -> Option<NpxInvocation> {
    match command {
        "npx" => parse_args(args, false),
        "npm" => match args.first().map(String::as_str) {
            Some("exec") => parse_args(&args[1..], true),
            _ => None,
        },
        _ => None,
    }
}

fn parse_args(args: &[String], passthrough_names_bin: bool) -> Option<NpxInvocation> {
    let mut package: Option<String> = None;
    let mut positional_package: Option<String> = None;
    let mut bin_name: Option<String> = None;
    let mut extra_args: Vec<String> = Vec::new();
    let mut passthrough = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if passthrough {
            if passthrough_names_bin && bin_name.is_none() {
                bin_name = Some(arg.clone());
            } else {
                extra_args.push(arg.clone());
            }
            continue;
        }
        match arg.as_str() {
            "-y" | "--yes" => {}
            "-p" | "--package" => package = iter.next().cloned(),
            "--" => passthrough = true,
            other if other.starts_with("--package=") => {
                package = Some(other["--package=".len()..].to_string());
            }
            other if other.starts_with('-') => {
                // Unknown npx flag before the spec; dropped.
            }
            other => {
                if package.is_none() && positional_package.is_none() {
                    positional_package = Some(other.to_string());
                } else {
                    extra_args.push(other.to_string());
                }
            }
        }
    }

    let package_spec = package.or(positional_package)?;
    Some(NpxInvocation {
        package_spec,
        bin_name,
        extra_args,
    })
}

/// Strip the version suffix from a package spec.
///
/// Scoped packages start with `@`, so the version, if any, begins at
/// the last `@` after the `/`; unscoped packages use the last `@`.
pub fn strip_version(spec: &str) -> &str {
    if let Some(stripped) = spec.strip_prefix('@') {
        match stripped.rfind('@') {
            Some(at) => &spec[..at + 1],
            None => spec,
        }
    } else {
        match spec.rfind('@') {
            Some(0) | None => spec,
            Some(at) => &spec[..at],
        }
    }
}

/// The package name without its `@scope/` prefix.
fn short_name(package_name: &str) -> &str {
    match package_name.rsplit_once('/') {
        Some((_, rest)) => rest,
        None => package_name,
    }
}

// ── Disk cache ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NpxCacheEntry {
    #[serde(rename = "binPath", alias = "bin_path")]
    bin_path: PathBuf,
    #[serde(rename = "isJs", alias = "is_js")]
    is_js: bool,
    #[serde(rename = "cachedAt", alias = "cached_at")]
    cached_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NpxCacheFile {
    #[serde(default)]
    entries: BTreeMap<String, NpxCacheEntry>,
}

/// Handle on `<agent_dir>/mcp-npx-cache.json`.
#[derive(Debug, Clone)]
struct NpxCache {
    path: PathBuf,
}

impl NpxCache {
    fn new(agent_dir: &Path) -> Self {
        Self {
            path: agent_dir.join("mcp-npx-cache.json"),
        }
    }

    fn load(&self) -> NpxCacheFile {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    /// A fresh entry whose binary still exists on disk; stale or
    /// dangling entries are purged from the file.
    fn lookup(&self, spec: &str, now_ms: i64) -> Option<NpxCacheEntry> {
        let mut file = self.load();
        let entry = file.entries.get(spec)?.clone();
        if now_ms - entry.cached_at < NPX_CACHE_TTL_MS && entry.bin_path.exists() {
            return Some(entry);
        }
        debug!(spec, "purging stale npx cache entry");
        file.entries.remove(spec);
        let _ = self.write(&file);
        None
    }

    fn store(&self, spec: &str, bin_path: &Path, is_js: bool, now_ms: i64) -> Result<()> {
        let mut file = self.load();
        file.entries.insert(
            spec.to_string(),
            NpxCacheEntry {
                bin_path: bin_path.to_path_buf(),
                is_js,
                cached_at: now_ms,
            },
        );
        self.write(&file)
    }

    fn write(&self, file: &NpxCacheFile) -> Result<()> {
        let body = serde_json::to_string_pretty(file)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        if std::fs::write(&tmp, &body).is_ok() && std::fs::rename(&tmp, &self.path).is_ok() {
            return Ok(());
        }
        let _ = std::fs::remove_file(&tmp);
        std::fs::write(&self.path, &body)?;
        Ok(())
    }
}

// ── Resolver ─────────────────────────────────────────────────────────────

/// Probes the npm cache to rewrite `npx`/`npm exec` invocations into
/// direct executable paths.
#[derive(Debug, Clone)]
pub struct NpxResolver {
    cache: NpxCache,
    npm_cache_dir: PathBuf,
    allow_network: bool,
}

impl NpxResolver {
    /// Resolver with the npm cache at `$NPM_CONFIG_CACHE`, else `~/.npm`.
    pub fn new(agent_dir: &Path) -> Self {
        let npm_cache_dir = std::env::var("NPM_CONFIG_CACHE")
            .map(PathBuf::from)
            .ok()
            .or_else(|| dirs::home_dir().map(|home| home.join(".npm")))
            .unwrap_or_else(|| PathBuf::from(".npm"));
        Self::with_npm_cache_dir(agent_dir, npm_cache_dir)
    }

    /// Resolver with an explicit npm cache root (tests).
    pub fn with_npm_cache_dir(agent_dir: &Path, npm_cache_dir: PathBuf) -> Self {
        Self {
            cache: NpxCache::new(agent_dir),
            npm_cache_dir,
            allow_network: true,
        }
    }

    /// Disable the force-populate step; resolution then only consults
    /// local state.
    pub fn offline(mut self) -> Self {
        self.allow_network = false;
        self
    }

    /// Resolve a server's `(command, args)` into a directly spawnable
    /// binary. `None` means the caller should spawn the original
    /// command unchanged.
    pub async fn resolve(
        &self,
        command: &str,
        args: &[String],
        now_ms: i64,
    ) -> Option<NpxResolution> {
        let invocation = parse_invocation(command, args)?;

        if let Some(hit) = self.cache.lookup(&invocation.package_spec, now_ms) {
            debug!(spec = %invocation.package_spec, "npx cache hit");
            return Some(NpxResolution {
                bin_path: hit.bin_path,
                is_js: hit.is_js,
                extra_args: invocation.extra_args,
            });
        }

        let mut bin = self.probe(&invocation);
        if bin.is_none()
            && self.allow_network
            && self.force_populate(&invocation.package_spec).await
        {
            // npm populated its cache; look again. This is the only
            // step that may touch the network.
            bin = self.probe(&invocation);
        }

        let bin_path = bin?;
        let is_js = is_javascript(&bin_path);
        if let Err(e) = self
            .cache
            .store(&invocation.package_spec, &bin_path, is_js, now_ms)
        {
            warn!(error = %e, "failed to write npx cache");
        }
        Some(NpxResolution {
            bin_path,
            is_js,
            extra_args: invocation.extra_args,
        })
    }

    /// Search `<npm-cache>/_npx/*/node_modules/<pkg>` for the binary.
    fn probe(&self, invocation: &NpxInvocation) -> Option<PathBuf> {
        let package_name = strip_version(&invocation.package_spec);
        let npx_dir = self.npm_cache_dir.join("_npx");
        let entries = std::fs::read_dir(&npx_dir).ok()?;

        for entry in entries.filter_map(|e| e.ok()) {
            let node_modules = entry.path().join("node_modules");
            let package_dir = node_modules.join(package_name);
            if !package_dir.is_dir() {
                continue;
            }
            if let Some(bin) = locate_package_bin(
                &package_dir,
                package_name,
                invocation.bin_name.as_deref(),
            ) {
                return Some(bin);
            }
            // The package.json had no usable bin; try the .bin symlinks.
            let link_name = invocation
                .bin_name
                .clone()
                .unwrap_or_else(|| short_name(package_name).to_string());
            let link = node_modules.join(".bin").join(link_name);
            if link.exists() {
                return Some(link);
            }
        }
        None
    }

    /// Run `npm exec --yes --package <spec> -- node -e 1` so npm
    /// downloads the package into its cache.
    async fn force_populate(&self, spec: &str) -> bool {
        let mut cmd = tokio::process::Command::new("npm");
        cmd.args(["exec", "--yes", "--package", spec, "--", "node", "-e", "1"])
            .env("NPM_CONFIG_CACHE", &self.npm_cache_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!(spec, error = %e, "npm not available for force-populate");
                return false;
            }
        };

        match tokio::time::timeout(FORCE_POPULATE_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(spec, error = %e, "force-populate failed");
                false
            }
            Err(_) => {
                warn!(spec, "force-populate timed out, killing npm");
                let _ = child.kill().await;
                false
            }
        }
    }
}

/// Pick the binary path out of a package directory.
///
/// Preference order within `package.json`'s `bin`: the requested bin
/// name, the package's short name, the sole entry when there is
/// exactly one, then any entry. A string `bin` is the single
/// candidate. Only paths that exist are returned.
fn locate_package_bin(
    package_dir: &Path,
    package_name: &str,
    bin_name: Option<&str>,
) -> Option<PathBuf> {
    let manifest = std::fs::read_to_string(package_dir.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&manifest).ok()?;

    let candidates: Vec<String> = match manifest.get("bin") {
        Some(serde_json::Value::String(path)) => vec![path.clone()],
        Some(serde_json::Value::Object(bins)) => {
            let mut keys: Vec<&String> = bins.keys().collect();
            keys.sort();
            let preferred = bin_name
                .filter(|name| bins.contains_key(*name))
                .or_else(|| {
                    let short = short_name(package_name);
                    bins.contains_key(short).then_some(short)
                });
            let picked: Vec<&String> = match preferred {
                Some(name) => keys.iter().copied().filter(|k| k.as_str() == name).collect(),
                None => keys,
            };
            picked
                .into_iter()
                .filter_map(|k| bins[k].as_str().map(String::from))
                .collect()
        }
        _ => return None,
    };

    for relative in candidates {
        let path = package_dir.join(relative);
        if path.exists() {
            return Some(path);
        }
    }
    None
}

/// Whether the file at `path` is JavaScript: by extension, or by a
/// `#!` line mentioning `node` in the first 256 bytes.
pub fn is_javascript(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|e| e.to_str())
        && matches!(ext, "js" | "mjs" | "cjs")
    {
        return true;
    }
    let Ok(bytes) = std::fs::read(path) else {
        return false;
    };
    let head = &bytes[..bytes.len().min(256)];
    head.starts_with(b"#!") && head.windows(4).any(|w| w == b"node")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    // ── Parsing ─────────────────────────────────────────────────────────

    #[test]
    fn npx_simple_package() {
        let inv = parse_invocation("npx", &strs(&["-y", "@scope/server-foo", "--verbose"])).unwrap();
        assert_eq!(inv.package_spec, "@scope/server-foo");
        assert_eq!(inv.extra_args, strs(&["--verbose"]));
        assert!(inv.bin_name.is_none());
    }

    #[test]
    fn npx_package_flag_forms() {
        let inv = parse_invocation("npx", &strs(&["--package", "foo@1.2.3"])).unwrap();
        assert_eq!(inv.package_spec, "foo@1.2.3");

        let inv = parse_invocation("npx", &strs(&["--package=foo@1.2.3"])).unwrap();
        assert_eq!(inv.package_spec, "foo@1.2.3");

        let inv = parse_invocation("npx", &strs(&["-p", "foo"])).unwrap();
        assert_eq!(inv.package_spec, "foo");
    }

    #[test]
    fn npx_double_dash_passthrough() {
        let inv = parse_invocation("npx", &strs(&["pkg", "--", "-y", "--package"])).unwrap();
        assert_eq!(inv.package_spec, "pkg");
        // After `--`, flag-looking tokens are plain arguments.
        assert_eq!(inv.extra_args, strs(&["-y", "--package"]));
    }

    #[test]
    fn npx_positional_after_spec_is_extra() {
        let inv = parse_invocation("npx", &strs(&["pkg", "sub", "cmd"])).unwrap();
        assert_eq!(inv.package_spec, "pkg");
        assert_eq!(inv.extra_args, strs(&["sub", "cmd"]));
    }

    #[test]
    fn npx_without_package_is_none() {
        assert!(parse_invocation("npx", &strs(&["-y"])).is_none());
        assert!(parse_invocation("node", &strs(&["server.js"])).is_none());
    }

    #[test]
    fn npm_requires_exec_subcommand() {
        assert!(parse_invocation("npm", &strs(&["install", "foo"])).is_none());

        let inv = parse_invocation(
            "npm",
            &strs(&["exec", "--yes", "--package", "@scope/pkg", "--", "mybin", "arg1"]),
        )
        .unwrap();
        assert_eq!(inv.package_spec, "@scope/pkg");
        assert_eq!(inv.bin_name.as_deref(), Some("mybin"));
        assert_eq!(inv.extra_args, strs(&["arg1"]));
    }

    #[test]
    fn version_stripping() {
        assert_eq!(strip_version("foo"), "foo");
        assert_eq!(strip_version("foo@1.2.3"), "foo");
        assert_eq!(strip_version("@scope/foo"), "@scope/foo");
        assert_eq!(strip_version("@scope/foo@latest"), "@scope/foo");
        assert_eq!(strip_version("@scope/foo@1.0.0-beta.1"), "@scope/foo");
    }

    // ── JavaScript detection ────────────────────────────────────────────

    #[test]
    fn js_by_extension() {
        assert!(is_javascript(Path::new("/x/index.js")));
        assert!(is_javascript(Path::new("/x/index.mjs")));
        assert!(is_javascript(Path::new("/x/index.cjs")));
    }

    #[test]
    fn js_by_shebang() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("cli");
        std::fs::write(&script, "#!/usr/bin/env node\nconsole.log(1)\n").unwrap();
        assert!(is_javascript(&script));

        let shell = dir.path().join("run");
        std::fs::write(&shell, "#!/bin/sh\necho hi\n").unwrap();
        assert!(!is_javascript(&shell));

        let binary = dir.path().join("prog");
        std::fs::write(&binary, [0x7f, b'E', b'L', b'F']).unwrap();
        assert!(!is_javascript(&binary));
    }

    // ── Probing a fake npm cache ────────────────────────────────────────

    /// Lay out `<npm>/_npx/<hash>/node_modules/<pkg>` with a
    /// package.json and bin file.
    fn fake_package(npm: &Path, package_name: &str, bin_json: &str, bin_rel: &str) {
        let pkg_dir = npm
            .join("_npx")
            .join("abc123")
            .join("node_modules")
            .join(package_name);
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(
            pkg_dir.join("package.json"),
            format!(r#"{{"name":"{package_name}","bin":{bin_json}}}"#),
        )
        .unwrap();
        let bin = pkg_dir.join(bin_rel);
        std::fs::create_dir_all(bin.parent().unwrap()).unwrap();
        std::fs::write(&bin, "#!/usr/bin/env node\n").unwrap();
    }

    #[tokio::test]
    async fn resolves_scoped_package_to_node_invocation() {
        let agent = tempfile::tempdir().unwrap();
        let npm = tempfile::tempdir().unwrap();
        fake_package(
            npm.path(),
            "@modelcontextprotocol/server-foo",
            r#"{"server-foo":"bin/index.js"}"#,
            "bin/index.js",
        );

        let resolver = NpxResolver::with_npm_cache_dir(agent.path(), npm.path().to_path_buf());
        let resolution = resolver
            .resolve(
                "npx",
                &strs(&["-y", "@modelcontextprotocol/server-foo", "--verbose"]),
                1_000,
            )
            .await
            .unwrap();

        assert!(resolution.is_js);
        assert!(resolution.bin_path.ends_with("bin/index.js"));
        let (command, args) = resolution.into_command();
        assert_eq!(command, "node");
        assert!(args[0].ends_with("bin/index.js"));
        assert_eq!(args[1], "--verbose");
    }

    #[tokio::test]
    async fn bin_as_string_is_single_candidate() {
        let agent = tempfile::tempdir().unwrap();
        let npm = tempfile::tempdir().unwrap();
        fake_package(npm.path(), "simple", r#""cli.js""#, "cli.js");

        let resolver = NpxResolver::with_npm_cache_dir(agent.path(), npm.path().to_path_buf());
        let resolution = resolver
            .resolve("npx", &strs(&["simple@2.0.0"]), 1_000)
            .await
            .unwrap();
        assert!(resolution.bin_path.ends_with("cli.js"));
    }

    #[tokio::test]
    async fn resolution_is_cached_and_reused() {
        let agent = tempfile::tempdir().unwrap();
        let npm = tempfile::tempdir().unwrap();
        fake_package(npm.path(), "cached-pkg", r#"{"cached-pkg":"main.js"}"#, "main.js");

        let resolver = NpxResolver::with_npm_cache_dir(agent.path(), npm.path().to_path_buf());
        resolver
            .resolve("npx", &strs(&["cached-pkg"]), 1_000)
            .await
            .unwrap();

        // Cache file exists and the second resolve hits it.
        assert!(agent.path().join("mcp-npx-cache.json").exists());
        let again = resolver
            .resolve("npx", &strs(&["cached-pkg", "arg"]), 2_000)
            .await
            .unwrap();
        assert_eq!(again.extra_args, strs(&["arg"]));
    }

    #[tokio::test]
    async fn stale_cache_entry_is_purged_and_reprobed() {
        let agent = tempfile::tempdir().unwrap();
        let npm = tempfile::tempdir().unwrap();
        fake_package(npm.path(), "ttl-pkg", r#"{"ttl-pkg":"main.js"}"#, "main.js");

        let resolver = NpxResolver::with_npm_cache_dir(agent.path(), npm.path().to_path_buf());
        resolver.resolve("npx", &strs(&["ttl-pkg"]), 0).await.unwrap();

        // Past the TTL the entry is ignored; the probe still succeeds.
        let later = NPX_CACHE_TTL_MS + 1;
        let resolution = resolver.resolve("npx", &strs(&["ttl-pkg"]), later).await;
        assert!(resolution.is_some());
    }

    #[tokio::test]
    async fn dangling_cached_binary_is_rejected() {
        let agent = tempfile::tempdir().unwrap();
        let npm = tempfile::tempdir().unwrap();
        fake_package(npm.path(), "gone-pkg", r#"{"gone-pkg":"main.js"}"#, "main.js");

        let resolver =
            NpxResolver::with_npm_cache_dir(agent.path(), npm.path().to_path_buf()).offline();
        let first = resolver
            .resolve("npx", &strs(&["gone-pkg"]), 1_000)
            .await
            .unwrap();
        std::fs::remove_file(&first.bin_path).unwrap();

        // Cache hit fails the existence check and the re-probe finds
        // nothing either, so resolution falls back to None.
        let again = resolver.resolve("npx", &strs(&["gone-pkg"]), 2_000).await;
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn dot_bin_fallback() {
        let agent = tempfile::tempdir().unwrap();
        let npm = tempfile::tempdir().unwrap();
        // Package without a bin field, but with a .bin sibling.
        let node_modules = npm.path().join("_npx").join("h1").join("node_modules");
        let pkg_dir = node_modules.join("linked");
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(pkg_dir.join("package.json"), r#"{"name":"linked"}"#).unwrap();
        let dot_bin = node_modules.join(".bin");
        std::fs::create_dir_all(&dot_bin).unwrap();
        std::fs::write(dot_bin.join("linked"), "#!/bin/sh\n").unwrap();

        let resolver = NpxResolver::with_npm_cache_dir(agent.path(), npm.path().to_path_buf());
        let resolution = resolver
            .resolve("npx", &strs(&["linked"]), 1_000)
            .await
            .unwrap();
        assert!(resolution.bin_path.ends_with(".bin/linked"));
        assert!(!resolution.is_js);
        let (command, args) = resolution.into_command();
        assert!(command.ends_with(".bin/linked"));
        assert!(args.is_empty());
    }
}
