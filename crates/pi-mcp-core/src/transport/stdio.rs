//! Stdio transport: newline-delimited JSON to a spawned child process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pi_mcp_types::env::interpolate_os;

use super::Transport;
use crate::error::{McpError, Result};

/// Transport that frames JSON-RPC messages as lines on a child
/// process's stdin/stdout.
///
/// A background reader splits stdout on `\n` and queues each non-empty
/// line as one inbound frame; partial lines stay buffered in the
/// reader. Process exit or EOF wakes any parked receiver with
/// [`McpError::TransportClosed`].
pub struct StdioTransport {
    server: String,
    stdin: Mutex<Option<ChildStdin>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    child: Mutex<Option<Child>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl StdioTransport {
    /// Spawn `command` and set up line framing over its pipes.
    ///
    /// A command containing `/` is executed directly; anything else is
    /// resolved through the system `PATH`. The child environment is
    /// the parent environment overlaid with `env`, whose values get
    /// `${VAR}` / `$env:VAR` interpolation. When `debug` is set the
    /// child's stderr is forwarded to the host log line by line.
    pub async fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
        debug_stderr: bool,
    ) -> Result<Self> {
        let program = resolve_program(command)?;

        let mut cmd = Command::new(&program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if debug_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, interpolate_os(value));
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("failed to capture child stdout".into()))?;

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let cancel = CancellationToken::new();

        // Reader task: one line, one frame. Dropping `tx` on exit is
        // what wakes parked receivers with TransportClosed.
        let reader_cancel = cancel.clone();
        let reader_server = server.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    read = reader.read_line(&mut line) => match read {
                        Ok(0) => {
                            debug!(server = %reader_server, "stdio reader: child closed stdout");
                            break;
                        }
                        Ok(_) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            if tx.send(trimmed.to_string()).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(server = %reader_server, error = %e, "stdio reader: read error");
                            break;
                        }
                    }
                }
            }
        });

        if debug_stderr && let Some(stderr) = child.stderr.take() {
            let stderr_server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %stderr_server, "mcp stderr: {line}");
                }
            });
        }

        Ok(Self {
            server: server.to_string(),
            stdin: Mutex::new(Some(stdin)),
            inbound_rx: Mutex::new(rx),
            child: Mutex::new(Some(child)),
            cancel,
            closed: AtomicBool::new(false),
        })
    }
}

/// Resolve the program to execute: paths run directly, bare names go
/// through the system `PATH`.
fn resolve_program(command: &str) -> Result<PathBuf> {
    if command.contains('/') {
        return Ok(PathBuf::from(command));
    }
    which::which(command).map_err(|_| {
        McpError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("command not found in PATH: {command}"),
        ))
    })
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, frame: String) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::TransportClosed);
        }

        let mut line = frame;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(McpError::TransportClosed);
        };
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            warn!(server = %self.server, error = %e, "stdio write failed");
            return Err(McpError::TransportClosed);
        }
        if let Err(e) = stdin.flush().await {
            warn!(server = %self.server, error = %e, "stdio flush failed");
            return Err(McpError::TransportClosed);
        }
        Ok(())
    }

    async fn receive(&self) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::TransportClosed);
        }
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or(McpError::TransportClosed)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(server = %self.server, error = %e, "child already exited");
            }
        }
        debug!(server = %self.server, "stdio transport closed");
    }
}
