//! HTTP transport: JSON POST with JSON or SSE responses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use pi_mcp_types::env::interpolate_os;

use super::Transport;
use crate::error::{McpError, Result};

/// Transport that POSTs each outbound frame to a fixed endpoint.
///
/// The response is enqueued as inbound frames according to its
/// `Content-Type`: a JSON body becomes one frame, an SSE stream yields
/// one frame per event, and a 202 acknowledges a notification without
/// producing any frame.
pub struct HttpTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    headers: Vec<(String, String)>,
    authorization: Option<String>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Create a transport for `url`.
    ///
    /// `headers` values get `${VAR}` / `$env:VAR` interpolation once,
    /// here. `authorization`, when present, is sent as the
    /// `Authorization` header on every request.
    pub fn new(
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
        authorization: Option<String>,
    ) -> Self {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.clone(), interpolate_os(v)))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            server: server.to_string(),
            url: url.to_string(),
            client: reqwest::Client::new(),
            headers,
            authorization,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(rx),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, frame: String) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::TransportClosed);
        }

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream");
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        if let Some(auth) = &self.authorization {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = request
            .body(frame)
            .send()
            .await
            .map_err(|e| McpError::Protocol(format!("http request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            // Notification ack; no response frame.
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Protocol(format!("HTTP {status}: {body}")));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        let tx = {
            let guard = self.inbound_tx.lock().await;
            match guard.as_ref() {
                Some(tx) => tx.clone(),
                None => return Err(McpError::TransportClosed),
            }
        };

        if content_type.contains("text/event-stream") {
            // Consume the stream in the background so long-lived SSE
            // responses do not block the sender.
            let cancel = self.cancel.clone();
            let server = self.server.clone();
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                let mut parser = SseParser::new();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        chunk = stream.next() => match chunk {
                            Some(Ok(bytes)) => {
                                for event in parser.push(&bytes) {
                                    let _ = tx.send(event);
                                }
                            }
                            Some(Err(e)) => {
                                warn!(server = %server, error = %e, "sse stream error");
                                break;
                            }
                            None => {
                                if let Some(event) = parser.finish() {
                                    let _ = tx.send(event);
                                }
                                break;
                            }
                        }
                    }
                }
            });
        } else {
            // application/json or unspecified: the whole body is one frame.
            let body = response
                .text()
                .await
                .map_err(|e| McpError::Protocol(format!("failed to read response body: {e}")))?;
            if !body.trim().is_empty() {
                let _ = tx.send(body);
            }
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
        self.inbound_tx.lock().await.take();
        debug!(server = %self.server, "http transport closed");
    }
}

/// Incremental SSE parser.
///
/// Feeds arbitrary byte chunks and yields one string per completed
/// event: the concatenation of its `data:` line remainders. An empty
/// line terminates an event; [`SseParser::finish`] flushes an event
/// left open when the stream ends without a trailing blank line.
pub(crate) struct SseParser {
    buffer: String,
    data: String,
    has_data: bool,
}

impl SseParser {
    pub(crate) fn new() -> Self {
        Self {
            buffer: String::new(),
            data: String::new(),
            has_data: false,
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(event) = self.take_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    pub(crate) fn finish(&mut self) -> Option<String> {
        let leftover = std::mem::take(&mut self.buffer);
        let flushed = self.take_line(leftover.trim_end_matches('\r'));
        if flushed.is_some() {
            return flushed;
        }
        if self.has_data {
            self.has_data = false;
            return Some(std::mem::take(&mut self.data));
        }
        None
    }

    fn take_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.has_data {
                self.has_data = false;
                return Some(std::mem::take(&mut self.data));
            }
            return None;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            self.data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            self.has_data = true;
        }
        // Other SSE fields (event:, id:, retry:, comments) are ignored.
        None
    }
}
