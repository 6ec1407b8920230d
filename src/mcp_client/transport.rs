//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with an MCP server child process:
//! - Writing JSON-RPC requests and notifications to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! The transport is stream-agnostic so tests can drive it over in-memory
//! pipes; [`StdioTransport::new`] wires it to a child's stdio.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::log_bus::LogBus;
use super::log_classifier;
use super::types::{
    error_codes, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, LogSource,
};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Default time to wait for a response before giving up.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    next_id: AtomicU64,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<BoxedReader>>,
    closed: AtomicBool,
    request_timeout: Duration,
    log_bus: Option<LogBus>,
}

impl StdioTransport {
    /// Create a new transport from a child process's stdin/stdout.
    pub fn new(server_name: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::from_streams(server_name, stdin, stdout)
    }

    /// Create a transport over arbitrary byte streams.
    pub fn from_streams<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(1),
            writer: Mutex::new(Some(Box::new(writer))),
            reader: Mutex::new(Some(BufReader::new(reader))),
            closed: AtomicBool::new(false),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            log_bus: None,
        }
    }

    /// Set the per-request response timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Forward log notifications seen on stdout to `bus`.
    pub fn with_log_bus(mut self, bus: LogBus) -> Self {
        self.log_bus = Some(bus);
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// One line of JSON is written, then lines are read until a response
    /// with a matching `id` arrives or the request timeout elapses.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.is_closed() {
            return Err(self.transport_error("transport is closed"));
        }

        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        tracing::debug!(server = %self.server_name, id, method, "sending request");

        match tokio::time::timeout(self.request_timeout, self.round_trip(id, &json)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: self.server_name.clone(),
                method: method.to_string(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }

    async fn round_trip(&self, id: u64, json: &str) -> Result<JsonRpcResponse, McpError> {
        self.write_line(json).await?;

        let mut line_buf = Vec::new();
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("transport is closed"))?;

        loop {
            line_buf.clear();
            let bytes_read = reader
                .read_until(b'\n', &mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error("server stdout closed (process may have exited)"));
            }

            let Ok(text) = std::str::from_utf8(&line_buf) else {
                // Undecodable bytes can't be JSON-RPC. Skip like any other noise.
                tracing::debug!(
                    server = %self.server_name,
                    line = %String::from_utf8_lossy(&line_buf).trim(),
                    "skipping non-UTF-8 stdout line"
                );
                continue;
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) else {
                // Not JSON: stray print output on stdout. Skip.
                tracing::debug!(server = %self.server_name, line = trimmed, "skipping non-JSON stdout line");
                continue;
            };

            if value.get("method").is_some() {
                self.handle_server_message(&value).await;
                continue;
            }

            let resp: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| self.transport_error(format!("malformed response: {e}")))?;
            match resp.id.as_ref() {
                Some(got) if got.as_u64() == Some(id) => return Ok(resp),
                // A null id is the server failing to read our request
                // (parse error); only one request is in flight.
                None if resp.error.is_some() => return Ok(resp),
                got => {
                    // Response for a different request ID, a late reply to a
                    // request that already timed out.
                    tracing::debug!(server = %self.server_name, expected = id, got = ?got, "skipping stale response");
                }
            }
        }
    }

    /// React to a notification or request initiated by the server.
    async fn handle_server_message(&self, value: &serde_json::Value) {
        if let (Some(bus), Some(event)) = (
            &self.log_bus,
            log_classifier::notification_event(value, LogSource::Protocol),
        ) {
            bus.publish(event);
            return;
        }

        let method = value.get("method").and_then(|m| m.as_str()).unwrap_or_default();
        let Some(id) = value.get("id").cloned() else {
            tracing::debug!(server = %self.server_name, method, "ignoring server notification");
            return;
        };

        // Server-to-client request: answer pings, refuse everything else.
        let reply = if method == "ping" {
            serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
        } else {
            let error = JsonRpcError {
                code: error_codes::METHOD_NOT_FOUND,
                message: format!("client does not support '{method}'"),
                data: None,
            };
            serde_json::json!({"jsonrpc": "2.0", "id": id, "error": error})
        };
        if let Err(e) = self.write_line(&reply.to_string()).await {
            tracing::warn!(server = %self.server_name, method, error = %e, "failed to answer server request");
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.transport_error("transport is closed"));
        }
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification)
            .map_err(|e| self.transport_error(format!("failed to serialize notification: {e}")))?;
        self.write_line(&json).await
    }

    async fn write_line(&self, json: &str) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("transport is closed"))?;

        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }

    /// Close the channel. Dropping stdin gives the server EOF.
    ///
    /// Idempotent; a request still holding the reader is left to fail on
    /// its own.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(server = %self.server_name, error = %e, "stdin shutdown failed");
            }
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        tracing::debug!(server = %self.server_name, "transport closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
