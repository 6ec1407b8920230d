//! Connection manager: the connect/retry state machine.
//!
//! Owns the server process, its transport, and the tool catalog. A connect
//! sequence spawns the server, waits for it to settle, performs the
//! `initialize` handshake, and lists tools. The protocol has no readiness
//! signal: a successful `tools/list` is the only proof the server is up, so
//! failed attempts are retried a bounded number of times with a constant
//! backoff.
//!
//! `disconnect` may be called at any point, including from another task in
//! the middle of a retry; it cancels whatever is in flight and tears the
//! process down before returning.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;

use super::catalog::ToolCatalog;
use super::command::LaunchCommand;
use super::errors::McpError;
use super::invoker::{self, RawArguments};
use super::log_bus::LogBus;
use super::supervisor::ProcessSupervisor;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    ConnectionState, InitializeResult, ListToolsResult, Tool, ToolCallResult, PROTOCOL_VERSION,
};

/// Upper bound on `tools/list` pages followed through `nextCursor`.
const MAX_TOOL_PAGES: usize = 64;

// ─── Active connection ───────────────────────────────────────────────────────

/// Process and transport of the current attempt or connection.
#[derive(Default)]
struct Slot {
    supervisor: Option<ProcessSupervisor>,
    transport: Option<Arc<StdioTransport>>,
}

// ─── ConnectionManager ───────────────────────────────────────────────────────

/// Drives one server connection through
/// `Disconnected → Connecting → Connected | Failed`.
pub struct ConnectionManager {
    config: ConnectionConfig,
    log_bus: LogBus,
    state: watch::Sender<ConnectionState>,
    catalog: watch::Sender<Arc<ToolCatalog>>,
    /// Cancels the running connect sequence or invocation.
    cancel: Mutex<CancellationToken>,
    /// Held for the whole of a connect sequence and of each invocation.
    slot: tokio::sync::Mutex<Slot>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, log_bus: LogBus) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (catalog, _) = watch::channel(Arc::new(ToolCatalog::new()));
        Self {
            config,
            log_bus,
            state,
            catalog,
            cancel: Mutex::new(CancellationToken::new()),
            slot: tokio::sync::Mutex::new(Slot::default()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn log_bus(&self) -> &LogBus {
        &self.log_bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The current catalog. Empty until a connect succeeds.
    pub fn catalog(&self) -> Arc<ToolCatalog> {
        self.catalog.borrow().clone()
    }

    /// Whether the transport of the current connection is usable.
    pub async fn is_transport_open(&self) -> bool {
        let slot = self.slot.lock().await;
        slot.transport.as_ref().is_some_and(|t| !t.is_closed())
    }

    /// Whether a server process is currently running.
    pub async fn is_server_running(&self) -> bool {
        let slot = self.slot.lock().await;
        slot.supervisor.as_ref().is_some_and(ProcessSupervisor::is_running)
    }

    /// Process id of the running server, if any.
    pub async fn server_pid(&self) -> Option<u32> {
        let slot = self.slot.lock().await;
        slot.supervisor
            .as_ref()
            .filter(|s| s.is_running())
            .and_then(ProcessSupervisor::pid)
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = ?prev, to = ?next, "connection state changed");
        }
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Enter `Connecting` and arm a fresh cancellation token.
    ///
    /// Both happen under the cancel lock so a concurrent `disconnect` either
    /// precedes the whole sequence or cancels it.
    fn begin_connecting(&self) -> Result<CancellationToken, McpError> {
        let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        let entered = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                false
            } else {
                *state = ConnectionState::Connecting;
                true
            }
        });
        if !entered {
            return Err(McpError::AlreadyConnecting);
        }
        *cancel = CancellationToken::new();
        Ok(cancel.clone())
    }

    // ─── Connect ─────────────────────────────────────────────────────────

    /// Launch the server and discover its tools.
    ///
    /// A malformed command fails immediately without spawning anything.
    /// Otherwise up to `max_attempts` attempts are made; when all fail the
    /// state becomes `Failed` and the last cause is returned inside
    /// `ConnectionExhausted`. Connecting while connected replaces the
    /// connection and its catalog.
    pub async fn connect(&self, raw_command: &str) -> Result<Arc<ToolCatalog>, McpError> {
        let command = LaunchCommand::parse(raw_command)?;
        let token = self.begin_connecting()?;

        let mut slot = self.slot.lock().await;
        let outcome = self.run_attempts(&command, &mut slot, &token).await;

        match outcome {
            Ok(catalog) => {
                self.catalog.send_replace(catalog.clone());
                self.set_state(ConnectionState::Connected);
                tracing::info!(
                    server = command.server_name(),
                    tools = catalog.len(),
                    "connected to server"
                );
                Ok(catalog)
            }
            Err(e) => {
                self.teardown(&mut slot).await;
                self.catalog.send_replace(Arc::new(ToolCatalog::new()));
                if matches!(e, McpError::Cancelled) {
                    tracing::info!(server = command.server_name(), "connect cancelled");
                    self.set_state(ConnectionState::Disconnected);
                } else {
                    tracing::error!(server = command.server_name(), error = %e, "could not connect to server");
                    self.set_state(ConnectionState::Failed);
                }
                Err(e)
            }
        }
    }

    async fn run_attempts(
        &self,
        command: &LaunchCommand,
        slot: &mut Slot,
        token: &CancellationToken,
    ) -> Result<Arc<ToolCatalog>, McpError> {
        let max_attempts = self.config.attempts();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if token.is_cancelled() {
                return Err(McpError::Cancelled);
            }

            // Leftovers from the previous attempt or connection.
            self.teardown(slot).await;

            tracing::info!(
                server = command.server_name(),
                attempt,
                max_attempts,
                command = %command,
                "starting server"
            );

            match self.attempt(command, slot, token).await {
                Ok(tools) => {
                    if token.is_cancelled() {
                        return Err(McpError::Cancelled);
                    }
                    return Ok(Arc::new(ToolCatalog::from_tools(tools)));
                }
                Err(McpError::Cancelled) => return Err(McpError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        server = command.server_name(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "connection attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                self.teardown(slot).await;
                tracing::info!(
                    backoff_ms = self.config.retry_backoff_ms,
                    "waiting before next attempt"
                );
                sleep_cancellable(token, self.config.retry_backoff()).await?;
            }
        }

        Err(McpError::ConnectionExhausted {
            name: command.server_name().to_string(),
            attempts: max_attempts,
            source: Box::new(last_error.unwrap_or(McpError::NotConnected)),
        })
    }

    /// One spawn → settle → handshake → settle → list-tools pass.
    async fn attempt(
        &self,
        command: &LaunchCommand,
        slot: &mut Slot,
        token: &CancellationToken,
    ) -> Result<Vec<Tool>, McpError> {
        let name = command.server_name();
        let bus = self.log_bus.for_server(name);

        let (supervisor, pipes) =
            ProcessSupervisor::spawn(command, &self.config.spawn_options(), &bus)?;
        let transport = Arc::new(
            StdioTransport::new(name, pipes.stdin, pipes.stdout)
                .with_request_timeout(self.config.request_timeout())
                .with_log_bus(bus),
        );
        slot.supervisor = Some(supervisor);
        slot.transport = Some(transport.clone());

        tracing::debug!(server = name, "waiting for server to initialize");
        sleep_cancellable(token, self.config.spawn_settle()).await?;

        if let Some(exit) = slot.supervisor.as_ref().and_then(ProcessSupervisor::exit) {
            return Err(McpError::SpawnFailed {
                name: name.to_string(),
                reason: match exit.code {
                    Some(code) => format!("process exited during startup with code {code}"),
                    None => "process was killed during startup".to_string(),
                },
            });
        }

        tracing::debug!(server = name, "connecting to server");
        cancellable(token, self.handshake(&transport)).await?;

        tracing::debug!(server = name, "waiting for connection to settle");
        sleep_cancellable(token, self.config.handshake_settle()).await?;

        tracing::debug!(server = name, "fetching tool list");
        cancellable(token, list_tools(&transport)).await
    }

    /// `initialize` request followed by the `initialized` notification.
    async fn handshake(&self, transport: &StdioTransport) -> Result<InitializeResult, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            },
        });

        let response = transport.request("initialize", Some(params)).await?;
        let result = extract_result(response)?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::Transport {
                server: transport.server_name().to_string(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        let info = init.server_info.as_ref();
        tracing::info!(
            server = transport.server_name(),
            server_name = info.and_then(|i| i.name.as_deref()).unwrap_or("unknown"),
            server_version = info.and_then(|i| i.version.as_deref()).unwrap_or("unknown"),
            protocol = init.protocol_version.as_deref().unwrap_or(PROTOCOL_VERSION),
            "handshake complete"
        );

        transport.notify("notifications/initialized", None).await?;
        Ok(init)
    }

    // ─── Invoke ──────────────────────────────────────────────────────────

    /// Validate and run a tool on the connected server.
    ///
    /// Validation failures never reach the server. Invocations are
    /// serialized; a concurrent `disconnect` cancels the one in flight.
    pub async fn invoke(&self, name: &str, args: RawArguments) -> Result<ToolCallResult, McpError> {
        if self.state() != ConnectionState::Connected {
            return Err(McpError::NotConnected);
        }

        let call = invoker::prepare_call(&self.catalog(), name, args)?;
        let token = self.current_token();

        let slot = cancellable(&token, async { Ok(self.slot.lock().await) }).await?;
        if self.state() != ConnectionState::Connected {
            return Err(McpError::NotConnected);
        }
        let transport = slot.transport.clone().ok_or(McpError::NotConnected)?;

        cancellable(&token, invoker::submit(&transport, call)).await
    }

    // ─── Disconnect ──────────────────────────────────────────────────────

    /// Stop the server and close the transport, whatever the current state.
    ///
    /// Cancels a connect sequence or invocation in progress and waits for it
    /// to unwind. Idempotent.
    ///
    /// A `connect` that starts while this waits for the connection lock
    /// keeps its `Connecting` state; it replaces the connection next.
    pub async fn disconnect(&self) {
        self.current_token().cancel();

        let mut slot = self.slot.lock().await;
        self.teardown(&mut slot).await;

        // Under the cancel lock: an uncancelled token means begin_connecting
        // armed a new sequence after the cancel above.
        let cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if !cancel.is_cancelled() {
            tracing::debug!("connect started during disconnect, leaving its state");
            return;
        }
        self.catalog.send_replace(Arc::new(ToolCatalog::new()));
        self.set_state(ConnectionState::Disconnected);
        drop(cancel);
        tracing::info!("disconnected");
    }

    /// Close the transport and stop the process. Failures are logged and
    /// swallowed so they never block the next attempt.
    async fn teardown(&self, slot: &mut Slot) {
        if let Some(transport) = slot.transport.take() {
            transport.close().await;
        }
        if let Some(mut supervisor) = slot.supervisor.take() {
            match supervisor.terminate(self.config.terminate_grace()).await {
                Ok(exit) => tracing::debug!(server = supervisor.name(), code = ?exit.code, "server stopped"),
                Err(e) => tracing::warn!(error = %e, "failed to stop server process"),
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Run `fut` unless `token` is cancelled first.
async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T, McpError>
where
    F: Future<Output = Result<T, McpError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(McpError::Cancelled),
        result = fut => result,
    }
}

async fn sleep_cancellable(
    token: &CancellationToken,
    duration: std::time::Duration,
) -> Result<(), McpError> {
    cancellable(token, async {
        tokio::time::sleep(duration).await;
        Ok(())
    })
    .await
}

/// `tools/list`, following `nextCursor` pagination.
async fn list_tools(transport: &StdioTransport) -> Result<Vec<Tool>, McpError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_TOOL_PAGES {
        let params = cursor
            .as_ref()
            .map(|c| serde_json::json!({ "cursor": c }));
        let response = transport.request("tools/list", params).await?;
        let result = extract_result(response)?;
        let page: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::Transport {
                server: transport.server_name().to_string(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;

        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => return Ok(tools),
        }
    }

    tracing::warn!(
        server = transport.server_name(),
        pages = MAX_TOOL_PAGES,
        "tools/list pagination limit reached"
    );
    Ok(tools)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(max_attempts: u32) -> ConnectionConfig {
        ConnectionConfig {
            max_attempts,
            spawn_settle_ms: 0,
            handshake_settle_ms: 0,
            retry_backoff_ms: 10,
            request_timeout_ms: 2_000,
            terminate_grace_ms: 100,
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_initial_state() {
        let manager = ConnectionManager::new(ConnectionConfig::default(), LogBus::new("test"));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.catalog().is_empty());
        assert!(!manager.is_transport_open().await);
        assert!(!manager.is_server_running().await);
    }

    #[tokio::test]
    async fn test_invalid_command_is_not_retried() {
        let manager = ConnectionManager::new(fast_config(3), LogBus::new("test"));
        let err = manager.connect("python3").await.unwrap_err();
        assert!(matches!(err, McpError::InvalidCommand { .. }));
        // Never entered Connecting.
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_executable_exhausts_attempts() {
        let config = ConnectionConfig {
            retry_backoff_ms: 50,
            ..fast_config(3)
        };
        let manager = ConnectionManager::new(config, LogBus::new("test"));
        let started = std::time::Instant::now();
        let err = manager
            .connect("/nonexistent/mcp-server-binary server.py")
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        // Two backoffs sit between three attempts.
        assert!(elapsed >= std::time::Duration::from_millis(100), "{elapsed:?}");
        assert!(elapsed < std::time::Duration::from_secs(2), "{elapsed:?}");
        match err {
            McpError::ConnectionExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, McpError::SpawnFailed { .. }));
            }
            other => panic!("expected ConnectionExhausted, got {other:?}"),
        }
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_invoke_requires_connection() {
        let manager = ConnectionManager::new(fast_config(1), LogBus::new("test"));
        let err = manager.invoke("anything", RawArguments::new()).await.unwrap_err();
        assert!(matches!(err, McpError::NotConnected));
    }

    #[tokio::test]
    async fn test_reentrant_connect_rejected() {
        let manager = ConnectionManager::new(fast_config(1), LogBus::new("test"));
        manager.begin_connecting().unwrap();
        let err = manager.connect("node server.js").await.unwrap_err();
        assert!(matches!(err, McpError::AlreadyConnecting));
    }

    #[tokio::test]
    async fn test_connect_queued_behind_disconnect_keeps_its_state() {
        let manager = Arc::new(ConnectionManager::new(fast_config(1), LogBus::new("test")));

        // An operation in flight holds the connection lock.
        let busy = manager.slot.lock().await;
        let disconnecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.disconnect().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // A new connect arms itself after the cancel but before the lock frees.
        let token = manager.begin_connecting().unwrap();
        drop(busy);
        disconnecting.await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(!token.is_cancelled());
        assert!(matches!(
            manager.begin_connecting(),
            Err(McpError::AlreadyConnecting)
        ));
    }

    #[tokio::test]
    async fn test_disconnect_when_never_connected() {
        let manager = ConnectionManager::new(fast_config(1), LogBus::new("test"));
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
