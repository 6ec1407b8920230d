//! MCP session, the facade handed to hosts.
//!
//! Wraps a [`ConnectionManager`] behind a cheaply cloneable handle so a host
//! can connect from one task, invoke tools from another, and disconnect from
//! a shutdown hook.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{ConnectionConfig, SessionConfig};

use super::catalog::ToolCatalog;
use super::connection::ConnectionManager;
use super::errors::McpError;
use super::invoker::RawArguments;
use super::log_bus::LogBus;
use super::types::{ConnectionState, LogEvent, ToolCallResult};

/// Cloneable handle to one server session.
#[derive(Clone)]
pub struct Session {
    id: Uuid,
    manager: Arc<ConnectionManager>,
}

impl Session {
    /// Create a disconnected session.
    pub fn new(config: ConnectionConfig) -> Self {
        let id = Uuid::new_v4();
        let manager = ConnectionManager::new(config, LogBus::new("session"));
        Self {
            id,
            manager: Arc::new(manager),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.connection.clone())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn span(&self, op: &'static str) -> tracing::Span {
        tracing::info_span!("session", session_id = %self.id, op)
    }

    /// Launch the server named by `command` and discover its tools.
    pub async fn connect(&self, command: &str) -> Result<Arc<ToolCatalog>, McpError> {
        self.manager
            .connect(command)
            .instrument(self.span("connect"))
            .await
    }

    /// The tools of the connected server, in the order it reported them.
    pub fn list_tools(&self) -> Arc<ToolCatalog> {
        self.manager.catalog()
    }

    /// Run a tool with raw (usually textual) arguments.
    pub async fn invoke(&self, name: &str, args: RawArguments) -> Result<ToolCallResult, McpError> {
        self.manager
            .invoke(name, args)
            .instrument(self.span("invoke"))
            .await
    }

    /// Receive classified server log events published from now on.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogEvent> {
        self.manager.log_bus().subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    pub async fn is_transport_open(&self) -> bool {
        self.manager.is_transport_open().await
    }

    pub async fn is_server_running(&self) -> bool {
        self.manager.is_server_running().await
    }

    pub async fn server_pid(&self) -> Option<u32> {
        self.manager.server_pid().await
    }

    /// Stop the server and close the transport. Safe to call at any time.
    pub async fn disconnect(&self) {
        self.manager
            .disconnect()
            .instrument(self.span("disconnect"))
            .await
    }

    /// Final teardown before the host exits.
    pub async fn cleanup(&self) {
        tracing::info!(session_id = %self.id, "cleaning up session resources");
        self.disconnect().await;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
