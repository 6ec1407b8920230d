//! MCP session error types.

use thiserror::Error;

/// Errors that can occur during MCP session operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The launch command could not be split into an executable plus arguments.
    #[error("invalid launch command '{command}': {reason}")]
    InvalidCommand {
        command: String,
        reason: String,
    },

    /// The server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The server process could not be stopped.
    #[error("failed to terminate server '{name}': {reason}")]
    TerminateFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error, EOF).
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// A request did not receive its response in time.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Every connection attempt failed.
    #[error("server '{name}' failed to connect after {attempts} attempts: {source}")]
    ConnectionExhausted {
        name: String,
        attempts: u32,
        #[source]
        source: Box<McpError>,
    },

    /// Tool not found in the catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// A required argument was not supplied.
    #[error("missing required argument '{argument}' for '{tool}'")]
    MissingArgument {
        tool: String,
        argument: String,
    },

    /// An argument value could not be coerced to its declared kind.
    #[error("invalid argument '{argument}' for '{tool}': {reason}")]
    InvalidArgument {
        tool: String,
        argument: String,
        reason: String,
    },

    /// A tool call failed below the protocol layer.
    #[error("tool call '{tool}' failed: {source}")]
    ToolCallFailed {
        tool: String,
        #[source]
        source: Box<McpError>,
    },

    /// `connect` was called while another connect sequence is running.
    #[error("a connect sequence is already in progress")]
    AlreadyConnecting,

    /// No server is connected.
    #[error("not connected to a server")]
    NotConnected,

    /// The operation was interrupted by `disconnect`.
    #[error("operation cancelled by disconnect")]
    Cancelled,

    /// Configuration error (unreadable or malformed config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Whether a connect attempt that failed with this error may be retried.
    ///
    /// Configuration and caller errors are final; process and protocol
    /// failures are worth another attempt.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            McpError::SpawnFailed { .. }
                | McpError::Transport { .. }
                | McpError::Timeout { .. }
                | McpError::ServerError { .. }
        )
    }

    /// Name of the tool a caller-facing error refers to, if any.
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            McpError::UnknownTool { name } => Some(name),
            McpError::MissingArgument { tool, .. }
            | McpError::InvalidArgument { tool, .. }
            | McpError::ToolCallFailed { tool, .. } => Some(tool),
            _ => None,
        }
    }
}
