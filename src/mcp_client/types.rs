//! Shared types for the MCP session.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the leveled log
//! events produced from a server's diagnostic output.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// `None` when the server sent `"id": null` (or omitted it).
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
    /// Opaque cursor for the next page, when the server paginates.
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// A named, schema-described operation exposed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: InputSchema,
}

/// Argument schema of a tool: `{type: "object", properties?, required?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default = "default_schema_type")]
    pub schema_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

fn default_schema_type() -> String {
    "object".to_string()
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            schema_type: default_schema_type(),
            properties: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

impl InputSchema {
    /// Whether `name` is listed as a required argument.
    pub fn is_required(&self, name: &str) -> bool {
        self.required.iter().any(|r| r == name)
    }
}

/// Schema of a single argument. Only `type` is interpreted by the client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<SchemaType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The `type` keyword of a property: a name, a union such as
/// `["integer", "null"]`, or something the client does not understand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaType {
    Single(String),
    Union(Vec<String>),
    Unknown(serde_json::Value),
}

impl SchemaType {
    /// The type name the client acts on. For a union that is the first
    /// non-`null` member.
    pub fn primary(&self) -> Option<&str> {
        match self {
            SchemaType::Single(name) => Some(name),
            SchemaType::Union(names) => names.iter().map(String::as_str).find(|n| *n != "null"),
            SchemaType::Unknown(_) => None,
        }
    }
}

impl From<&str> for SchemaType {
    fn from(name: &str) -> Self {
        SchemaType::Single(name.to_string())
    }
}

impl PropertySchema {
    /// The declared kind, with a missing type mapped to `String` and
    /// anything unrecognised passed through as `Other`.
    pub fn arg_kind(&self) -> ArgKind {
        let Some(kind) = &self.kind else {
            return ArgKind::String;
        };
        match kind.primary() {
            Some("string") => ArgKind::String,
            Some("number") | Some("integer") => ArgKind::Number,
            Some("boolean") => ArgKind::Boolean,
            Some("object") => ArgKind::Object,
            Some(other) => ArgKind::Other(other.to_string()),
            None => ArgKind::Other(
                serde_json::to_string(kind).unwrap_or_else(|_| "unknown".to_string()),
            ),
        }
    }
}

/// Primitive argument kinds understood by the invoker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Number,
    Boolean,
    Object,
    Other(String),
}

/// Result of a tool call execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub success: bool,
    /// The `content` payload returned by the server, uninterpreted.
    pub content: serde_json::Value,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

// ─── Connection State ────────────────────────────────────────────────────────

/// Lifecycle of a connection to one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

// ─── Log Events ──────────────────────────────────────────────────────────────

/// Severity of a server diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Map a protocol level string onto the four levels.
    ///
    /// MCP uses syslog severities; the extra ones fold into the nearest level.
    pub fn from_protocol(level: &str) -> Self {
        match level.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warning" | "warn" => LogLevel::Warning,
            "error" | "critical" | "alert" | "emergency" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a log event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// A line from the server's stderr.
    Stderr,
    /// A log notification the server sent over stdout.
    Protocol,
    /// Lifecycle messages produced by the client itself (e.g. process exit).
    Client,
}

/// A leveled diagnostic event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>, source: LogSource) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
            source,
        }
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
