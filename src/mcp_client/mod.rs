//! MCP Client: a JSON-RPC over stdio session with one tool server.
//!
//! This module handles:
//! - Parsing the launch command and spawning the server child process
//! - JSON-RPC 2.0 communication over process stdio
//! - Connect with settle delays and bounded retries
//! - Tool discovery, argument validation, and tool call dispatch
//! - Classifying server diagnostic output into leveled log events
//!
//! [`Session`] is the entry point for hosts.

pub mod catalog;
pub mod command;
pub mod connection;
pub mod errors;
pub mod invoker;
pub mod log_bus;
pub mod log_classifier;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use catalog::ToolCatalog;
pub use command::LaunchCommand;
pub use connection::ConnectionManager;
pub use errors::McpError;
pub use invoker::RawArguments;
pub use log_bus::LogBus;
pub use log_classifier::classify;
pub use session::Session;
pub use types::{ConnectionState, LogEvent, LogLevel, LogSource, Tool, ToolCallResult};
