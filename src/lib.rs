//! Client-side session core for MCP tool servers over stdio.
//!
//! Launches a tool server as a child process, performs the MCP handshake
//! with bounded retries, discovers the server's tools, and dispatches
//! validated tool calls. Server diagnostics are classified into leveled
//! [`LogEvent`]s that hosts can subscribe to.
//!
//! ```no_run
//! # async fn demo() -> Result<(), mcp_session::McpError> {
//! use mcp_session::{config::ConnectionConfig, RawArguments, Session};
//!
//! let session = Session::new(ConnectionConfig::default());
//! let catalog = session.connect("python3 server.py").await?;
//! for tool in catalog.iter() {
//!     println!("{}", tool.name);
//! }
//!
//! let mut args = RawArguments::new();
//! args.insert("count".into(), "3".into());
//! let result = session.invoke("create_entities", args).await?;
//! println!("{}", result.content);
//!
//! session.cleanup().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logging;
pub mod mcp_client;

pub use config::{ConnectionConfig, LoggingConfig, SessionConfig};
pub use mcp_client::{
    ConnectionManager, ConnectionState, LaunchCommand, LogEvent, LogLevel, LogSource, McpError,
    RawArguments, Session, Tool, ToolCallResult, ToolCatalog,
};
