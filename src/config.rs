//! Session configuration loading.
//!
//! Reads `mcp-session.yaml` and resolves environment variables. Every field
//! has a default, so an empty file (or no file at all) is a valid config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::supervisor::{SpawnOptions, DEFAULT_TERMINATE_GRACE};
use crate::mcp_client::transport::DEFAULT_REQUEST_TIMEOUT;

/// File name searched for by [`find_config_path`].
pub const CONFIG_FILE_NAME: &str = "mcp-session.yaml";

/// Environment variable that points directly at a config file.
pub const CONFIG_ENV_VAR: &str = "MCP_SESSION_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `mcp-session.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connect/retry behaviour and process environment.
///
/// The server protocol has no readiness signal, so startup is paced by two
/// fixed settle delays and a constant backoff between attempts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Connection attempts before giving up (default: 3).
    pub max_attempts: u32,
    /// Wait after spawning, before the handshake (default: 1000ms).
    pub spawn_settle_ms: u64,
    /// Wait after the handshake, before listing tools (default: 1000ms).
    pub handshake_settle_ms: u64,
    /// Constant wait between failed attempts (default: 2000ms).
    pub retry_backoff_ms: u64,
    /// Per-request response timeout (default: 30000ms).
    pub request_timeout_ms: u64,
    /// Time between SIGTERM and SIGKILL on shutdown (default: 500ms).
    pub terminate_grace_ms: u64,
    /// Name reported to the server in `clientInfo`.
    pub client_name: String,
    /// Version reported to the server in `clientInfo`.
    pub client_version: String,
    /// Working directory for the server process.
    pub cwd: Option<String>,
    /// Extra environment variables for the server process.
    pub env: HashMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            spawn_settle_ms: 1_000,
            handshake_settle_ms: 1_000,
            retry_backoff_ms: 2_000,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            terminate_grace_ms: DEFAULT_TERMINATE_GRACE.as_millis() as u64,
            client_name: "mcp-session".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            cwd: None,
            env: HashMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Attempts to make, never fewer than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn spawn_settle(&self) -> Duration {
        Duration::from_millis(self.spawn_settle_ms)
    }

    pub fn handshake_settle(&self) -> Duration {
        Duration::from_millis(self.handshake_settle_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Process environment for the supervisor.
    pub fn spawn_options(&self) -> SpawnOptions {
        SpawnOptions {
            cwd: self.cwd.as_deref().map(|d| PathBuf::from(expand_tilde(d))),
            env: self.env.clone(),
        }
    }
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Write to `session.log` instead of stderr.
    pub file: bool,
    /// Directory for `session.log`; the platform data dir when unset.
    /// `~` is expanded.
    pub dir: Option<String>,
    /// Rotated log files to keep.
    pub keep: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "mcp_session=info,warn".to_string(),
            json: false,
            file: false,
            dir: None,
            keep: 3,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// `MCP_SESSION_CONFIG` wins if it names an existing file; otherwise search
/// upward from `start` for `mcp-session.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::ConfigError {
        reason: format!("could not find {CONFIG_FILE_NAME}"),
    })
}

/// Load and parse a session config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_session_config(path: &Path) -> Result<SessionConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_session_config(&raw)
}

/// Parse config text (after env-var interpolation).
pub fn parse_session_config(raw: &str) -> Result<SessionConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(SessionConfig::default());
    }
    serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
        reason: format!("failed to parse config: {e}"),
    })
}

/// Find and load the config, falling back to defaults when no file exists.
pub fn load_or_default(start: &Path) -> Result<SessionConfig, McpError> {
    match find_config_path(start) {
        Ok(path) => {
            tracing::info!(path = %path.display(), "loading session config");
            load_session_config(&path)
        }
        Err(_) => Ok(SessionConfig::default()),
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
