//! Tracing subscriber setup.
//!
//! Logs go to stderr by default. With `logging.file` set, each process
//! start rotates `session.log` and opens a fresh one with a line-flushing
//! writer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{expand_tilde, LoggingConfig};
use crate::mcp_client::errors::McpError;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "session.log";

/// Platform data directory for session state and logs.
///
/// Falls back to `~/.mcp-session/` when the platform directory is unknown.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-session");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-session")
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` overrides `config.filter`. Returns the log file path when
/// logging to a file.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<PathBuf>, McpError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let (writer, log_path) = if config.file {
        let (path, file) = open_log_file(&log_dir(config), config.keep)?;
        (BoxMakeWriter::new(file), Some(path))
    } else {
        (BoxMakeWriter::new(std::io::stderr), None)
    };
    let ansi = log_path.is_none();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| McpError::ConfigError {
        reason: format!("failed to install tracing subscriber: {e}"),
    })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.as_ref().map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== mcp-session starting ==="
    );

    Ok(log_path)
}

/// Configured log directory, or `<data dir>/logs`.
pub fn log_dir(config: &LoggingConfig) -> PathBuf {
    match config.dir.as_deref() {
        Some(dir) => PathBuf::from(expand_tilde(dir)),
        None => default_data_dir().join("logs"),
    }
}

/// Rotate then open `<dir>/session.log` for appending.
fn open_log_file(dir: &Path, keep: u32) -> Result<(PathBuf, FlushingWriter), McpError> {
    std::fs::create_dir_all(dir).map_err(|e| McpError::ConfigError {
        reason: format!("failed to create log dir {}: {e}", dir.display()),
    })?;

    let log_path = dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, keep);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| McpError::ConfigError {
            reason: format!("failed to open {}: {e}", log_path.display()),
        })?;

    Ok((log_path, FlushingWriter::new(file)))
}

/// Rotate log files: `session.log` → `session.log.1` → … → `.{keep}`.
///
/// The oldest file beyond `keep` is deleted. Missing files in the chain are
/// skipped. With `keep == 0` the current file is simply removed.
pub fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// File writer that flushes after every write, so log lines survive a crash.
#[derive(Clone)]
pub struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
