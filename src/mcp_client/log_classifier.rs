//! Classification of server diagnostic output into leveled log events.
//!
//! Servers are written against different logging conventions. A line is
//! checked, in order, as:
//! 1. a structured log notification (`{"method": "log", "params": {...}}`),
//! 2. a conventional text log line (`<time> - LEVEL - message`),
//! 3. plain output, which is reported at `info`.

use super::types::{LogEvent, LogLevel, LogSource};

/// Notification methods that carry a log record.
const LOG_METHODS: &[&str] = &["log", "notifications/message"];

/// Level markers searched in text lines, highest priority first.
const TEXT_LEVEL_MARKERS: &[(&str, LogLevel)] = &[
    ("ERROR", LogLevel::Error),
    ("WARNING", LogLevel::Warning),
    ("INFO", LogLevel::Info),
    ("DEBUG", LogLevel::Debug),
];

/// Field separator used by leveled text loggers (Python `logging`, etc.).
const FIELD_SEPARATOR: &str = " - ";

/// Classify one line of server diagnostic output.
pub fn classify(line: &str) -> LogEvent {
    if let Some(event) = classify_notification(line, LogSource::Stderr) {
        return event;
    }
    LogEvent::new(classify_text(line), line, LogSource::Stderr)
}

/// Parse a structured log notification, if `line` is one.
///
/// The level is taken from the notification as-is; missing fields default
/// to `info` and a placeholder message.
pub fn classify_notification(line: &str, source: LogSource) -> Option<LogEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    notification_event(&value, source)
}

/// Build a log event from an already-parsed JSON-RPC notification.
pub fn notification_event(value: &serde_json::Value, source: LogSource) -> Option<LogEvent> {
    let method = value.get("method")?.as_str()?;
    if !LOG_METHODS.contains(&method) {
        return None;
    }
    let params = value.get("params")?;
    if params.is_null() {
        return None;
    }

    let level = params
        .get("level")
        .and_then(|l| l.as_str())
        .map(LogLevel::from_protocol)
        .unwrap_or(LogLevel::Info);

    let message = match params.get("data") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => "No message data".to_string(),
        Some(other) => other.to_string(),
    };

    Some(LogEvent::new(level, message, source))
}

/// Level of a text line: marker search when it looks like a leveled log
/// line, `info` otherwise.
fn classify_text(line: &str) -> LogLevel {
    if !line.contains(FIELD_SEPARATOR) {
        return LogLevel::Info;
    }
    TEXT_LEVEL_MARKERS
        .iter()
        .find(|(marker, _)| line.contains(marker))
        .map(|(_, level)| *level)
        .unwrap_or(LogLevel::Info)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
