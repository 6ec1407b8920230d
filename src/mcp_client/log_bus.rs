//! Fan-out of classified log events to subscribers.
//!
//! Every published event is mirrored into `tracing` so it reaches the
//! application log even when nobody is subscribed.

use tokio::sync::broadcast;

use super::types::{LogEvent, LogLevel};

/// Events buffered per subscriber before the slowest one starts lagging.
const LOG_BUS_CAPACITY: usize = 256;

/// Cloneable publisher of [`LogEvent`]s.
#[derive(Debug, Clone)]
pub struct LogBus {
    server: String,
    sender: broadcast::Sender<LogEvent>,
}

impl LogBus {
    pub fn new(server: &str) -> Self {
        let (sender, _) = broadcast::channel(LOG_BUS_CAPACITY);
        Self {
            server: server.to_string(),
            sender,
        }
    }

    /// A copy of this bus that reports under a different server name but
    /// delivers to the same subscribers.
    pub fn for_server(&self, server: &str) -> Self {
        Self {
            server: server.to_string(),
            sender: self.sender.clone(),
        }
    }

    /// Register a new subscriber. It receives events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: LogEvent) {
        let server = self.server.as_str();
        match event.level {
            LogLevel::Debug => tracing::debug!(server, source = ?event.source, "{}", event.message),
            LogLevel::Info => tracing::info!(server, source = ?event.source, "{}", event.message),
            LogLevel::Warning => tracing::warn!(server, source = ?event.source, "{}", event.message),
            LogLevel::Error => tracing::error!(server, source = ?event.source, "{}", event.message),
        }
        // No subscribers is fine; the event was already traced.
        let _ = self.sender.send(event);
    }
}
