//! Fire-and-forget status notifications for external displays.

use serde::Serialize;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

/// The component that produced a [`StatusEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    ProcessSupervisor,
    ConnectionManager,
    ResourceMonitor,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::ProcessSupervisor => "process",
            Component::ConnectionManager => "connection",
            Component::ResourceMonitor => "resources",
        };
        f.write_str(name)
    }
}

/// A single state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub component: Component,
    pub state: String,
    pub message: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// Broadcast fan-out of [`StatusEvent`]s.
///
/// Cloning yields another handle onto the same channel.
#[derive(Debug, Clone)]
pub struct StatusBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Slow subscribers lag (and skip) once `capacity` events are buffered.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, component: Component, state: impl fmt::Display, message: impl Into<String>) {
        let event = StatusEvent {
            component,
            state: state.to_string(),
            message: message.into(),
            timestamp_ms: now_ms(),
        };
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
