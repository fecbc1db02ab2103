//! Lifecycle event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

/// What happened to a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginEventKind {
    Installed,
    Activated { commands: Vec<String> },
    Deactivated,
    Failed { message: String },
    Recovered,
    Uninstalled,
    PermissionGranted { permission: String },
    PermissionRevoked { permission: String },
    SettingsUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginEvent {
    pub id: Uuid,
    pub plugin_id: String,
    #[serde(flatten)]
    pub kind: PluginEventKind,
    pub timestamp: DateTime<Utc>,
}

impl PluginEvent {
    pub fn new(plugin_id: &str, kind: PluginEventKind) -> Self {
        Self { id: Uuid::new_v4(), plugin_id: plugin_id.to_string(), kind, timestamp: Utc::now() }
    }
}

/// Fan-out of plugin events to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PluginEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn publish(&self, plugin_id: &str, kind: PluginEventKind) {
        let event = PluginEvent::new(plugin_id, kind);
        trace!(plugin = plugin_id, kind = ?event.kind, "plugin event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
