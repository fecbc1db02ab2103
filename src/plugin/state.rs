//! Plugin lifecycle state machine.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{PluginError, PluginResult};

/// Lifecycle state of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PluginState {
    /// Not registered.
    Unloaded,
    /// Registered and inactive.
    Loaded,
    /// Running, with the command ids it contributed.
    Activated { commands: Vec<String> },
    /// Was active, now stopped.
    Deactivated,
    /// Failed; the message is surfaced to the user.
    Error { message: String },
}

impl Default for PluginState {
    fn default() -> Self {
        Self::Loaded
    }
}

/// Lifecycle events that drive [`PluginState::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Install,
    Activate { commands: Vec<String> },
    Deactivate,
    Fail { message: String },
    Recover,
    Uninstall,
}

impl Transition {
    fn target(&self) -> &'static str {
        match self {
            Self::Install => "loaded",
            Self::Activate { .. } => "activated",
            Self::Deactivate => "deactivated",
            Self::Fail { .. } => "error",
            Self::Recover => "loaded",
            Self::Uninstall => "unloaded",
        }
    }
}

impl PluginState {
    /// Short lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Activated { .. } => "activated",
            Self::Deactivated => "deactivated",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Activated { .. })
    }

    /// Commands owned while activated.
    pub fn commands(&self) -> &[String] {
        match self {
            Self::Activated { commands } => commands,
            _ => &[],
        }
    }

    /// Captured failure message.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { message } => Some(message),
            _ => None,
        }
    }

    /// Compute the next state, rejecting illegal edges.
    pub fn transition(&self, plugin: &str, event: Transition) -> PluginResult<Self> {
        let next = match (self, event) {
            (Self::Unloaded, Transition::Install) => Self::Loaded,
            (Self::Loaded | Self::Deactivated, Transition::Activate { commands }) => {
                Self::Activated { commands }
            }
            (Self::Activated { .. }, Transition::Deactivate) => Self::Deactivated,
            (
                Self::Loaded | Self::Activated { .. } | Self::Deactivated,
                Transition::Fail { message },
            ) => Self::Error { message },
            (Self::Error { .. }, Transition::Recover) => Self::Loaded,
            (_, Transition::Uninstall) => Self::Unloaded,
            (
                Self::Loaded | Self::Activated { .. } | Self::Deactivated | Self::Error { .. },
                event @ Transition::Install,
            )
            | (
                Self::Unloaded | Self::Activated { .. } | Self::Error { .. },
                event @ Transition::Activate { .. },
            )
            | (
                Self::Unloaded | Self::Loaded | Self::Deactivated | Self::Error { .. },
                event @ Transition::Deactivate,
            )
            | (Self::Unloaded | Self::Error { .. }, event @ Transition::Fail { .. })
            | (
                Self::Unloaded | Self::Loaded | Self::Activated { .. } | Self::Deactivated,
                event @ Transition::Recover,
            ) => {
                return Err(PluginError::InvalidTransition {
                    plugin: plugin.to_string(),
                    from: self.name().to_string(),
                    to: event.target().to_string(),
                });
            }
        };
        Ok(next)
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activated { commands } => write!(f, "activated ({} commands)", commands.len()),
            Self::Error { message } => write!(f, "error: {message}"),
            other => f.write_str(other.name()),
        }
    }
}
