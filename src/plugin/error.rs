//! Plugin runtime error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur during plugin operations.
///
/// Every variant is recoverable and returned to the caller as a typed result.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Manifest is malformed or a required field is missing.
    #[error("Invalid plugin manifest at `{path}`: {reason}")]
    ManifestInvalid { path: String, reason: String },

    /// A plugin with this id is already installed.
    #[error("Plugin '{0}' is already installed")]
    IdConflict(String),

    /// Capability call or activation without a grant.
    #[error("Plugin '{plugin}' requires permission '{permission}' which is not granted")]
    PermissionDenied { plugin: String, permission: String },

    /// Grant or revoke on a permission the manifest never declared.
    #[error("Plugin '{plugin}' does not declare permission '{permission}'")]
    UnknownPermission { plugin: String, permission: String },

    /// Entry point threw, panicked or timed out.
    #[error("Plugin '{plugin}' failed to activate: {message}")]
    ActivationFailure { plugin: String, message: String },

    /// Activation aborted by a resource ceiling.
    #[error("Plugin '{plugin}' exceeded its {resource} limit ({used} > {limit})")]
    ResourceLimitExceeded { plugin: String, resource: String, limit: u64, used: u64 },

    /// A command or teardown hook failed, panicked or timed out.
    #[error("Plugin '{plugin}' execution failed: {message}")]
    Execution { plugin: String, message: String },

    /// Install target directory already belongs to another installed plugin.
    #[error("Plugin directory {path:?} belongs to installed plugin '{owner}'")]
    PathConflict { path: PathBuf, owner: String },

    /// Command id already owned by another plugin.
    #[error("Command '{command}' is already registered by plugin '{owner}'")]
    CommandIdConflict { command: String, owner: String },

    /// Unknown plugin id (or command id).
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Illegal lifecycle transition.
    #[error("Plugin '{plugin}' cannot go from {from} to {to}")]
    InvalidTransition { plugin: String, from: String, to: String },

    /// Operation cancelled by the caller.
    #[error("Operation on plugin '{0}' was cancelled")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while reading or writing persisted state.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PluginError {
    /// Shorthand for a manifest error at a field path.
    pub fn manifest(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ManifestInvalid { path: path.into(), reason: reason.into() }
    }

    /// Whether this error moves the plugin into the `Error` state when
    /// raised during activation.
    pub fn is_activation_fault(&self) -> bool {
        matches!(
            self,
            Self::ActivationFailure { .. }
                | Self::ResourceLimitExceeded { .. }
                | Self::CommandIdConflict { .. }
        )
    }
}

/// Non-fatal conditions reported alongside a successful operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginWarning {
    /// Uninstall succeeded logically but the directory could not be removed.
    #[error("Plugin directory {path:?} could not be removed: {reason}")]
    Orphaned { path: PathBuf, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_error_display() {
        let err = PluginError::manifest("info.id", "must not be empty");
        assert_eq!(err.to_string(), "Invalid plugin manifest at `info.id`: must not be empty");
    }

    #[test]
    fn test_activation_faults() {
        let fault = PluginError::ResourceLimitExceeded {
            plugin: "p".to_string(),
            resource: "memory".to_string(),
            limit: 1,
            used: 2,
        };
        assert!(fault.is_activation_fault());
        assert!(!PluginError::NotFound("p".to_string()).is_activation_fault());
    }

    #[test]
    fn test_path_conflict_names_owner() {
        let err = PluginError::PathConflict { path: PathBuf::from("/plugins/foo"), owner: "bar".to_string() };
        assert_eq!(err.to_string(), "Plugin directory \"/plugins/foo\" belongs to installed plugin 'bar'");
    }
}
