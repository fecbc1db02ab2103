//! Permission grant table.
//!
//! One row per declared permission per plugin, seeded `granted = false` at
//! install time. Capability call sites consult this table synchronously on
//! every call; nothing is cached per activation, so a revoke is visible to
//! the very next call. Grant and revoke never take the lifecycle lock.

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::persist::{load_json, save_json};
use super::{PermissionRisk, PermissionSpec, PluginError, PluginResult};

/// A declared permission joined with its grant state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionStatus {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub risk: PermissionRisk,
    pub granted: bool,
}

/// A permission still waiting for the user's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionRequest {
    pub name: String,
    pub description: String,
    pub risk: PermissionRisk,
    /// Medium and high risk requests need an explicit confirmation dialog.
    pub requires_confirmation: bool,
}

/// Grant rows keyed by plugin id, in manifest order per plugin.
type GrantTable = BTreeMap<String, Vec<PermissionStatus>>;

/// Tracks grant state per (plugin, permission) pair.
pub struct PermissionManager {
    path: Option<PathBuf>,
    table: RwLock<GrantTable>,
}

impl std::fmt::Debug for PermissionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionManager").field("plugins", &self.table.read().len()).finish()
    }
}

impl PermissionManager {
    /// Grant table that lives only in memory.
    pub fn in_memory() -> Self {
        Self { path: None, table: RwLock::new(GrantTable::new()) }
    }

    /// Open the grant table persisted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> PluginResult<Self> {
        let path = path.into();
        let table = load_json(&path)?;
        Ok(Self { path: Some(path), table: RwLock::new(table) })
    }

    fn save(&self, table: &GrantTable) -> PluginResult<()> {
        match &self.path {
            Some(path) => save_json(path, table),
            None => Ok(()),
        }
    }

    /// Create grant rows for a plugin's declared permissions.
    ///
    /// Rows that already exist keep their grant state; rows for names the
    /// manifest no longer declares are dropped.
    pub fn seed(&self, plugin_id: &str, declared: &[PermissionSpec]) -> PluginResult<()> {
        let mut table = self.table.write();
        let previous = table.remove(plugin_id).unwrap_or_default();

        let rows = declared
            .iter()
            .map(|spec| PermissionStatus {
                name: spec.name.clone(),
                description: spec.description.clone(),
                risk: spec.risk,
                granted: previous.iter().any(|row| row.name == spec.name && row.granted),
            })
            .collect();
        table.insert(plugin_id.to_string(), rows);
        self.save(&table)
    }

    fn set_granted(&self, plugin_id: &str, permission: &str, granted: bool) -> PluginResult<bool> {
        let mut table = self.table.write();
        let rows =
            table.get_mut(plugin_id).ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        let row = rows.iter_mut().find(|row| row.name == permission).ok_or_else(|| {
            PluginError::UnknownPermission {
                plugin: plugin_id.to_string(),
                permission: permission.to_string(),
            }
        })?;

        if row.granted == granted {
            return Ok(false);
        }
        row.granted = granted;
        self.save(&table)?;
        Ok(true)
    }

    /// Grant a declared permission. Idempotent; returns whether anything changed.
    pub fn grant(&self, plugin_id: &str, permission: &str) -> PluginResult<bool> {
        let changed = self.set_granted(plugin_id, permission, true)?;
        if changed {
            info!(plugin = plugin_id, permission, "permission granted");
        }
        Ok(changed)
    }

    /// Revoke a declared permission. Idempotent; effective for the next call.
    pub fn revoke(&self, plugin_id: &str, permission: &str) -> PluginResult<bool> {
        let changed = self.set_granted(plugin_id, permission, false)?;
        if changed {
            info!(plugin = plugin_id, permission, "permission revoked");
        }
        Ok(changed)
    }

    /// Whether `permission` is declared and granted for `plugin_id`.
    pub fn is_granted(&self, plugin_id: &str, permission: &str) -> bool {
        self.table
            .read()
            .get(plugin_id)
            .is_some_and(|rows| rows.iter().any(|row| row.name == permission && row.granted))
    }

    /// Fail with `PermissionDenied` unless the permission is granted.
    pub fn check(&self, plugin_id: &str, permission: &str) -> PluginResult<()> {
        let granted = self.is_granted(plugin_id, permission);
        debug!(plugin = plugin_id, permission, granted, "permission check");
        if granted {
            Ok(())
        } else {
            Err(PluginError::PermissionDenied {
                plugin: plugin_id.to_string(),
                permission: permission.to_string(),
            })
        }
    }

    /// Whether the plugin declares `permission`.
    pub fn is_declared(&self, plugin_id: &str, permission: &str) -> bool {
        self.table
            .read()
            .get(plugin_id)
            .is_some_and(|rows| rows.iter().any(|row| row.name == permission))
    }

    /// Declared permissions with their grant state.
    pub fn list_for_plugin(&self, plugin_id: &str) -> PluginResult<Vec<PermissionStatus>> {
        self.table
            .read()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))
    }

    /// Declared permissions that are not granted, in manifest order.
    pub fn missing(&self, plugin_id: &str) -> PluginResult<Vec<String>> {
        Ok(self
            .list_for_plugin(plugin_id)?
            .into_iter()
            .filter(|row| !row.granted)
            .map(|row| row.name)
            .collect())
    }

    /// Requests to show the user before the plugin can be activated.
    pub fn pending(&self, plugin_id: &str) -> PluginResult<Vec<PermissionRequest>> {
        Ok(self
            .list_for_plugin(plugin_id)?
            .into_iter()
            .filter(|row| !row.granted)
            .map(|row| PermissionRequest {
                requires_confirmation: row.risk.requires_confirmation(),
                name: row.name,
                description: row.description,
                risk: row.risk,
            })
            .collect())
    }

    /// Whether the plugin has a row set at all.
    pub fn contains(&self, plugin_id: &str) -> bool {
        self.table.read().contains_key(plugin_id)
    }

    /// Plugin ids that have grant rows.
    pub fn plugin_ids(&self) -> Vec<String> {
        self.table.read().keys().cloned().collect()
    }

    /// Drop every grant row of a plugin.
    pub fn purge(&self, plugin_id: &str) -> PluginResult<()> {
        let mut table = self.table.write();
        if table.remove(plugin_id).is_some() {
            self.save(&table)?;
        }
        Ok(())
    }
}
