//! The canonical table of installed plugins.
//!
//! Records are owned here and indexed by id. Everything else in the runtime
//! holds plugin ids only. State changes require a [`LifecycleGuard`] for the
//! id being changed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use super::locks::LifecycleGuard;
use super::persist::{load_json, save_json};
use super::{PluginError, PluginManifest, PluginResult, PluginState, Transition};

/// An installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    /// Plugin manifest, immutable once installed.
    pub manifest: PluginManifest,
    /// Managed directory holding the plugin's files.
    pub path: PathBuf,
    /// Lifecycle state.
    pub state: PluginState,
    /// User settings.
    #[serde(default)]
    pub settings: Map<String, Value>,
    /// Installation timestamp.
    pub installed_at: DateTime<Utc>,
    /// Last successful activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activated: Option<DateTime<Utc>>,
    /// SHA-256 of the installed `plugin.json`.
    #[serde(default)]
    pub manifest_digest: String,
}

impl Plugin {
    pub fn id(&self) -> &str {
        &self.manifest.info.id
    }

    /// Captured failure message when in the `Error` state.
    pub fn error(&self) -> Option<&str> {
        self.state.error_message()
    }
}

/// On-disk registry format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    plugins: BTreeMap<String, Plugin>,
}

/// Id-indexed store of installed plugins.
pub struct PluginRegistry {
    path: Option<PathBuf>,
    plugins: RwLock<BTreeMap<String, Plugin>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").field("plugins", &self.plugins.read().len()).finish()
    }
}

impl PluginRegistry {
    pub fn in_memory() -> Self {
        Self { path: None, plugins: RwLock::new(BTreeMap::new()) }
    }

    /// Open the registry persisted at `path` (usually `registry.json`).
    pub fn open(path: impl Into<PathBuf>) -> PluginResult<Self> {
        let path = path.into();
        let file: RegistryFile = load_json(&path)?;
        Ok(Self { path: Some(path), plugins: RwLock::new(file.plugins) })
    }

    fn save(&self, plugins: &BTreeMap<String, Plugin>) -> PluginResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = RegistryFile { plugins: plugins.clone() };
        save_json(path, &file)
    }

    /// Add a freshly installed plugin in state `Loaded`.
    pub fn register(
        &self,
        manifest: PluginManifest,
        path: PathBuf,
        manifest_digest: String,
    ) -> PluginResult<Plugin> {
        let mut plugins = self.plugins.write();
        let id = manifest.info.id.clone();
        if plugins.contains_key(&id) {
            return Err(PluginError::IdConflict(id));
        }

        let plugin = Plugin {
            state: PluginState::Unloaded.transition(&id, Transition::Install)?,
            settings: manifest.settings_defaults(),
            manifest,
            path,
            installed_at: Utc::now(),
            last_activated: None,
            manifest_digest,
        };
        plugins.insert(id.clone(), plugin.clone());
        if let Err(e) = self.save(&plugins) {
            plugins.remove(&id);
            return Err(e);
        }

        info!(plugin = %id, "plugin registered");
        Ok(plugin)
    }

    pub fn get(&self, id: &str) -> PluginResult<Plugin> {
        self.plugins.read().get(id).cloned().ok_or_else(|| PluginError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plugins.read().contains_key(id)
    }

    /// Id of the plugin whose files live at `path`, if any.
    pub fn owner_of(&self, path: &Path) -> Option<String> {
        self.plugins.read().values().find(|p| p.path == path).map(|p| p.id().to_string())
    }

    /// Snapshot of every plugin, ordered by id.
    pub fn list_all(&self) -> Vec<Plugin> {
        self.plugins.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().is_empty()
    }

    /// Apply a lifecycle transition to a plugin's state.
    pub fn transition(
        &self,
        guard: &LifecycleGuard,
        id: &str,
        event: Transition,
    ) -> PluginResult<PluginState> {
        guard.assert_holds(id);
        let mut plugins = self.plugins.write();
        let plugin = plugins.get_mut(id).ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        let activated = matches!(event, Transition::Activate { .. });
        let next = plugin.state.transition(id, event)?;
        let previous = std::mem::replace(&mut plugin.state, next.clone());
        let previous_activation = plugin.last_activated;
        if activated {
            plugin.last_activated = Some(Utc::now());
        }

        if let Err(e) = self.save(&plugins) {
            if let Some(plugin) = plugins.get_mut(id) {
                plugin.state = previous;
                plugin.last_activated = previous_activation;
            }
            return Err(e);
        }
        Ok(next)
    }

    /// Hard delete. Only the uninstall path calls this.
    pub fn remove(&self, guard: &LifecycleGuard, id: &str) -> PluginResult<Plugin> {
        guard.assert_holds(id);
        let mut plugins = self.plugins.write();
        let plugin = plugins.remove(id).ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        assert!(
            !plugin.state.is_active(),
            "plugin '{id}' removed from the registry while still activated"
        );
        if let Err(e) = self.save(&plugins) {
            plugins.insert(id.to_string(), plugin);
            return Err(e);
        }
        Ok(plugin)
    }

    /// Merge `patch` into a plugin's settings; `null` values remove keys.
    pub fn update_settings(
        &self,
        id: &str,
        patch: Map<String, Value>,
    ) -> PluginResult<Map<String, Value>> {
        let mut plugins = self.plugins.write();
        let plugin = plugins.get_mut(id).ok_or_else(|| PluginError::NotFound(id.to_string()))?;

        for (key, value) in patch {
            if value.is_null() {
                plugin.settings.remove(&key);
            } else {
                plugin.settings.insert(key, value);
            }
        }
        let settings = plugin.settings.clone();
        self.save(&plugins)?;
        Ok(settings)
    }
}
