//! Plugin manager: the control surface of the runtime.
//!
//! Wires the registry, grant table, command table, storage and lifecycle
//! together over one data directory and exposes the operations the host
//! application calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::Config;

use super::{
    CapabilityProvider, CommandRegistry, DiscoveredPlugin, EngineRegistry, EventBus,
    HostCapabilities, LifecycleManager, PermissionManager, PermissionRequest, PermissionStatus,
    Plugin, PluginCommand, PluginContext, PluginError, PluginEvent, PluginEventKind,
    PluginInstaller, PluginRegistry, PluginResult, ResourceUsageStats, RuntimeParts,
    ScriptEngine, SearchHit, SearchIndex, SearchOptions, StorageSandbox, UninstallReport,
};

const REGISTRY_FILE: &str = "registry.json";
const GRANTS_FILE: &str = "grants.json";
const STORAGE_DIR: &str = "storage";

/// Entry point to the plugin runtime.
#[derive(Debug)]
pub struct PluginManager {
    lifecycle: Arc<LifecycleManager>,
    installer: PluginInstaller,
    search: SearchOptions,
    data_dir: PathBuf,
}

impl PluginManager {
    /// Open the runtime described by `config` with the built-in engines.
    pub async fn open(config: &Config) -> PluginResult<Self> {
        Self::open_with(config, EngineRegistry::default(), HostCapabilities::new()).await
    }

    /// Open the runtime with host-supplied script engines and capability
    /// providers, so restored plugins activate against them.
    pub async fn open_with(
        config: &Config,
        engines: EngineRegistry,
        host: HostCapabilities,
    ) -> PluginResult<Self> {
        let data_dir = config.runtime.data_dir();
        let plugins_dir = config.runtime.plugins_dir();
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&plugins_dir)?;
        debug!(data_dir = %data_dir.display(), plugins_dir = %plugins_dir.display(), "opening plugin runtime");

        let parts = RuntimeParts {
            registry: Arc::new(PluginRegistry::open(data_dir.join(REGISTRY_FILE))?),
            permissions: Arc::new(PermissionManager::open(data_dir.join(GRANTS_FILE))?),
            commands: Arc::new(CommandRegistry::new()),
            storage: Arc::new(StorageSandbox::open(data_dir.join(STORAGE_DIR))?),
            host: Arc::new(host),
            engines: Arc::new(engines),
            events: EventBus::new(),
        };

        // Grant rows follow the registry; seeding keeps existing grants.
        for plugin in parts.registry.list_all() {
            parts.permissions.seed(plugin.id(), &plugin.manifest.permissions)?;
        }
        sweep_orphans(&parts)?;

        let lifecycle = Arc::new(LifecycleManager::new(parts, config.limits));
        let installer = PluginInstaller::new(
            plugins_dir,
            config.runtime.app_version.clone(),
            Arc::clone(&lifecycle),
        );

        for (id, result) in lifecycle.restore(config.runtime.restore_activated).await {
            match result {
                Ok(commands) if config.runtime.restore_activated => {
                    info!(plugin = %id, commands = commands.len(), "plugin restored");
                }
                Ok(_) => debug!(plugin = %id, "stale activation cleared"),
                Err(e) => warn!(plugin = %id, error = %e, "plugin could not be restored"),
            }
        }

        Ok(Self { lifecycle, installer, search: config.search, data_dir })
    }

    /// Commit every running plugin's buffered storage writes before the
    /// host exits. Activated plugins stay activated and are restored on the
    /// next [`open`](Self::open).
    pub fn shutdown(&self) -> usize {
        self.lifecycle.shutdown()
    }

    fn parts(&self) -> &RuntimeParts {
        self.lifecycle.parts()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn plugins_dir(&self) -> &Path {
        self.installer.plugins_dir()
    }

    // ------------------------------------------------------------------
    // Installation
    // ------------------------------------------------------------------

    /// Install a plugin from a directory or its `plugin.json`.
    pub async fn install(&self, source: &Path) -> PluginResult<Plugin> {
        self.installer.install(source, &CancellationToken::new()).await
    }

    /// Install, aborting cleanly if `cancel` fires before registration.
    pub async fn install_with_cancel(
        &self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> PluginResult<Plugin> {
        self.installer.install(source, cancel).await
    }

    pub async fn uninstall(&self, plugin_id: &str) -> PluginResult<UninstallReport> {
        self.installer.uninstall(plugin_id).await
    }

    /// Register valid plugin folders found in the plugins directory.
    pub async fn discover(&self) -> PluginResult<Vec<DiscoveredPlugin>> {
        self.installer.discover().await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn activate(&self, plugin_id: &str) -> PluginResult<Vec<String>> {
        self.lifecycle.activate(plugin_id).await
    }

    pub async fn deactivate(&self, plugin_id: &str) -> PluginResult<()> {
        self.lifecycle.deactivate(plugin_id).await
    }

    pub async fn recover(&self, plugin_id: &str) -> PluginResult<()> {
        self.lifecycle.recover(plugin_id).await
    }

    pub async fn reload(&self, plugin_id: &str) -> PluginResult<Vec<String>> {
        self.lifecycle.reload(plugin_id).await
    }

    /// Context of an activated plugin.
    pub fn context(&self, plugin_id: &str) -> Option<PluginContext> {
        self.lifecycle.context(plugin_id)
    }

    pub fn resource_usage(&self, plugin_id: &str) -> PluginResult<ResourceUsageStats> {
        self.lifecycle.resource_usage(plugin_id)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, plugin_id: &str) -> PluginResult<Plugin> {
        self.parts().registry.get(plugin_id)
    }

    /// All installed plugins, ordered by id.
    pub fn list(&self) -> Vec<Plugin> {
        self.parts().registry.list_all()
    }

    /// Ranked plugin search.
    pub fn search(&self, query: &str) -> Vec<Plugin> {
        self.search_hits(query).into_iter().map(|hit| hit.plugin).collect()
    }

    /// Ranked plugin search with match details.
    pub fn search_hits(&self, query: &str) -> Vec<SearchHit> {
        let snapshot = self.parts().registry.list_all();
        SearchIndex::new(&snapshot, self.search).search(query)
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    pub fn list_permissions(&self, plugin_id: &str) -> PluginResult<Vec<PermissionStatus>> {
        self.parts().permissions.list_for_plugin(plugin_id)
    }

    /// Declared permissions still waiting for a grant.
    pub fn pending_permissions(&self, plugin_id: &str) -> PluginResult<Vec<PermissionRequest>> {
        self.parts().permissions.pending(plugin_id)
    }

    /// Grant a declared permission. Returns whether anything changed.
    pub fn grant_permission(&self, plugin_id: &str, permission: &str) -> PluginResult<bool> {
        let changed = self.parts().permissions.grant(plugin_id, permission)?;
        if changed {
            self.parts().events.publish(
                plugin_id,
                PluginEventKind::PermissionGranted { permission: permission.to_string() },
            );
        }
        Ok(changed)
    }

    /// Revoke a permission. Takes effect on the plugin's next capability call.
    pub fn revoke_permission(&self, plugin_id: &str, permission: &str) -> PluginResult<bool> {
        let changed = self.parts().permissions.revoke(plugin_id, permission)?;
        if changed {
            self.parts().events.publish(
                plugin_id,
                PluginEventKind::PermissionRevoked { permission: permission.to_string() },
            );
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Registered commands, optionally for one plugin.
    pub fn list_commands(&self, plugin_id: Option<&str>) -> PluginResult<Vec<PluginCommand>> {
        let commands = &self.parts().commands;
        match plugin_id {
            Some(id) => {
                if !self.parts().registry.contains(id) {
                    return Err(PluginError::NotFound(id.to_string()));
                }
                Ok(commands.list_for_plugin(id))
            }
            None => Ok(commands.list_all()),
        }
    }

    pub fn lookup_command(&self, command_id: &str) -> PluginResult<PluginCommand> {
        self.parts().commands.lookup(command_id)
    }

    pub async fn execute_command(&self, command_id: &str, args: Value) -> PluginResult<Value> {
        self.lifecycle.execute(command_id, args).await
    }

    // ------------------------------------------------------------------
    // Settings and storage
    // ------------------------------------------------------------------

    pub fn get_settings(&self, plugin_id: &str) -> PluginResult<Map<String, Value>> {
        Ok(self.get(plugin_id)?.settings)
    }

    /// Merge `settings` into the plugin's settings; `null` removes a key.
    pub fn update_settings(
        &self,
        plugin_id: &str,
        settings: Map<String, Value>,
    ) -> PluginResult<Map<String, Value>> {
        let merged = self.parts().registry.update_settings(plugin_id, settings)?;
        self.parts().events.publish(plugin_id, PluginEventKind::SettingsUpdated);
        Ok(merged)
    }

    /// Keys in a plugin's storage namespace.
    pub fn storage_keys(&self, plugin_id: &str) -> PluginResult<Vec<String>> {
        self.parts().registry.get(plugin_id)?;
        Ok(self.parts().storage.keys(plugin_id))
    }

    // ------------------------------------------------------------------
    // Host integration
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.parts().events.subscribe()
    }

    /// Register (or replace) a script engine. Applies to later activations.
    pub fn register_engine(&self, engine: Arc<dyn ScriptEngine>) {
        self.parts().engines.register(engine);
    }

    /// Register (or replace) a host capability provider.
    pub fn register_provider(&self, provider: Arc<dyn CapabilityProvider>) {
        self.parts().host.register(provider);
    }
}

/// Drop grant rows and storage namespaces of ids the registry does not know,
/// e.g. left behind by an uninstall whose table writes failed.
fn sweep_orphans(parts: &RuntimeParts) -> PluginResult<()> {
    for id in parts.permissions.plugin_ids() {
        if !parts.registry.contains(&id) {
            warn!(plugin = %id, "removing grant rows of unknown plugin");
            parts.permissions.purge(&id)?;
        }
    }
    for id in parts.storage.plugin_ids() {
        if !parts.registry.contains(&id) {
            warn!(plugin = %id, "removing storage of unknown plugin");
            parts.storage.clear(&id)?;
        }
    }
    Ok(())
}
