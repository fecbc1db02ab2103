//! Lifecycle manager: the single writer of plugin state.
//!
//! `activate`, `deactivate`, `recover`, `reload` and uninstall purges for a
//! plugin id each run as one critical section under that id's lock, so a
//! concurrent activation and uninstall of the same plugin cannot interleave.
//! Operations on different ids proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::locks::{LifecycleGuard, PluginLocks};
use super::sandbox::{run_bounded, Phase};
use super::{
    CommandRegistry, EngineRegistry, EventBus, HostCapabilities, PermissionManager, Plugin,
    PluginCommand, PluginContext, PluginEntry, PluginError, PluginEventKind, PluginRegistry,
    PluginResult, ResourceLimits, ResourceMeter, ResourceUsageStats, StorageHandle,
    StorageSandbox, Transition,
};

/// A running plugin: its entry hooks and the context it was activated with.
#[derive(Clone)]
struct ActiveInstance {
    entry: Arc<dyn PluginEntry>,
    ctx: PluginContext,
}

/// Runtime components the lifecycle manager coordinates.
#[derive(Debug, Clone)]
pub struct RuntimeParts {
    pub registry: Arc<PluginRegistry>,
    pub permissions: Arc<PermissionManager>,
    pub commands: Arc<CommandRegistry>,
    pub storage: Arc<StorageSandbox>,
    pub host: Arc<HostCapabilities>,
    pub engines: Arc<EngineRegistry>,
    pub events: EventBus,
}

/// State machine driver for installed plugins.
pub struct LifecycleManager {
    parts: RuntimeParts,
    limits: ResourceLimits,
    locks: PluginLocks,
    active: RwLock<HashMap<String, ActiveInstance>>,
    meters: RwLock<HashMap<String, Arc<ResourceMeter>>>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut active: Vec<_> = self.active.read().keys().cloned().collect();
        active.sort();
        f.debug_struct("LifecycleManager")
            .field("limits", &self.limits)
            .field("active", &active)
            .finish()
    }
}

impl LifecycleManager {
    pub fn new(parts: RuntimeParts, limits: ResourceLimits) -> Self {
        Self {
            parts,
            limits,
            locks: PluginLocks::new(),
            active: RwLock::new(HashMap::new()),
            meters: RwLock::new(HashMap::new()),
        }
    }

    pub fn parts(&self) -> &RuntimeParts {
        &self.parts
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Take the lifecycle lock for `plugin_id`.
    pub async fn lock(&self, plugin_id: &str) -> LifecycleGuard {
        self.locks.acquire(plugin_id).await
    }

    fn meter_for(&self, plugin_id: &str) -> Arc<ResourceMeter> {
        let mut meters = self.meters.write();
        Arc::clone(
            meters
                .entry(plugin_id.to_string())
                .or_insert_with(|| Arc::new(ResourceMeter::new(plugin_id, self.limits))),
        )
    }

    fn context_for(&self, plugin: &Plugin, meter: Arc<ResourceMeter>) -> PluginContext {
        let id = plugin.id();
        let storage = StorageHandle::new(
            id,
            Arc::clone(&self.parts.storage),
            Arc::clone(&self.parts.permissions),
        );
        PluginContext::new(
            id,
            plugin.manifest.capabilities.clone(),
            Arc::clone(&self.parts.permissions),
            storage,
            meter,
            Arc::clone(&self.parts.host),
        )
    }

    /// Record a failed activation: state becomes `Error`, the error is returned.
    fn fail<T>(&self, guard: &LifecycleGuard, plugin_id: &str, err: PluginError) -> PluginResult<T> {
        let message = err.to_string();
        warn!(plugin = plugin_id, error = %message, "activation failed");
        if let Err(e) =
            self.parts.registry.transition(guard, plugin_id, Transition::Fail { message: message.clone() })
        {
            error!(plugin = plugin_id, error = %e, "could not record activation failure");
        }
        self.parts.events.publish(plugin_id, PluginEventKind::Failed { message });
        Err(err)
    }

    /// Run the teardown hook; failures are logged only.
    async fn teardown(&self, plugin_id: &str, instance: &ActiveInstance) {
        let meter = self.meter_for(plugin_id);
        let entry = Arc::clone(&instance.entry);
        let ctx = instance.ctx.clone();
        let hook = async move { entry.deactivate(&ctx).await };
        if let Err(e) = run_bounded(&meter, Phase::Deactivate, hook).await {
            warn!(plugin = plugin_id, error = %e, "teardown hook failed");
        }
    }

    /// Commit a running plugin's buffered storage writes; failures are logged only.
    fn commit_storage(&self, plugin_id: &str, instance: &ActiveInstance) -> usize {
        match instance.ctx.storage().flush() {
            Ok(writes) => {
                debug!(plugin = plugin_id, writes, "storage flushed");
                writes
            }
            Err(e) => {
                warn!(plugin = plugin_id, error = %e, "storage flush failed");
                0
            }
        }
    }

    /// Activate a plugin.
    ///
    /// Returns the command ids it registered.
    pub async fn activate(&self, plugin_id: &str) -> PluginResult<Vec<String>> {
        let guard = self.lock(plugin_id).await;
        self.activate_locked(&guard, plugin_id).await
    }

    pub(crate) async fn activate_locked(
        &self,
        guard: &LifecycleGuard,
        plugin_id: &str,
    ) -> PluginResult<Vec<String>> {
        let plugin = self.parts.registry.get(plugin_id)?;
        plugin.state.transition(plugin_id, Transition::Activate { commands: Vec::new() })?;

        let missing = self.parts.permissions.missing(plugin_id)?;
        if let Some(permission) = missing.first() {
            info!(plugin = plugin_id, ?missing, "activation blocked on ungranted permissions");
            return Err(PluginError::PermissionDenied {
                plugin: plugin_id.to_string(),
                permission: permission.clone(),
            });
        }

        let meter = self.meter_for(plugin_id);
        meter.reset();
        let instance = match self.parts.engines.resolve(&plugin) {
            Ok(entry) => ActiveInstance { entry, ctx: self.context_for(&plugin, Arc::clone(&meter)) },
            Err(e) => return self.fail(guard, plugin_id, e),
        };

        let hook = {
            let entry = Arc::clone(&instance.entry);
            let ctx = instance.ctx.clone();
            async move { entry.activate(&ctx).await }
        };
        if let Err(e) = run_bounded(&meter, Phase::Activate, hook).await {
            instance.ctx.storage().discard();
            return self.fail(guard, plugin_id, e);
        }

        let commands: Vec<PluginCommand> = plugin
            .manifest
            .command_contributions()
            .map(|c| PluginCommand::from_contribution(plugin_id, c))
            .collect();
        let ids = match self.parts.commands.register_batch(plugin_id, commands) {
            Ok(ids) => ids,
            Err(e) => {
                self.teardown(plugin_id, &instance).await;
                instance.ctx.storage().discard();
                return self.fail(guard, plugin_id, e);
            }
        };

        if let Err(e) = self.parts.registry.transition(
            guard,
            plugin_id,
            Transition::Activate { commands: ids.clone() },
        ) {
            self.parts.commands.unregister_all(plugin_id);
            self.teardown(plugin_id, &instance).await;
            instance.ctx.storage().discard();
            return self.fail(guard, plugin_id, e);
        }

        self.commit_storage(plugin_id, &instance);
        self.active.write().insert(plugin_id.to_string(), instance);
        info!(plugin = plugin_id, commands = ids.len(), "plugin activated");
        self.parts.events.publish(plugin_id, PluginEventKind::Activated { commands: ids.clone() });
        Ok(ids)
    }

    /// Deactivate an activated plugin.
    ///
    /// Bookkeeping always completes: a failing teardown hook is logged and
    /// does not move the plugin to `Error`.
    pub async fn deactivate(&self, plugin_id: &str) -> PluginResult<()> {
        let guard = self.lock(plugin_id).await;
        self.deactivate_locked(&guard, plugin_id).await
    }

    pub(crate) async fn deactivate_locked(
        &self,
        guard: &LifecycleGuard,
        plugin_id: &str,
    ) -> PluginResult<()> {
        let plugin = self.parts.registry.get(plugin_id)?;
        plugin.state.transition(plugin_id, Transition::Deactivate)?;

        let instance = self.active.write().remove(plugin_id);
        if let Some(instance) = &instance {
            self.teardown(plugin_id, instance).await;
        }

        let removed = self.parts.commands.unregister_all(plugin_id);
        debug!(plugin = plugin_id, commands = removed.len(), "commands unregistered");

        if let Some(instance) = &instance {
            self.commit_storage(plugin_id, instance);
        }

        self.parts.registry.transition(guard, plugin_id, Transition::Deactivate)?;
        info!(plugin = plugin_id, "plugin deactivated");
        self.parts.events.publish(plugin_id, PluginEventKind::Deactivated);
        Ok(())
    }

    /// Move a failed plugin back to `Loaded`. Does not re-activate.
    pub async fn recover(&self, plugin_id: &str) -> PluginResult<()> {
        let guard = self.lock(plugin_id).await;
        self.parts.registry.transition(&guard, plugin_id, Transition::Recover)?;
        info!(plugin = plugin_id, "plugin recovered");
        self.parts.events.publish(plugin_id, PluginEventKind::Recovered);
        Ok(())
    }

    /// Deactivate then activate again in one critical section.
    pub async fn reload(&self, plugin_id: &str) -> PluginResult<Vec<String>> {
        let guard = self.lock(plugin_id).await;
        self.deactivate_locked(&guard, plugin_id).await?;
        self.activate_locked(&guard, plugin_id).await
    }

    /// Remove every trace of a plugin from the runtime.
    ///
    /// An activated plugin is deactivated first, best-effort. Returns the
    /// removed registry record so the caller can clean up its directory.
    pub(crate) async fn purge_locked(
        &self,
        guard: &LifecycleGuard,
        plugin_id: &str,
    ) -> PluginResult<Plugin> {
        let plugin = self.parts.registry.get(plugin_id)?;

        if plugin.state.is_active() {
            if let Err(e) = self.deactivate_locked(guard, plugin_id).await {
                warn!(plugin = plugin_id, error = %e, "deactivation before uninstall reported an issue");
            }
        }
        if let Some(instance) = self.active.write().remove(plugin_id) {
            instance.ctx.storage().discard();
        }
        self.parts.commands.unregister_all(plugin_id);

        self.parts.registry.transition(guard, plugin_id, Transition::Uninstall)?;
        let removed = self.parts.registry.remove(guard, plugin_id)?;
        self.meters.write().remove(plugin_id);

        // The record is gone; rows left on disk by a failed save are swept on the next open.
        if let Err(e) = self.parts.permissions.purge(plugin_id) {
            warn!(plugin = plugin_id, error = %e, "grant rows not purged");
        }
        if let Err(e) = self.parts.storage.clear(plugin_id) {
            warn!(plugin = plugin_id, error = %e, "storage namespace not cleared");
        }

        info!(plugin = plugin_id, "plugin purged");
        self.parts.events.publish(plugin_id, PluginEventKind::Uninstalled);
        Ok(removed)
    }

    /// Context of an activated plugin.
    pub fn context(&self, plugin_id: &str) -> Option<PluginContext> {
        self.active.read().get(plugin_id).map(|instance| instance.ctx.clone())
    }

    pub fn is_running(&self, plugin_id: &str) -> bool {
        self.active.read().contains_key(plugin_id)
    }

    /// Run a registered command on its owning plugin.
    pub async fn execute(&self, command_id: &str, args: Value) -> PluginResult<Value> {
        let command = self.parts.commands.lookup(command_id)?;
        let instance = self
            .active
            .read()
            .get(&command.plugin_id)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(command.plugin_id.clone()))?;

        let meter = self.meter_for(&command.plugin_id);
        let command_id = command.command_id.clone();
        let running = instance.clone();
        let hook = async move { running.entry.execute(&running.ctx, &command_id, args).await };
        let output = run_bounded(&meter, Phase::Execute, hook).await?;
        self.commit_storage(&command.plugin_id, &instance);
        Ok(output)
    }

    /// Commit the buffered storage writes of every running plugin.
    ///
    /// Plugins stay `Activated`, so the next start restores them. Returns
    /// the number of writes committed.
    pub fn shutdown(&self) -> usize {
        let running: Vec<(String, ActiveInstance)> =
            self.active.read().iter().map(|(id, i)| (id.clone(), i.clone())).collect();
        let writes: usize = running.iter().map(|(id, instance)| self.commit_storage(id, instance)).sum();
        info!(plugins = running.len(), writes, "plugin runtime shut down");
        writes
    }

    /// Resource usage of a plugin against its limits.
    pub fn resource_usage(&self, plugin_id: &str) -> PluginResult<ResourceUsageStats> {
        self.parts.registry.get(plugin_id)?;
        let usage = match self.meters.read().get(plugin_id) {
            Some(meter) => meter.usage(),
            None => ResourceMeter::new(plugin_id, self.limits).usage(),
        };
        Ok(usage)
    }

    /// Bring plugins persisted as `Activated` back to a consistent state.
    ///
    /// Nothing is running after a restart, so each such plugin is first
    /// marked `Deactivated`; with `reactivate` it is then activated again.
    /// Plugins are handled concurrently; each result is reported per id.
    pub async fn restore(&self, reactivate: bool) -> Vec<(String, PluginResult<Vec<String>>)> {
        let stale: Vec<String> = self
            .parts
            .registry
            .list_all()
            .into_iter()
            .filter(|p| p.state.is_active() && !self.is_running(p.id()))
            .map(|p| p.id().to_string())
            .collect();

        let tasks = stale.into_iter().map(|id| async move {
            let guard = self.lock(&id).await;
            let result = match self.parts.registry.transition(&guard, &id, Transition::Deactivate) {
                Ok(_) if reactivate => self.activate_locked(&guard, &id).await,
                Ok(_) => Ok(Vec::new()),
                Err(e) => Err(e),
            };
            (id, result)
        });
        join_all(tasks).await
    }

    /// Drop lock entries nobody holds or waits on.
    pub(crate) fn prune_locks(&self) {
        self.locks.prune();
    }
}
