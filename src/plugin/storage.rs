//! Per-plugin sandboxed key/value storage.
//!
//! [`StorageSandbox`] is the runtime's view: every call names the namespace.
//! Plugins only ever see a [`StorageHandle`], which is bound to the plugin id
//! of the execution context it was created for and cannot address any other
//! namespace. Handle writes are buffered and committed on [`StorageHandle::flush`],
//! which the lifecycle manager calls after a successful activation or command,
//! on deactivation and on shutdown. A failed activation discards them.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::debug;

use super::persist::{load_json, save_json};
use super::{Capability, PermissionManager, PluginResult};

type Namespace = Map<String, Value>;

/// Namespaced key/value store, one namespace per plugin id.
pub struct StorageSandbox {
    root: Option<PathBuf>,
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl std::fmt::Debug for StorageSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSandbox")
            .field("root", &self.root)
            .field("namespaces", &self.namespaces.read().len())
            .finish()
    }
}

impl StorageSandbox {
    pub fn in_memory() -> Self {
        Self { root: None, namespaces: RwLock::new(HashMap::new()) }
    }

    /// Open the sandbox persisted under `root`, one `<plugin_id>.json` per namespace.
    pub fn open(root: impl Into<PathBuf>) -> PluginResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let mut namespaces = HashMap::new();
        for entry in std::fs::read_dir(&root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(plugin_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let namespace: Namespace = load_json(&path)?;
            namespaces.insert(plugin_id.to_string(), namespace);
        }

        Ok(Self { root: Some(root), namespaces: RwLock::new(namespaces) })
    }

    fn namespace_path(&self, plugin_id: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(format!("{plugin_id}.json")))
    }

    fn save(&self, plugin_id: &str, namespace: Option<&Namespace>) -> PluginResult<()> {
        let Some(path) = self.namespace_path(plugin_id) else {
            return Ok(());
        };
        match namespace {
            Some(namespace) if !namespace.is_empty() => save_json(&path, namespace),
            _ => match std::fs::remove_file(&path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        }
    }

    pub fn get(&self, plugin_id: &str, key: &str) -> Option<Value> {
        self.namespaces.read().get(plugin_id).and_then(|ns| ns.get(key).cloned())
    }

    pub fn set(&self, plugin_id: &str, key: &str, value: Value) -> PluginResult<()> {
        self.apply(plugin_id, BTreeMap::from([(key.to_string(), Some(value))]))
    }

    pub fn delete(&self, plugin_id: &str, key: &str) -> PluginResult<Option<Value>> {
        let previous = self.get(plugin_id, key);
        if previous.is_some() {
            self.apply(plugin_id, BTreeMap::from([(key.to_string(), None)]))?;
        }
        Ok(previous)
    }

    /// Keys stored for a plugin, sorted.
    pub fn keys(&self, plugin_id: &str) -> Vec<String> {
        let mut keys: Vec<_> = self
            .namespaces
            .read()
            .get(plugin_id)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Plugin ids that have a namespace.
    pub fn plugin_ids(&self) -> Vec<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    /// Commit a batch of writes; `None` deletes the key.
    pub fn apply(
        &self,
        plugin_id: &str,
        writes: BTreeMap<String, Option<Value>>,
    ) -> PluginResult<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let mut namespaces = self.namespaces.write();
        let namespace = namespaces.entry(plugin_id.to_string()).or_default();
        for (key, value) in writes {
            match value {
                Some(value) => {
                    namespace.insert(key, value);
                }
                None => {
                    namespace.remove(&key);
                }
            }
        }
        if namespace.is_empty() {
            namespaces.remove(plugin_id);
        }
        self.save(plugin_id, namespaces.get(plugin_id))
    }

    /// Remove a plugin's whole namespace.
    pub fn clear(&self, plugin_id: &str) -> PluginResult<()> {
        let mut namespaces = self.namespaces.write();
        namespaces.remove(plugin_id);
        debug!(plugin = plugin_id, "storage namespace cleared");
        self.save(plugin_id, None)
    }
}

/// A plugin's view of its own storage namespace.
///
/// Every call re-checks the `storage` permission.
#[derive(Clone)]
pub struct StorageHandle {
    plugin_id: Arc<str>,
    sandbox: Arc<StorageSandbox>,
    permissions: Arc<PermissionManager>,
    pending: Arc<Mutex<BTreeMap<String, Option<Value>>>>,
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("plugin_id", &self.plugin_id)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl StorageHandle {
    pub(crate) fn new(
        plugin_id: &str,
        sandbox: Arc<StorageSandbox>,
        permissions: Arc<PermissionManager>,
    ) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
            sandbox,
            permissions,
            pending: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn authorize(&self) -> PluginResult<()> {
        self.permissions.check(&self.plugin_id, Capability::Storage.as_str())
    }

    pub fn get(&self, key: &str) -> PluginResult<Option<Value>> {
        self.authorize()?;
        if let Some(buffered) = self.pending.lock().get(key) {
            return Ok(buffered.clone());
        }
        Ok(self.sandbox.get(&self.plugin_id, key))
    }

    pub fn set(&self, key: &str, value: Value) -> PluginResult<()> {
        self.authorize()?;
        self.pending.lock().insert(key.to_string(), Some(value));
        Ok(())
    }

    pub fn delete(&self, key: &str) -> PluginResult<()> {
        self.authorize()?;
        self.pending.lock().insert(key.to_string(), None);
        Ok(())
    }

    /// Number of buffered writes.
    pub fn pending_writes(&self) -> usize {
        self.pending.lock().len()
    }

    /// Commit buffered writes to the sandbox.
    pub(crate) fn flush(&self) -> PluginResult<usize> {
        let writes = std::mem::take(&mut *self.pending.lock());
        let count = writes.len();
        self.sandbox.apply(&self.plugin_id, writes)?;
        Ok(count)
    }

    /// Drop buffered writes without committing them.
    pub(crate) fn discard(&self) {
        self.pending.lock().clear();
    }
}
