//! Per-plugin lifecycle locks.
//!
//! Every state-changing lifecycle operation for a plugin id runs while
//! holding that id's lock. Reads (`list`, `search`) never take it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Proof that the caller holds the lifecycle lock for one plugin id.
#[derive(Debug)]
pub struct LifecycleGuard {
    plugin_id: String,
    _permit: OwnedMutexGuard<()>,
}

impl LifecycleGuard {
    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Abort if the guard was taken for a different plugin.
    pub(crate) fn assert_holds(&self, plugin_id: &str) {
        assert_eq!(
            self.plugin_id, plugin_id,
            "lifecycle guard for '{}' used to mutate '{}'",
            self.plugin_id, plugin_id
        );
    }
}

/// Lock table keyed by plugin id.
#[derive(Debug, Default)]
pub struct PluginLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PluginLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `plugin_id`.
    ///
    /// Entries left by finished operations, including ones on ids that
    /// turned out not to exist, are dropped on the way in.
    pub async fn acquire(&self, plugin_id: &str) -> LifecycleGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(plugin_id.to_string()).or_default())
        };
        let permit = lock.lock_owned().await;
        LifecycleGuard { plugin_id: plugin_id.to_string(), _permit: permit }
    }

    /// Drop lock entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }
}
