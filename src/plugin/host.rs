//! Host capabilities exposed to plugins.
//!
//! A plugin reaches the host only through its [`PluginContext`]. Every
//! capability call names the permission it needs; the context checks the
//! declared capability and asks the [`PermissionManager`] synchronously on
//! each call before the registered [`CapabilityProvider`] sees the request.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use super::{
    Capability, PermissionManager, PluginError, PluginResult, ResourceMeter, StorageHandle,
};

/// A request forwarded to a capability provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityRequest {
    /// Calling plugin, filled in by the runtime.
    pub plugin_id: String,
    /// Permission the call was authorized under.
    pub permission: String,
    /// Provider-specific operation name, e.g. `insertText`.
    pub operation: String,
    pub payload: Value,
}

/// Host subsystem reachable by plugins (editor, project, ai, ...).
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Capability served by this provider.
    fn capability(&self) -> Capability;

    /// Handle an already authorized request.
    async fn dispatch(&self, request: CapabilityRequest) -> PluginResult<Value>;
}

/// Table of capability providers registered by the host application.
#[derive(Default)]
pub struct HostCapabilities {
    providers: RwLock<HashMap<Capability, Arc<dyn CapabilityProvider>>>,
}

impl std::fmt::Debug for HostCapabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut capabilities: Vec<_> = self.providers.read().keys().copied().collect();
        capabilities.sort();
        f.debug_struct("HostCapabilities").field("providers", &capabilities).finish()
    }
}

impl HostCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the provider for its capability.
    pub fn register(&self, provider: Arc<dyn CapabilityProvider>) {
        self.providers.write().insert(provider.capability(), provider);
    }

    pub fn provider(&self, capability: Capability) -> Option<Arc<dyn CapabilityProvider>> {
        self.providers.read().get(&capability).cloned()
    }
}

/// Execution context handed to a plugin at activation.
///
/// Carries the plugin's identity explicitly; nothing in the runtime relies on
/// an ambient "current plugin".
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: Arc<str>,
    capabilities: Arc<BTreeSet<Capability>>,
    permissions: Arc<PermissionManager>,
    storage: StorageHandle,
    meter: Arc<ResourceMeter>,
    host: Arc<HostCapabilities>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl PluginContext {
    pub(crate) fn new(
        plugin_id: &str,
        capabilities: BTreeSet<Capability>,
        permissions: Arc<PermissionManager>,
        storage: StorageHandle,
        meter: Arc<ResourceMeter>,
        host: Arc<HostCapabilities>,
    ) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
            capabilities: Arc::new(capabilities),
            permissions,
            storage,
            meter,
            host,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Capabilities declared in the manifest.
    pub fn capabilities(&self) -> &BTreeSet<Capability> {
        &self.capabilities
    }

    /// The plugin's own storage namespace.
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn meter(&self) -> &ResourceMeter {
        &self.meter
    }

    /// Check that `permission` may be used to reach `capability` right now.
    ///
    /// The capability must be declared, the permission must belong to it, and
    /// the permission must be declared and currently granted.
    pub fn authorize(&self, capability: Capability, permission: &str) -> PluginResult<()> {
        let denied = |permission: &str| PluginError::PermissionDenied {
            plugin: self.plugin_id.to_string(),
            permission: permission.to_string(),
        };

        if !self.capabilities.contains(&capability) {
            return Err(denied(capability.as_str()));
        }
        if !capability.covers(permission) {
            debug!(plugin = %self.plugin_id, %capability, permission, "permission outside capability");
            return Err(denied(permission));
        }
        self.permissions.check(&self.plugin_id, permission)
    }

    /// Invoke a host capability on behalf of this plugin.
    pub async fn invoke(
        &self,
        capability: Capability,
        permission: &str,
        operation: &str,
        payload: Value,
    ) -> PluginResult<Value> {
        self.authorize(capability, permission)?;

        let provider = self.host.provider(capability).ok_or_else(|| PluginError::Execution {
            plugin: self.plugin_id.to_string(),
            message: format!("no provider registered for capability '{capability}'"),
        })?;

        let request = CapabilityRequest {
            plugin_id: self.plugin_id.to_string(),
            permission: permission.to_string(),
            operation: operation.to_string(),
            payload,
        };

        match capability {
            Capability::Network => {
                self.meter.open_connection()?;
                let result = provider.dispatch(request).await;
                self.meter.close_connection();
                result
            }
            Capability::Filesystem => {
                self.meter.open_file()?;
                let result = provider.dispatch(request).await;
                self.meter.close_file();
                result
            }
            _ => provider.dispatch(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PermissionRisk, PermissionSpec, ResourceLimits, StorageSandbox};
    use serde_json::json;

    struct EchoProvider(Capability);

    #[async_trait]
    impl CapabilityProvider for EchoProvider {
        fn capability(&self) -> Capability {
            self.0
        }

        async fn dispatch(&self, request: CapabilityRequest) -> PluginResult<Value> {
            Ok(json!({ "op": request.operation, "from": request.plugin_id }))
        }
    }

    fn context(declared: &[(&str, bool)], capabilities: &[Capability]) -> PluginContext {
        let permissions = Arc::new(PermissionManager::in_memory());
        let specs: Vec<_> = declared
            .iter()
            .map(|(name, _)| PermissionSpec {
                name: (*name).to_string(),
                description: String::new(),
                risk: PermissionRisk::Medium,
            })
            .collect();
        permissions.seed("p", &specs).unwrap();
        for (name, granted) in declared {
            if *granted {
                permissions.grant("p", name).unwrap();
            }
        }

        let host = Arc::new(HostCapabilities::new());
        host.register(Arc::new(EchoProvider(Capability::Editor)));
        host.register(Arc::new(EchoProvider(Capability::Filesystem)));

        let storage =
            StorageHandle::new("p", Arc::new(StorageSandbox::in_memory()), Arc::clone(&permissions));
        PluginContext::new(
            "p",
            capabilities.iter().copied().collect(),
            permissions,
            storage,
            Arc::new(ResourceMeter::new("p", ResourceLimits::default())),
            host,
        )
    }

    #[tokio::test]
    async fn test_invoke_with_grant() {
        let ctx = context(&[("editor", true)], &[Capability::Editor]);
        let value = ctx.invoke(Capability::Editor, "editor", "insertText", json!({})).await.unwrap();
        assert_eq!(value["from"], "p");
    }

    #[tokio::test]
    async fn test_undeclared_capability_is_denied() {
        let ctx = context(&[("editor", true)], &[]);
        let result = ctx.invoke(Capability::Editor, "editor", "insertText", json!({})).await;
        assert!(matches!(
            result,
            Err(PluginError::PermissionDenied { ref permission, .. }) if permission == "editor"
        ));
    }

    #[tokio::test]
    async fn test_permission_must_match_capability() {
        let ctx = context(&[("editor", true)], &[Capability::Editor, Capability::Filesystem]);
        assert!(ctx.authorize(Capability::Filesystem, "editor").is_err());
    }

    #[tokio::test]
    async fn test_ungranted_permission_is_denied() {
        let ctx = context(&[("filesystem:write", false)], &[Capability::Filesystem]);
        let result = ctx.invoke(Capability::Filesystem, "filesystem:write", "write", json!({})).await;
        assert!(matches!(result, Err(PluginError::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn test_filesystem_call_is_metered() {
        let ctx = context(&[("filesystem:write", true)], &[Capability::Filesystem]);
        ctx.invoke(Capability::Filesystem, "filesystem:write", "write", json!({})).await.unwrap();
        assert_eq!(ctx.meter().usage().file_descriptors, 0);
    }

    #[tokio::test]
    async fn test_missing_provider() {
        let ctx = context(&[("ai", true)], &[Capability::Ai]);
        let result = ctx.invoke(Capability::Ai, "ai", "generate", json!({})).await;
        assert!(matches!(result, Err(PluginError::Execution { .. })));
    }
}
