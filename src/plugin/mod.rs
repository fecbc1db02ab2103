//! Plugin runtime for inkplug.
//!
//! Loads third-party plugins described by a `plugin.json` manifest, gates
//! their access to host capabilities behind declared, risk-classified
//! permissions, and drives their lifecycle safely under concurrent calls.
//!
//! # Architecture
//!
//! - [`PluginInstaller`] validates a manifest, stages the plugin's files and
//!   registers it in the [`PluginRegistry`] in state `Loaded`.
//! - [`LifecycleManager`] is the only writer of plugin state. It consults the
//!   [`PermissionManager`] before activation, runs entry hooks in a bounded
//!   sandbox and fills the [`CommandRegistry`].
//! - [`PluginContext`] is what a running plugin sees: capability calls are
//!   checked against the live grant table on every call.
//! - [`PluginManager`] ties it all together over one data directory.
//!
//! # Manifest
//!
//! ```json
//! {
//!   "info": {
//!     "id": "word-count", "version": "1.0.0", "name": "Word Count",
//!     "description": "Live word count", "author": { "name": "Ada" },
//!     "pluginType": "utility", "minAppVersion": "1.0.0"
//!   },
//!   "permissions": [{ "name": "editor", "risk": "low" }],
//!   "capabilities": ["editor"],
//!   "contributes": [{ "type": "command", "id": "word-count.show", "label": "Show" }]
//! }
//! ```

mod commands;
mod error;
mod events;
mod host;
mod installer;
mod lifecycle;
mod locks;
mod manager;
mod manifest;
mod permissions;
mod persist;
mod registry;
mod runtime;
mod sandbox;
mod search;
mod state;
mod storage;
mod types;

pub use commands::{CommandRegistry, PluginCommand};
pub use error::{PluginError, PluginResult, PluginWarning};
pub use events::{EventBus, PluginEvent, PluginEventKind};
pub use host::{CapabilityProvider, CapabilityRequest, HostCapabilities, PluginContext};
pub use installer::{DiscoveredPlugin, PluginInstaller, UninstallReport};
pub use lifecycle::{LifecycleManager, RuntimeParts};
pub use locks::{LifecycleGuard, PluginLocks};
pub use manager::PluginManager;
pub use manifest::{
    manifest_digest, parse_version, Contribution, PermissionSpec, PluginAuthor, PluginInfo,
    PluginManifest, PluginScript, MAX_ID_LEN,
};
pub use permissions::{PermissionManager, PermissionRequest, PermissionStatus};
pub use registry::{Plugin, PluginRegistry};
pub use runtime::{EngineRegistry, InertEntry, PlaceholderEngine, PluginEntry, ScriptEngine};
pub use sandbox::{Phase, ResourceLimits, ResourceMeter, ResourceUsageStats};
pub use search::{MatchKind, SearchHit, SearchIndex, SearchOptions};
pub use state::{PluginState, Transition};
pub use storage::{StorageHandle, StorageSandbox};
pub use types::{
    Capability, PermissionRisk, PluginType, COMMAND_CONTRIBUTION, DEFAULT_APP_VERSION,
    MANIFEST_FILE, SCRIPT_LANGUAGES,
};
