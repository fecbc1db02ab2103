//! Script engines and plugin entry points.
//!
//! The runtime does not interpret plugin code itself. A [`ScriptEngine`]
//! registered for a language turns an installed plugin into a
//! [`PluginEntry`], whose hooks the lifecycle manager runs inside the
//! bounded sandbox. The built-in engines only check that the entry point
//! exists and hand back an entry with no-op hooks.

use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{Plugin, PluginContext, PluginError, PluginResult, SCRIPT_LANGUAGES};

/// Hooks a loaded plugin exposes to the runtime.
#[async_trait]
pub trait PluginEntry: Send + Sync {
    /// Called once per activation, before commands are registered.
    async fn activate(&self, ctx: &PluginContext) -> PluginResult<()>;

    /// Teardown hook. Failures are logged, never fatal.
    async fn deactivate(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }

    /// Run one of the plugin's commands.
    async fn execute(
        &self,
        _ctx: &PluginContext,
        _command_id: &str,
        _args: Value,
    ) -> PluginResult<Value> {
        Ok(Value::Null)
    }
}

/// Turns an installed plugin's script into an entry.
pub trait ScriptEngine: Send + Sync {
    /// Language this engine runs, as written in `script.language`.
    fn language(&self) -> &str;

    fn load(&self, plugin: &Plugin) -> PluginResult<Arc<dyn PluginEntry>>;
}

/// Entry with no behaviour, used for script-less plugins.
#[derive(Debug, Default, Clone, Copy)]
pub struct InertEntry;

#[async_trait]
impl PluginEntry for InertEntry {
    async fn activate(&self, _ctx: &PluginContext) -> PluginResult<()> {
        Ok(())
    }
}

/// Engine slot for a language without an embedded interpreter.
#[derive(Debug, Clone)]
pub struct PlaceholderEngine {
    language: String,
}

impl PlaceholderEngine {
    pub fn new(language: impl Into<String>) -> Self {
        Self { language: language.into() }
    }
}

impl ScriptEngine for PlaceholderEngine {
    fn language(&self) -> &str {
        &self.language
    }

    fn load(&self, plugin: &Plugin) -> PluginResult<Arc<dyn PluginEntry>> {
        let Some(script) = &plugin.manifest.script else {
            return Ok(Arc::new(InertEntry));
        };

        let relative = Path::new(&script.entry_point);
        let contained = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !contained || !plugin.path.join(relative).is_file() {
            return Err(PluginError::ActivationFailure {
                plugin: plugin.id().to_string(),
                message: format!("entry point '{}' not found", script.entry_point),
            });
        }
        Ok(Arc::new(InertEntry))
    }
}

/// Engines keyed by language.
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, Arc<dyn ScriptEngine>>>,
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut languages: Vec<_> = self.engines.read().keys().cloned().collect();
        languages.sort();
        f.debug_struct("EngineRegistry").field("languages", &languages).finish()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        let registry = Self { engines: RwLock::new(HashMap::new()) };
        for language in SCRIPT_LANGUAGES {
            registry.register(Arc::new(PlaceholderEngine::new(language)));
        }
        registry
    }
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the engine for its language.
    pub fn register(&self, engine: Arc<dyn ScriptEngine>) {
        self.engines.write().insert(engine.language().to_string(), engine);
    }

    /// Load the entry for a plugin.
    pub fn resolve(&self, plugin: &Plugin) -> PluginResult<Arc<dyn PluginEntry>> {
        let Some(script) = &plugin.manifest.script else {
            return Ok(Arc::new(InertEntry));
        };

        let engine = self.engines.read().get(&script.language).cloned().ok_or_else(|| {
            PluginError::ActivationFailure {
                plugin: plugin.id().to_string(),
                message: format!("no engine for language '{}'", script.language),
            }
        })?;
        engine.load(plugin)
    }
}
