//! Runtime Integration Tests
//!
//! Drives the plugin runtime end-to-end through `PluginManager`: install,
//! permission gating, activation, command registration and uninstall.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use serial_test::serial;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use inkplug::plugin::{
    Capability, CapabilityProvider, CapabilityRequest, EngineRegistry, HostCapabilities, Plugin,
    PluginContext, PluginEntry, PluginError, PluginEventKind, PluginManager, PluginResult,
    PluginState, ScriptEngine,
};
use inkplug::Config;

// ============================================================================
// Fixtures
// ============================================================================

fn manifest(id: &str, extra: Value) -> Value {
    let mut manifest = json!({
        "info": {
            "id": id,
            "version": "1.0.0",
            "name": id,
            "description": "test plugin",
            "author": { "name": "Test Author" },
            "pluginType": "editor_extension",
            "minAppVersion": "1.0.0"
        },
        "permissions": [],
        "capabilities": [],
        "contributes": []
    });
    if let (Some(target), Some(extra)) = (manifest.as_object_mut(), extra.as_object()) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
    manifest
}

/// Write a plugin source folder under `root/src/<id>`.
fn write_plugin(root: &Path, id: &str, manifest: &Value) -> PathBuf {
    let dir = root.join("src").join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("plugin.json"), serde_json::to_string_pretty(manifest).unwrap())
        .unwrap();
    std::fs::write(dir.join("main.lua"), "-- entry").unwrap();
    dir
}

fn wordcount_manifest() -> Value {
    manifest(
        "wordcount-plugin",
        json!({
            "capabilities": ["editor"],
            "contributes": [{ "type": "command", "id": "wordcount.count", "label": "统计字数" }]
        }),
    )
}

fn config(root: &Path) -> Config {
    let mut config = Config::default();
    config.runtime.data_dir = Some(root.join("data"));
    config.runtime.plugins_dir = Some(root.join("plugins"));
    config
}

async fn open(root: &Path) -> PluginManager {
    PluginManager::open(&config(root)).await.unwrap()
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(Result::ok).map(|e| e.file_name().to_string_lossy().into_owned()).collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

// ----------------------------------------------------------------------------
// Test engines and providers
// ----------------------------------------------------------------------------

/// Lua engine that hands out a fixed entry per plugin id.
#[derive(Default)]
struct TestEngine {
    entries: HashMap<String, Arc<dyn PluginEntry>>,
}

impl TestEngine {
    fn with(mut self, plugin_id: &str, entry: impl PluginEntry + 'static) -> Self {
        self.entries.insert(plugin_id.to_string(), Arc::new(entry));
        self
    }
}

impl ScriptEngine for TestEngine {
    fn language(&self) -> &str {
        "lua"
    }

    fn load(&self, plugin: &Plugin) -> PluginResult<Arc<dyn PluginEntry>> {
        self.entries.get(plugin.id()).cloned().ok_or_else(|| PluginError::ActivationFailure {
            plugin: plugin.id().to_string(),
            message: "no test entry".to_string(),
        })
    }
}

struct SleepyEntry;

#[async_trait]
impl PluginEntry for SleepyEntry {
    async fn activate(&self, _ctx: &PluginContext) -> PluginResult<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

struct PanickyEntry;

#[async_trait]
impl PluginEntry for PanickyEntry {
    async fn activate(&self, _ctx: &PluginContext) -> PluginResult<()> {
        panic!("entry point blew up");
    }
}

/// Allocates past the memory ceiling and ignores the error.
struct GreedyEntry;

#[async_trait]
impl PluginEntry for GreedyEntry {
    async fn activate(&self, ctx: &PluginContext) -> PluginResult<()> {
        let _ = ctx.meter().allocate(1 << 20);
        Ok(())
    }
}

/// Inserts text into the editor when its command runs.
struct EditorEntry;

#[async_trait]
impl PluginEntry for EditorEntry {
    async fn activate(&self, ctx: &PluginContext) -> PluginResult<()> {
        ctx.storage().set("activations", json!(1))
    }

    async fn execute(
        &self,
        ctx: &PluginContext,
        _command_id: &str,
        args: Value,
    ) -> PluginResult<Value> {
        ctx.invoke(Capability::Editor, "editor", "insertText", args).await
    }
}

struct EditorProvider;

#[async_trait]
impl CapabilityProvider for EditorProvider {
    fn capability(&self) -> Capability {
        Capability::Editor
    }

    async fn dispatch(&self, request: CapabilityRequest) -> PluginResult<Value> {
        Ok(json!({ "inserted": request.payload, "by": request.plugin_id }))
    }
}

fn scripted(id: &str, extra: Value) -> Value {
    let mut value = manifest(id, extra);
    value["script"] = json!({ "language": "lua", "entryPoint": "main.lua" });
    value
}

async fn open_with(config: &Config, engine: TestEngine) -> PluginManager {
    let engines = EngineRegistry::new();
    engines.register(Arc::new(engine));
    let host = HostCapabilities::new();
    host.register(Arc::new(EditorProvider));
    PluginManager::open_with(config, engines, host).await.unwrap()
}

// ============================================================================
// Install
// ============================================================================

#[tokio::test]
async fn test_install_registers_loaded_plugin() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;
    let source = write_plugin(temp.path(), "wordcount-plugin", &wordcount_manifest());

    manager.install(&source).await.unwrap();

    assert_eq!(manager.list().len(), 1);
    let plugin = manager.get("wordcount-plugin").unwrap();
    assert_eq!(plugin.state, PluginState::Loaded);
    assert!(plugin.path.starts_with(temp.path().join("plugins")));
}

#[tokio::test]
async fn test_duplicate_install_leaves_registry_unchanged() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;
    let source = write_plugin(temp.path(), "wordcount-plugin", &wordcount_manifest());

    let first = manager.install(&source).await.unwrap();
    let second = manager.install(&source).await;

    assert!(matches!(second, Err(PluginError::IdConflict(_))));
    assert_eq!(manager.list(), vec![first]);
    assert_eq!(entries(&temp.path().join("plugins")), vec!["wordcount-plugin"]);
}

#[tokio::test]
async fn test_invalid_manifest_reports_field_path() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;
    let bad = manifest(
        "bad-risk",
        json!({ "permissions": [
            { "name": "editor", "risk": "low" },
            { "name": "ai", "risk": "low" },
            { "name": "network", "risk": "extreme" }
        ] }),
    );
    let source = write_plugin(temp.path(), "bad-risk", &bad);

    let result = manager.install(&source).await;
    assert!(matches!(
        result,
        Err(PluginError::ManifestInvalid { ref path, .. }) if path == "permissions[2].risk"
    ));
    assert!(manager.list().is_empty());
    assert!(entries(&temp.path().join("plugins")).is_empty());
}

#[tokio::test]
async fn test_cancelled_install_leaves_no_residue() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;
    let source = write_plugin(temp.path(), "wordcount-plugin", &wordcount_manifest());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = manager.install_with_cancel(&source, &cancel).await;

    assert!(matches!(result, Err(PluginError::Cancelled(_))));
    assert!(manager.list().is_empty());
    assert!(entries(&temp.path().join("plugins")).is_empty());
    assert!(matches!(manager.list_permissions("wordcount-plugin"), Err(PluginError::NotFound(_))));
}

// ============================================================================
// Activation and permissions
// ============================================================================

#[tokio::test]
async fn test_activation_registers_contributed_commands() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;
    let source = write_plugin(temp.path(), "wordcount-plugin", &wordcount_manifest());
    manager.install(&source).await.unwrap();

    manager.activate("wordcount-plugin").await.unwrap();

    let commands: Vec<_> = manager
        .list_commands(Some("wordcount-plugin"))
        .unwrap()
        .into_iter()
        .map(|c| c.command_id)
        .collect();
    assert_eq!(commands, vec!["wordcount.count"]);
    assert!(manager.get("wordcount-plugin").unwrap().state.is_active());

    manager.deactivate("wordcount-plugin").await.unwrap();
    assert!(manager.list_commands(Some("wordcount-plugin")).unwrap().is_empty());
    assert_eq!(manager.get("wordcount-plugin").unwrap().state, PluginState::Deactivated);
}

#[tokio::test]
async fn test_ungranted_permission_blocks_activation_until_granted() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;
    let exporter = manifest(
        "exporter",
        json!({
            "permissions": [{ "name": "filesystem:write", "description": "Write exports", "risk": "high" }],
            "capabilities": ["filesystem"]
        }),
    );
    manager.install(&write_plugin(temp.path(), "exporter", &exporter)).await.unwrap();

    let pending = manager.pending_permissions("exporter").unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].requires_confirmation);

    let result = manager.activate("exporter").await;
    assert!(matches!(
        result,
        Err(PluginError::PermissionDenied { ref permission, .. }) if permission == "filesystem:write"
    ));
    assert_eq!(manager.get("exporter").unwrap().state, PluginState::Loaded);

    assert!(manager.grant_permission("exporter", "filesystem:write").unwrap());
    manager.activate("exporter").await.unwrap();
    assert!(manager.get("exporter").unwrap().state.is_active());
}

#[tokio::test]
async fn test_grant_of_undeclared_permission_is_rejected() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;
    manager
        .install(&write_plugin(temp.path(), "wordcount-plugin", &wordcount_manifest()))
        .await
        .unwrap();

    let result = manager.grant_permission("wordcount-plugin", "network");
    assert!(matches!(result, Err(PluginError::UnknownPermission { .. })));
}

#[tokio::test]
async fn test_revoke_applies_to_the_next_capability_call() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let manager =
        open_with(&config, TestEngine::default().with("scene-notes", EditorEntry))
            .await;
    let notes = scripted(
        "scene-notes",
        json!({
            "permissions": [
                { "name": "editor", "risk": "medium" },
                { "name": "storage", "risk": "low" }
            ],
            "capabilities": ["editor", "storage"],
            "contributes": [{ "type": "command", "id": "scene-notes.insert", "label": "Insert note" }]
        }),
    );
    manager.install(&write_plugin(temp.path(), "scene-notes", &notes)).await.unwrap();
    manager.grant_permission("scene-notes", "editor").unwrap();
    manager.grant_permission("scene-notes", "storage").unwrap();
    manager.activate("scene-notes").await.unwrap();

    let value = manager.execute_command("scene-notes.insert", json!("Chapter 1")).await.unwrap();
    assert_eq!(value["by"], "scene-notes");

    manager.revoke_permission("scene-notes", "editor").unwrap();
    assert!(manager.get("scene-notes").unwrap().state.is_active());

    let result = manager.execute_command("scene-notes.insert", json!("Chapter 2")).await;
    assert!(matches!(result, Err(PluginError::PermissionDenied { .. })));

    let ctx = manager.context("scene-notes").unwrap();
    let direct = ctx.invoke(Capability::Editor, "editor", "insertText", json!("x")).await;
    assert!(matches!(direct, Err(PluginError::PermissionDenied { .. })));
}

// ============================================================================
// Sandbox faults
// ============================================================================

#[tokio::test]
async fn test_activation_timeout_moves_plugin_to_error() {
    let temp = TempDir::new().unwrap();
    let mut config = config(temp.path());
    config.limits.execution_timeout_secs = 1;
    let manager =
        open_with(&config, TestEngine::default().with("slow", SleepyEntry)).await;
    let slow = scripted(
        "slow",
        json!({ "contributes": [{ "type": "command", "id": "slow.run", "label": "Run" }] }),
    );
    manager.install(&write_plugin(temp.path(), "slow", &slow)).await.unwrap();

    let result = manager.activate("slow").await;

    assert!(matches!(result, Err(PluginError::ActivationFailure { .. })));
    let plugin = manager.get("slow").unwrap();
    assert!(plugin.error().is_some());
    assert!(manager.list_commands(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_panicking_entry_is_contained() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let manager =
        open_with(&config, TestEngine::default().with("panicky", PanickyEntry)).await;
    let panicky = scripted(
        "panicky",
        json!({ "contributes": [{ "type": "command", "id": "panicky.run", "label": "Run" }] }),
    );
    manager.install(&write_plugin(temp.path(), "panicky", &panicky)).await.unwrap();
    let mut events = manager.subscribe();

    let result = manager.activate("panicky").await;

    match result {
        Err(PluginError::ActivationFailure { message, .. }) => {
            assert!(message.contains("entry point blew up"));
        }
        other => panic!("expected activation failure, got {other:?}"),
    }
    assert!(manager.list_commands(None).unwrap().is_empty());
    let event = events.recv().await.unwrap();
    assert!(matches!(event.kind, PluginEventKind::Failed { .. }));

    manager.recover("panicky").await.unwrap();
    assert_eq!(manager.get("panicky").unwrap().state, PluginState::Loaded);
}

#[tokio::test]
async fn test_memory_ceiling_aborts_activation() {
    let temp = TempDir::new().unwrap();
    let mut config = config(temp.path());
    config.limits.max_memory_bytes = 4096;
    let manager =
        open_with(&config, TestEngine::default().with("greedy", GreedyEntry)).await;
    manager
        .install(&write_plugin(temp.path(), "greedy", &scripted("greedy", json!({}))))
        .await
        .unwrap();

    let result = manager.activate("greedy").await;

    assert!(matches!(
        result,
        Err(PluginError::ResourceLimitExceeded { ref resource, limit: 4096, .. }) if resource == "memory"
    ));
    assert!(manager.get("greedy").unwrap().error().is_some());
}

#[tokio::test]
async fn test_command_conflict_fails_second_plugin_atomically() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;
    manager
        .install(&write_plugin(temp.path(), "wordcount-plugin", &wordcount_manifest()))
        .await
        .unwrap();
    let copycat = manifest(
        "copycat",
        json!({ "contributes": [
            { "type": "command", "id": "copycat.own", "label": "Own" },
            { "type": "command", "id": "wordcount.count", "label": "Count" }
        ] }),
    );
    manager.install(&write_plugin(temp.path(), "copycat", &copycat)).await.unwrap();

    manager.activate("wordcount-plugin").await.unwrap();
    let result = manager.activate("copycat").await;

    assert!(matches!(result, Err(PluginError::CommandIdConflict { ref owner, .. }) if owner == "wordcount-plugin"));
    assert!(manager.list_commands(Some("copycat")).unwrap().is_empty());
    assert!(matches!(manager.lookup_command("copycat.own"), Err(PluginError::NotFound(_))));
}

// ============================================================================
// Uninstall
// ============================================================================

#[tokio::test]
async fn test_uninstall_active_plugin_purges_everything() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let manager =
        open_with(&config, TestEngine::default().with("scene-notes", EditorEntry))
            .await;
    let notes = scripted(
        "scene-notes",
        json!({
            "permissions": [{ "name": "editor", "risk": "low" }, { "name": "storage", "risk": "low" }],
            "capabilities": ["editor", "storage"],
            "contributes": [{ "type": "command", "id": "scene-notes.insert", "label": "Insert" }]
        }),
    );
    manager.install(&write_plugin(temp.path(), "scene-notes", &notes)).await.unwrap();
    manager.grant_permission("scene-notes", "editor").unwrap();
    manager.grant_permission("scene-notes", "storage").unwrap();
    manager.activate("scene-notes").await.unwrap();
    manager.deactivate("scene-notes").await.unwrap();
    assert_eq!(manager.storage_keys("scene-notes").unwrap(), vec!["activations"]);
    manager.activate("scene-notes").await.unwrap();

    let report = manager.uninstall("scene-notes").await.unwrap();

    assert!(report.warnings.is_empty());
    assert!(matches!(manager.get("scene-notes"), Err(PluginError::NotFound(_))));
    assert!(manager.list_commands(None).unwrap().is_empty());
    assert!(matches!(manager.list_permissions("scene-notes"), Err(PluginError::NotFound(_))));
    assert!(matches!(manager.storage_keys("scene-notes"), Err(PluginError::NotFound(_))));
    assert!(!temp.path().join("data/storage/scene-notes.json").exists());
    assert!(entries(&temp.path().join("plugins")).is_empty());
}

#[tokio::test]
async fn test_scenario_walkthrough() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;

    manager
        .install(&write_plugin(temp.path(), "wordcount-plugin", &wordcount_manifest()))
        .await
        .unwrap();
    assert_eq!(manager.list().len(), 1);

    manager.activate("wordcount-plugin").await.unwrap();
    assert_eq!(manager.list_commands(Some("wordcount-plugin")).unwrap().len(), 1);

    let exporter = manifest(
        "exporter",
        json!({ "permissions": [{ "name": "filesystem:write", "risk": "high" }] }),
    );
    manager.install(&write_plugin(temp.path(), "exporter", &exporter)).await.unwrap();
    assert!(matches!(
        manager.activate("exporter").await,
        Err(PluginError::PermissionDenied { .. })
    ));
    assert_eq!(manager.get("exporter").unwrap().state, PluginState::Loaded);

    manager.grant_permission("exporter", "filesystem:write").unwrap();
    manager.activate("exporter").await.unwrap();

    manager.uninstall("wordcount-plugin").await.unwrap();
    assert!(matches!(manager.get("wordcount-plugin"), Err(PluginError::NotFound(_))));
    assert!(manager.get("exporter").unwrap().state.is_active());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_activate_and_uninstall_stay_consistent() {
    let temp = TempDir::new().unwrap();
    let manager = Arc::new(open(temp.path()).await);
    let source = write_plugin(temp.path(), "wordcount-plugin", &wordcount_manifest());

    for _ in 0..20 {
        manager.install(&source).await.unwrap();

        let activating = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.activate("wordcount-plugin").await })
        };
        let uninstalling = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.uninstall("wordcount-plugin").await })
        };

        let activated = activating.await.unwrap();
        uninstalling.await.unwrap().unwrap();

        match activated {
            Ok(commands) => assert_eq!(commands, vec!["wordcount.count"]),
            Err(e) => assert!(matches!(e, PluginError::NotFound(_)), "unexpected error: {e}"),
        }
        assert!(matches!(manager.get("wordcount-plugin"), Err(PluginError::NotFound(_))));
        assert!(manager.list_commands(None).unwrap().is_empty());
        assert!(manager.context("wordcount-plugin").is_none());
    }
}

// ============================================================================
// Persistence, search and events
// ============================================================================

#[test]
fn test_grants_persist_across_reopen() {
    tokio_test::block_on(async {
        let temp = TempDir::new().unwrap();
        let exporter = manifest(
            "exporter",
            json!({ "permissions": [{ "name": "filesystem:write", "risk": "high" }] }),
        );
        let source = write_plugin(temp.path(), "exporter", &exporter);

        {
            let manager = open(temp.path()).await;
            manager.install(&source).await.unwrap();
            manager.grant_permission("exporter", "filesystem:write").unwrap();
        }

        let manager = open(temp.path()).await;
        let permissions = manager.list_permissions("exporter").unwrap();
        assert!(permissions[0].granted);
        manager.activate("exporter").await.unwrap();
    });
}

#[tokio::test]
async fn test_storage_writes_survive_host_exit() {
    let temp = TempDir::new().unwrap();
    let config = config(temp.path());
    let notes = scripted(
        "scene-notes",
        json!({
            "permissions": [{ "name": "editor", "risk": "low" }, { "name": "storage", "risk": "low" }],
            "capabilities": ["editor", "storage"]
        }),
    );

    {
        let manager =
            open_with(&config, TestEngine::default().with("scene-notes", EditorEntry)).await;
        manager.install(&write_plugin(temp.path(), "scene-notes", &notes)).await.unwrap();
        manager.grant_permission("scene-notes", "editor").unwrap();
        manager.grant_permission("scene-notes", "storage").unwrap();
        manager.activate("scene-notes").await.unwrap();
        assert_eq!(manager.storage_keys("scene-notes").unwrap(), vec!["activations"]);

        let ctx = manager.context("scene-notes").unwrap();
        ctx.storage().set("draft", json!("chapter 3")).unwrap();
        assert_eq!(manager.shutdown(), 1);
    }

    let manager =
        open_with(&config, TestEngine::default().with("scene-notes", EditorEntry)).await;
    assert_eq!(manager.get("scene-notes").unwrap().state.name(), "activated");
    assert_eq!(manager.storage_keys("scene-notes").unwrap(), vec!["activations", "draft"]);
}

#[tokio::test]
async fn test_search_ranks_exact_id_first() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;
    let mut counter = manifest("counter", json!({ "keywords": ["wordcount-plugin"] }));
    counter["info"]["name"] = json!("Counter");
    manager.install(&write_plugin(temp.path(), "counter", &counter)).await.unwrap();
    manager
        .install(&write_plugin(temp.path(), "wordcount-plugin", &wordcount_manifest()))
        .await
        .unwrap();

    let ids: Vec<_> = manager
        .search("wordcount-plugin")
        .iter()
        .map(|p| p.id().to_string())
        .collect();
    assert_eq!(ids, vec!["wordcount-plugin", "counter"]);

    manager.uninstall("wordcount-plugin").await.unwrap();
    let ids: Vec<_> = manager.search("wordcount").iter().map(|p| p.id().to_string()).collect();
    assert!(!ids.contains(&"wordcount-plugin".to_string()));
}

#[tokio::test]
async fn test_lifecycle_events_are_published() {
    let temp = TempDir::new().unwrap();
    let manager = open(temp.path()).await;
    let mut events = manager.subscribe();

    manager
        .install(&write_plugin(temp.path(), "wordcount-plugin", &wordcount_manifest()))
        .await
        .unwrap();
    manager.activate("wordcount-plugin").await.unwrap();
    manager.uninstall("wordcount-plugin").await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.plugin_id, "wordcount-plugin");
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![
            PluginEventKind::Installed,
            PluginEventKind::Activated { commands: vec!["wordcount.count".to_string()] },
            PluginEventKind::Deactivated,
            PluginEventKind::Uninstalled,
        ]
    );
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
#[serial]
fn test_local_config_file_is_preferred() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join(".inkplug.toml"),
        "[limits]\nexecution_timeout_secs = 7\n\n[search]\nmax_results = 5\n",
    )
    .unwrap();

    let previous = std::env::current_dir().unwrap();
    std::env::set_current_dir(temp.path()).unwrap();
    let loaded = Config::load();
    std::env::set_current_dir(previous).unwrap();

    let config = loaded.unwrap();
    assert_eq!(config.limits.execution_timeout_secs, 7);
    assert_eq!(config.search.max_results, 5);
    assert!(config.search.fuzzy);
}
