//! Plugin installation and removal.
//!
//! Installing copies the source directory into a staging directory inside
//! the managed plugins directory, re-validates the staged manifest, then
//! renames it into place and registers it. Any failure before registration
//! leaves nothing behind: the staging directory is a [`tempfile::TempDir`]
//! and is removed when dropped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::manifest::manifest_digest;
use super::{
    LifecycleManager, Plugin, PluginError, PluginEventKind, PluginManifest, PluginResult,
    PluginWarning, MANIFEST_FILE,
};

const STAGING_PREFIX: &str = ".staging-";

/// Result of an uninstall.
#[derive(Debug, Clone)]
pub struct UninstallReport {
    /// The removed plugin record.
    pub plugin: Plugin,
    /// Non-fatal problems, e.g. a directory that could not be deleted.
    pub warnings: Vec<PluginWarning>,
}

/// A plugin directory found under the managed plugins directory.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPlugin {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Whether the registry knows this plugin.
    pub installed: bool,
    /// Why the manifest could not be read, if it could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Installs plugins into a managed directory.
#[derive(Debug)]
pub struct PluginInstaller {
    plugins_dir: PathBuf,
    app_version: String,
    lifecycle: Arc<LifecycleManager>,
}

impl PluginInstaller {
    pub fn new(
        plugins_dir: impl Into<PathBuf>,
        app_version: impl Into<String>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self { plugins_dir: plugins_dir.into(), app_version: app_version.into(), lifecycle }
    }

    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Install from a plugin directory or the path of its `plugin.json`.
    pub async fn install(&self, source: &Path, cancel: &CancellationToken) -> PluginResult<Plugin> {
        let (source_dir, manifest_path) = locate(source);
        let bytes = match tokio::fs::read(&manifest_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PluginError::manifest(
                    "$",
                    format!("{MANIFEST_FILE} not found at {}", manifest_path.display()),
                ));
            }
            Err(e) => return Err(e.into()),
        };
        let manifest = PluginManifest::from_slice(&bytes)?;
        self.check_compatible(&manifest)?;

        let id = manifest.id().to_string();
        let parts = self.lifecycle.parts();
        let guard = self.lifecycle.lock(&id).await;
        if parts.registry.contains(&id) {
            return Err(PluginError::IdConflict(id));
        }
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled(id));
        }

        tokio::fs::create_dir_all(&self.plugins_dir).await?;
        let staging = tempfile::Builder::new().prefix(STAGING_PREFIX).tempdir_in(&self.plugins_dir)?;
        debug!(plugin = %id, staging = %staging.path().display(), "staging plugin files");

        let copy = {
            let from = source_dir.clone();
            let to = staging.path().to_path_buf();
            let skip = self.plugins_dir.clone();
            let cancel = cancel.clone();
            let id = id.clone();
            tokio::task::spawn_blocking(move || copy_tree(&from, &to, &skip, &cancel, &id))
        };
        copy.await.map_err(|e| PluginError::Io(std::io::Error::other(e.to_string())))??;

        let staged_bytes = tokio::fs::read(staging.path().join(MANIFEST_FILE)).await?;
        let staged = PluginManifest::from_slice(&staged_bytes)?;
        if staged.id() != id {
            return Err(PluginError::manifest("info.id", "manifest changed while installing"));
        }
        let digest = manifest_digest(&staged_bytes);

        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled(id));
        }

        let target = self.plugins_dir.join(&id);
        if let Some(owner) = parts.registry.owner_of(&target) {
            return Err(PluginError::PathConflict { path: target, owner });
        }
        if tokio::fs::try_exists(&target).await? {
            warn!(plugin = %id, path = %target.display(), "removing leftover plugin directory");
            tokio::fs::remove_dir_all(&target).await?;
        }
        tokio::fs::rename(staging.path(), &target).await?;
        drop(staging);

        let plugin = match parts.registry.register(staged, target.clone(), digest) {
            Ok(plugin) => plugin,
            Err(e) => {
                remove_quietly(&target).await;
                return Err(e);
            }
        };
        if let Err(e) = parts.permissions.seed(&id, &plugin.manifest.permissions) {
            if let Err(rollback) = parts.registry.remove(&guard, &id) {
                warn!(plugin = %id, error = %rollback, "registry rollback failed");
            }
            remove_quietly(&target).await;
            return Err(e);
        }
        drop(guard);

        info!(plugin = %id, version = %plugin.manifest.info.version, "plugin installed");
        parts.events.publish(&id, PluginEventKind::Installed);
        Ok(plugin)
    }

    fn check_compatible(&self, manifest: &PluginManifest) -> PluginResult<()> {
        if manifest.is_compatible_with(&self.app_version) {
            return Ok(());
        }
        Err(PluginError::manifest(
            "info.minAppVersion",
            format!(
                "requires app version {} or newer, running {}",
                manifest.info.min_app_version, self.app_version
            ),
        ))
    }

    /// Uninstall a plugin and delete its managed directory.
    ///
    /// A directory that cannot be deleted is reported as a warning; the
    /// plugin is still gone from every runtime table.
    pub async fn uninstall(&self, plugin_id: &str) -> PluginResult<UninstallReport> {
        let guard = self.lifecycle.lock(plugin_id).await;
        let plugin = self.lifecycle.purge_locked(&guard, plugin_id).await?;
        drop(guard);
        self.lifecycle.prune_locks();

        let mut warnings = Vec::new();
        if plugin.path.starts_with(&self.plugins_dir) {
            match tokio::fs::remove_dir_all(&plugin.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(plugin = plugin_id, path = %plugin.path.display(), error = %e, "plugin directory orphaned");
                    warnings.push(PluginWarning::Orphaned {
                        path: plugin.path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(plugin = plugin_id, "plugin uninstalled");
        Ok(UninstallReport { plugin, warnings })
    }

    /// Scan the plugins directory and register valid plugin folders the
    /// registry does not know about yet.
    pub async fn discover(&self) -> PluginResult<Vec<DiscoveredPlugin>> {
        let entries = match fs::read_dir(&self.plugins_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if hidden || !path.join(MANIFEST_FILE).is_file() {
                continue;
            }
            found.push(self.adopt(path).await);
        }
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }

    /// Register a plugin directory that already sits in the managed directory.
    ///
    /// The folder must be named after the plugin id, the same place
    /// [`install`](Self::install) would have put it.
    async fn adopt(&self, path: PathBuf) -> DiscoveredPlugin {
        let broken = |path: PathBuf, error: &PluginError| DiscoveredPlugin {
            path,
            id: None,
            name: None,
            version: None,
            installed: false,
            error: Some(error.to_string()),
        };

        let bytes = match tokio::fs::read(path.join(MANIFEST_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) => return broken(path, &e.into()),
        };
        let manifest = match PluginManifest::from_slice(&bytes)
            .and_then(|m| self.check_compatible(&m).map(|()| m))
        {
            Ok(manifest) => manifest,
            Err(e) => return broken(path, &e),
        };

        let mut discovered = DiscoveredPlugin {
            path: path.clone(),
            id: Some(manifest.info.id.clone()),
            name: Some(manifest.info.name.clone()),
            version: Some(manifest.info.version.clone()),
            installed: true,
            error: None,
        };

        let id = manifest.info.id.clone();
        if path.file_name().and_then(|name| name.to_str()) != Some(id.as_str()) {
            let mismatch = PluginError::manifest(
                "info.id",
                format!(
                    "'{id}' does not match its folder name; move it to {}",
                    self.plugins_dir.join(&id).display()
                ),
            );
            return broken(path, &mismatch);
        }

        let parts = self.lifecycle.parts();
        let _guard = self.lifecycle.lock(&id).await;
        if parts.registry.contains(&id) {
            return discovered;
        }

        let permissions = manifest.permissions.clone();
        let registered = parts
            .registry
            .register(manifest, path, manifest_digest(&bytes))
            .and_then(|_| parts.permissions.seed(&id, &permissions));
        match registered {
            Ok(()) => {
                info!(plugin = %id, "discovered plugin registered");
                parts.events.publish(&id, PluginEventKind::Installed);
            }
            Err(e) => {
                warn!(plugin = %id, error = %e, "could not register discovered plugin");
                discovered.installed = parts.registry.contains(&id);
                discovered.error = Some(e.to_string());
            }
        }
        discovered
    }
}

/// Split an install source into (plugin directory, manifest path).
fn locate(source: &Path) -> (PathBuf, PathBuf) {
    if source.is_dir() {
        return (source.to_path_buf(), source.join(MANIFEST_FILE));
    }
    let dir = source
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    (dir, source.to_path_buf())
}

/// Recursively copy `from` into `to`, skipping `skip` and checking `cancel`
/// between entries.
fn copy_tree(
    from: &Path,
    to: &Path,
    skip: &Path,
    cancel: &CancellationToken,
    plugin_id: &str,
) -> PluginResult<()> {
    for entry in fs::read_dir(from)? {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled(plugin_id.to_string()));
        }
        let entry = entry?;
        let source = entry.path();
        if source == skip {
            continue;
        }
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            copy_tree(&source, &target, skip, cancel, plugin_id)?;
        } else if file_type.is_file() {
            fs::copy(&source, &target)?;
        }
    }
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        warn!(path = %path.display(), error = %e, "could not remove plugin directory");
    }
}
