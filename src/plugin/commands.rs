//! Registry of commands contributed by activated plugins.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Contribution, PluginError, PluginResult};

/// A command exposed to the UI while its plugin is activated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCommand {
    pub plugin_id: String,
    pub command_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keybinding: Option<String>,
}

impl PluginCommand {
    /// Build a command from a `command` contribution.
    pub fn from_contribution(plugin_id: &str, contribution: &Contribution) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            command_id: contribution.id.clone(),
            title: contribution.label.clone(),
            description: contribution.description.clone(),
            category: contribution.extra_str("category").map(str::to_string),
            icon: contribution.icon.clone(),
            keybinding: contribution.extra_str("keybinding").map(str::to_string),
        }
    }
}

/// Command table keyed by command id; each id has exactly one owner.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: RwLock<BTreeMap<String, PluginCommand>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register all commands for a plugin, or none of them.
    ///
    /// Fails with `CommandIdConflict` if any id is owned by another plugin.
    pub fn register_batch(
        &self,
        plugin_id: &str,
        commands: Vec<PluginCommand>,
    ) -> PluginResult<Vec<String>> {
        let mut table = self.commands.write();

        for command in &commands {
            if let Some(existing) = table.get(&command.command_id) {
                if existing.plugin_id != plugin_id {
                    return Err(PluginError::CommandIdConflict {
                        command: command.command_id.clone(),
                        owner: existing.plugin_id.clone(),
                    });
                }
            }
        }

        let ids: Vec<String> = commands.iter().map(|c| c.command_id.clone()).collect();
        for mut command in commands {
            command.plugin_id = plugin_id.to_string();
            table.insert(command.command_id.clone(), command);
        }
        debug!(plugin = plugin_id, count = ids.len(), "commands registered");
        Ok(ids)
    }

    /// Remove every command owned by `plugin_id`. Returns the removed ids.
    pub fn unregister_all(&self, plugin_id: &str) -> Vec<String> {
        let mut table = self.commands.write();
        let owned: Vec<String> = table
            .values()
            .filter(|c| c.plugin_id == plugin_id)
            .map(|c| c.command_id.clone())
            .collect();
        for id in &owned {
            table.remove(id);
        }
        owned
    }

    pub fn lookup(&self, command_id: &str) -> PluginResult<PluginCommand> {
        self.commands
            .read()
            .get(command_id)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(command_id.to_string()))
    }

    /// All commands, ordered by command id.
    pub fn list_all(&self) -> Vec<PluginCommand> {
        self.commands.read().values().cloned().collect()
    }

    pub fn list_for_plugin(&self, plugin_id: &str) -> Vec<PluginCommand> {
        self.commands.read().values().filter(|c| c.plugin_id == plugin_id).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.commands.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.read().is_empty()
    }
}
