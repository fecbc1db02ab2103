//! Core plugin types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Type of plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    /// Extends the document editor.
    EditorExtension,
    /// Adds a feature module to the app.
    FeatureModule,
    /// Visual theme.
    Theme,
    /// Translations.
    LanguagePack,
    /// Connects an AI backend.
    AiAdapter,
    /// Import or export formats.
    ImportExport,
    /// Small helper tools.
    Utility,
    /// External service integration.
    Integration,
}

impl PluginType {
    /// All plugin types, in manifest order.
    pub const ALL: [Self; 8] = [
        Self::EditorExtension,
        Self::FeatureModule,
        Self::Theme,
        Self::LanguagePack,
        Self::AiAdapter,
        Self::ImportExport,
        Self::Utility,
        Self::Integration,
    ];

    /// Wire name used in `plugin.json`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EditorExtension => "editor_extension",
            Self::FeatureModule => "feature_module",
            Self::Theme => "theme",
            Self::LanguagePack => "language_pack",
            Self::AiAdapter => "ai_adapter",
            Self::ImportExport => "import_export",
            Self::Utility => "utility",
            Self::Integration => "integration",
        }
    }

    /// Get the display name for this plugin type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::EditorExtension => "Editor Extension",
            Self::FeatureModule => "Feature Module",
            Self::Theme => "Theme",
            Self::LanguagePack => "Language Pack",
            Self::AiAdapter => "AI Adapter",
            Self::ImportExport => "Import/Export",
            Self::Utility => "Utility",
            Self::Integration => "Integration",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl FromStr for PluginType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown plugin type '{s}'"))
    }
}

/// A coarse-grained host subsystem a plugin may access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Editor,
    Project,
    Ai,
    Filesystem,
    Network,
    Ui,
    Storage,
}

impl Capability {
    pub const ALL: [Self; 7] = [
        Self::Editor,
        Self::Project,
        Self::Ai,
        Self::Filesystem,
        Self::Network,
        Self::Ui,
        Self::Storage,
    ];

    /// Wire name, also the base permission name for this capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Editor => "editor",
            Self::Project => "project",
            Self::Ai => "ai",
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Ui => "ui",
            Self::Storage => "storage",
        }
    }

    /// Whether `permission` gates this capability.
    ///
    /// `filesystem` and `filesystem:write` both belong to [`Capability::Filesystem`].
    pub fn covers(&self, permission: &str) -> bool {
        let base = self.as_str();
        permission == base
            || permission.strip_prefix(base).is_some_and(|rest| rest.starts_with(':'))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown capability '{s}'"))
    }
}

/// Risk tier attached to a permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionRisk {
    Low,
    Medium,
    High,
}

impl PermissionRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Medium and high risk permissions need an explicit user confirmation.
    pub fn requires_confirmation(&self) -> bool {
        !matches!(self, Self::Low)
    }
}

impl fmt::Display for PermissionRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionRisk {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("unknown risk tier '{other}'")),
        }
    }
}

/// Script languages with a registered engine slot.
pub const SCRIPT_LANGUAGES: [&str; 3] = ["javascript", "python", "lua"];

/// Contribution type that becomes a command on activation.
pub const COMMAND_CONTRIBUTION: &str = "command";

/// Plugin manifest file name.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Host application version plugins are checked against by default.
pub const DEFAULT_APP_VERSION: &str = "1.0.0";
