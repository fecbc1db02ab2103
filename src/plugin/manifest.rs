//! Plugin manifest parsing and validation.
//!
//! A plugin manifest is a `plugin.json` file that describes a plugin's
//! identity, permissions, capabilities and contributions. Validation runs in
//! two passes: a structural walk over the raw JSON (required fields, types,
//! enum values) followed by semantic checks on the typed manifest. Both
//! report the first failing field as a dotted path such as
//! `permissions[1].risk`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{
    Capability, PermissionRisk, PluginError, PluginResult, PluginType, COMMAND_CONTRIBUTION,
    SCRIPT_LANGUAGES,
};

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid id pattern"));

/// Longest accepted plugin id.
pub const MAX_ID_LEN: usize = 128;

/// Plugin manifest containing metadata and configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin metadata.
    pub info: PluginInfo,
    /// Declared permissions, in manifest order.
    #[serde(default)]
    pub permissions: Vec<PermissionSpec>,
    /// Host subsystems the plugin wants to reach.
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    /// Extension points registered on activation.
    #[serde(default)]
    pub contributes: Vec<Contribution>,
    /// Script entry point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PluginScript>,
    /// Settings schema or plain default values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    /// Other plugins this one depends on, by id.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// Plugin metadata section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    /// Globally unique plugin id.
    pub id: String,
    /// Plugin version (semver).
    pub version: String,
    /// Human readable name.
    pub name: String,
    /// Short description, used by search.
    pub description: String,
    /// Plugin author.
    pub author: PluginAuthor,
    /// Plugin type.
    pub plugin_type: PluginType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Oldest host app version the plugin runs on.
    pub min_app_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Keywords for search.
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginAuthor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A declared, risk-classified permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub risk: PermissionRisk,
}

/// A declared extension point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Free-form fields such as `category` or `keybinding`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Contribution {
    /// Whether this contribution becomes a command on activation.
    pub fn is_command(&self) -> bool {
        self.kind == COMMAND_CONTRIBUTION
    }

    /// Look up a free-form string field.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginScript {
    pub language: String,
    pub entry_point: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl PluginManifest {
    /// Parse and validate a manifest from JSON text.
    pub fn from_json(content: &str) -> PluginResult<Self> {
        Self::from_slice(content.as_bytes())
    }

    /// Parse and validate a manifest from raw bytes.
    pub fn from_slice(bytes: &[u8]) -> PluginResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| PluginError::manifest("$", format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Validate an already parsed JSON value.
    pub fn from_value(value: Value) -> PluginResult<Self> {
        check_structure(&value)?;
        let manifest: Self =
            serde_json::from_value(value).map_err(|e| PluginError::manifest("$", e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a manifest from a file.
    pub fn from_file(path: &Path) -> PluginResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_slice(&bytes)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> PluginResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Semantic validation of a typed manifest.
    pub fn validate(&self) -> PluginResult<()> {
        let info = &self.info;

        if info.id.is_empty() {
            return Err(PluginError::manifest("info.id", "must not be empty"));
        }
        if info.id.len() > MAX_ID_LEN {
            return Err(PluginError::manifest(
                "info.id",
                format!("must be at most {MAX_ID_LEN} characters"),
            ));
        }
        if !ID_PATTERN.is_match(&info.id) {
            return Err(PluginError::manifest(
                "info.id",
                "must start with a letter or digit and contain only letters, digits, '.', '-' and '_'",
            ));
        }
        if parse_version(&info.version).is_none() {
            return Err(PluginError::manifest(
                "info.version",
                format!("'{}' is not a semantic version (e.g. 1.0.0)", info.version),
            ));
        }
        if info.name.trim().is_empty() {
            return Err(PluginError::manifest("info.name", "must not be empty"));
        }
        if info.author.name.trim().is_empty() {
            return Err(PluginError::manifest("info.author.name", "must not be empty"));
        }
        if parse_version(&info.min_app_version).is_none() {
            return Err(PluginError::manifest(
                "info.minAppVersion",
                format!("'{}' is not a semantic version (e.g. 1.0.0)", info.min_app_version),
            ));
        }

        let mut seen = HashSet::new();
        for (i, permission) in self.permissions.iter().enumerate() {
            if permission.name.trim().is_empty() {
                return Err(PluginError::manifest(
                    format!("permissions[{i}].name"),
                    "must not be empty",
                ));
            }
            if !seen.insert(permission.name.as_str()) {
                return Err(PluginError::manifest(
                    format!("permissions[{i}].name"),
                    format!("duplicate permission '{}'", permission.name),
                ));
            }
        }

        let mut seen = HashSet::new();
        for (i, contribution) in self.contributes.iter().enumerate() {
            for (field, value) in [
                ("type", &contribution.kind),
                ("id", &contribution.id),
                ("label", &contribution.label),
            ] {
                if value.trim().is_empty() {
                    return Err(PluginError::manifest(
                        format!("contributes[{i}].{field}"),
                        "must not be empty",
                    ));
                }
            }
            if !seen.insert(contribution.id.as_str()) {
                return Err(PluginError::manifest(
                    format!("contributes[{i}].id"),
                    format!("duplicate contribution id '{}'", contribution.id),
                ));
            }
        }

        if let Some(script) = &self.script {
            if !SCRIPT_LANGUAGES.contains(&script.language.as_str()) {
                return Err(PluginError::manifest(
                    "script.language",
                    format!(
                        "unsupported language '{}', expected one of {}",
                        script.language,
                        SCRIPT_LANGUAGES.join(", ")
                    ),
                ));
            }
            if script.entry_point.trim().is_empty() {
                return Err(PluginError::manifest("script.entryPoint", "must not be empty"));
            }
        }

        Ok(())
    }

    /// Plugin id.
    pub fn id(&self) -> &str {
        &self.info.id
    }

    /// Contributions that become commands on activation.
    pub fn command_contributions(&self) -> impl Iterator<Item = &Contribution> {
        self.contributes.iter().filter(|c| c.is_command())
    }

    /// Find a declared permission by name.
    pub fn permission(&self, name: &str) -> Option<&PermissionSpec> {
        self.permissions.iter().find(|p| p.name == name)
    }

    /// Whether the manifest declares `capability`.
    pub fn declares_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Initial settings derived from the settings schema.
    ///
    /// Schema entries of the form `{"default": v}` contribute `v`; entries
    /// that only describe a type are skipped; anything else is taken as a
    /// plain default value.
    pub fn settings_defaults(&self) -> Map<String, Value> {
        let Some(Value::Object(schema)) = &self.settings else {
            return Map::new();
        };

        schema
            .iter()
            .filter_map(|(key, entry)| match entry {
                Value::Object(spec) if spec.contains_key("default") => {
                    spec.get("default").map(|v| (key.clone(), v.clone()))
                }
                Value::Object(spec) if spec.contains_key("type") => None,
                other => Some((key.clone(), other.clone())),
            })
            .collect()
    }

    /// Check if this manifest runs on the given host app version.
    pub fn is_compatible_with(&self, app_version: &str) -> bool {
        match (parse_version(&self.info.min_app_version), parse_version(app_version)) {
            (Some(required), Some(available)) => available >= required,
            _ => false,
        }
    }
}

/// Hex-encoded SHA-256 of the raw manifest bytes.
pub fn manifest_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes).iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse `MAJOR.MINOR.PATCH` with an optional `-pre` or `+build` suffix.
pub fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let core = version.split(['-', '+']).next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor, patch))
}

// ============================================================================
// Structural pass
// ============================================================================

fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn as_object<'a>(value: &'a Value, path: &str) -> PluginResult<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| PluginError::manifest(path, format!("expected an object, found {}", type_name(value))))
}

fn required<'a>(obj: &'a Map<String, Value>, parent: &str, key: &str) -> PluginResult<&'a Value> {
    match obj.get(key) {
        Some(Value::Null) | None => {
            Err(PluginError::manifest(join(parent, key), "missing required field"))
        }
        Some(value) => Ok(value),
    }
}

fn required_str<'a>(obj: &'a Map<String, Value>, parent: &str, key: &str) -> PluginResult<&'a str> {
    let value = required(obj, parent, key)?;
    value.as_str().ok_or_else(|| {
        PluginError::manifest(join(parent, key), format!("expected a string, found {}", type_name(value)))
    })
}

fn optional_str(obj: &Map<String, Value>, parent: &str, key: &str) -> PluginResult<()> {
    match obj.get(key) {
        None | Some(Value::Null | Value::String(_)) => Ok(()),
        Some(other) => Err(PluginError::manifest(
            join(parent, key),
            format!("expected a string, found {}", type_name(other)),
        )),
    }
}

fn optional_array<'a>(
    obj: &'a Map<String, Value>,
    parent: &str,
    key: &str,
) -> PluginResult<&'a [Value]> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(PluginError::manifest(
            join(parent, key),
            format!("expected an array, found {}", type_name(other)),
        )),
    }
}

fn string_map(obj: &Map<String, Value>, parent: &str, key: &str) -> PluginResult<()> {
    let path = join(parent, key);
    match obj.get(key) {
        None | Some(Value::Null) => Ok(()),
        Some(value) => {
            for (name, version) in as_object(value, &path)? {
                if !version.is_string() {
                    return Err(PluginError::manifest(
                        join(&path, name),
                        format!("expected a string, found {}", type_name(version)),
                    ));
                }
            }
            Ok(())
        }
    }
}

fn in_enum<T: std::str::FromStr<Err = String>>(raw: &str, path: String) -> PluginResult<()> {
    raw.parse::<T>().map(|_| ()).map_err(|reason| PluginError::manifest(path, reason))
}

/// Walk the raw manifest and report the first structural problem.
fn check_structure(value: &Value) -> PluginResult<()> {
    let root = as_object(value, "$")?;

    let info = as_object(required(root, "", "info")?, "info")?;
    for key in ["id", "version", "name", "description"] {
        required_str(info, "info", key)?;
    }
    let author = as_object(required(info, "info", "author")?, "info.author")?;
    required_str(author, "info.author", "name")?;
    optional_str(author, "info.author", "email")?;
    optional_str(author, "info.author", "url")?;
    in_enum::<PluginType>(required_str(info, "info", "pluginType")?, "info.pluginType".into())?;
    for key in ["homepage", "repository", "license"] {
        optional_str(info, "info", key)?;
    }
    required_str(info, "info", "minAppVersion")?;
    optional_str(info, "info", "icon")?;
    for (i, keyword) in optional_array(info, "info", "keywords")?.iter().enumerate() {
        if !keyword.is_string() {
            return Err(PluginError::manifest(
                format!("info.keywords[{i}]"),
                format!("expected a string, found {}", type_name(keyword)),
            ));
        }
    }

    for (i, entry) in optional_array(root, "", "permissions")?.iter().enumerate() {
        let path = format!("permissions[{i}]");
        let permission = as_object(entry, &path)?;
        required_str(permission, &path, "name")?;
        optional_str(permission, &path, "description")?;
        in_enum::<PermissionRisk>(required_str(permission, &path, "risk")?, join(&path, "risk"))?;
    }

    for (i, entry) in optional_array(root, "", "capabilities")?.iter().enumerate() {
        let path = format!("capabilities[{i}]");
        let raw = entry.as_str().ok_or_else(|| {
            PluginError::manifest(&path, format!("expected a string, found {}", type_name(entry)))
        })?;
        in_enum::<Capability>(raw, path)?;
    }

    for (i, entry) in optional_array(root, "", "contributes")?.iter().enumerate() {
        let path = format!("contributes[{i}]");
        let contribution = as_object(entry, &path)?;
        for key in ["type", "id", "label"] {
            required_str(contribution, &path, key)?;
        }
        optional_str(contribution, &path, "description")?;
        optional_str(contribution, &path, "icon")?;
    }

    if let Some(script) = root.get("script").filter(|v| !v.is_null()) {
        let script = as_object(script, "script")?;
        required_str(script, "script", "language")?;
        required_str(script, "script", "entryPoint")?;
        string_map(script, "script", "dependencies")?;
    }

    string_map(root, "", "dependencies")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "info": {
                "id": "wordcount-plugin",
                "version": "1.2.0",
                "name": "Word Count",
                "description": "Counts words in the current chapter",
                "author": { "name": "Inkplug Team", "email": "team@example.com" },
                "pluginType": "editor_extension",
                "minAppVersion": "1.0.0",
                "keywords": ["count", "statistics"]
            },
            "permissions": [
                { "name": "editor", "description": "Read the document", "risk": "low" },
                { "name": "filesystem:write", "risk": "high" }
            ],
            "capabilities": ["editor", "filesystem"],
            "contributes": [
                { "type": "command", "id": "wordcount.count", "label": "统计字数",
                  "category": "Tools", "keybinding": "Ctrl+Shift+W" },
                { "type": "panel", "id": "wordcount.panel", "label": "Statistics" }
            ],
            "script": { "language": "javascript", "entryPoint": "main.js" },
            "settings": {
                "showInStatusBar": { "type": "boolean", "default": true },
                "goal": 2000,
                "theme": { "type": "string" }
            },
            "dependencies": {}
        })
    }

    fn error_path(value: Value) -> String {
        match PluginManifest::from_value(value) {
            Err(PluginError::ManifestInvalid { path, .. }) => path,
            other => panic!("expected ManifestInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = PluginManifest::from_value(sample()).unwrap();

        assert_eq!(manifest.id(), "wordcount-plugin");
        assert_eq!(manifest.info.plugin_type, PluginType::EditorExtension);
        assert_eq!(manifest.permissions.len(), 2);
        assert_eq!(manifest.permissions[1].description, "");
        assert!(manifest.declares_capability(Capability::Filesystem));
        assert!(!manifest.declares_capability(Capability::Network));

        let commands: Vec<_> = manifest.command_contributions().collect();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].extra_str("category"), Some("Tools"));
    }

    #[test]
    fn test_minimal_manifest() {
        let manifest = PluginManifest::from_json(
            r#"{"info": {"id": "a", "version": "0.1.0", "name": "A", "description": "",
                "author": {"name": "me"}, "pluginType": "utility", "minAppVersion": "1.0.0"}}"#,
        )
        .unwrap();
        assert!(manifest.permissions.is_empty());
        assert!(manifest.script.is_none());
    }

    #[test]
    fn test_missing_required_field() {
        let mut value = sample();
        value["info"].as_object_mut().unwrap().remove("name");
        assert_eq!(error_path(value), "info.name");

        let mut value = sample();
        value["info"]["author"].as_object_mut().unwrap().remove("name");
        assert_eq!(error_path(value), "info.author.name");
    }

    #[test]
    fn test_wrong_type() {
        let mut value = sample();
        value["info"]["keywords"] = json!(["ok", 3]);
        assert_eq!(error_path(value), "info.keywords[1]");
    }

    #[test]
    fn test_enum_values() {
        let mut value = sample();
        value["info"]["pluginType"] = json!("scanner");
        assert_eq!(error_path(value), "info.pluginType");

        let mut value = sample();
        value["permissions"][1]["risk"] = json!("extreme");
        assert_eq!(error_path(value), "permissions[1].risk");

        let mut value = sample();
        value["capabilities"] = json!(["editor", "telepathy"]);
        assert_eq!(error_path(value), "capabilities[1]");
    }

    #[test]
    fn test_invalid_id() {
        for bad in ["", "has space", "-leading", "semi;colon"] {
            let mut value = sample();
            value["info"]["id"] = json!(bad);
            assert_eq!(error_path(value), "info.id", "id {bad:?}");
        }

        let mut value = sample();
        value["info"]["id"] = json!("a".repeat(MAX_ID_LEN + 1));
        assert_eq!(error_path(value), "info.id");
    }

    #[test]
    fn test_invalid_version() {
        let mut value = sample();
        value["info"]["version"] = json!("invalid");
        assert_eq!(error_path(value), "info.version");

        let mut value = sample();
        value["info"]["minAppVersion"] = json!("1.0");
        assert_eq!(error_path(value), "info.minAppVersion");
    }

    #[test]
    fn test_duplicate_contribution_id() {
        let mut value = sample();
        value["contributes"][1]["id"] = json!("wordcount.count");
        assert_eq!(error_path(value), "contributes[1].id");
    }

    #[test]
    fn test_duplicate_permission() {
        let mut value = sample();
        value["permissions"][1]["name"] = json!("editor");
        assert_eq!(error_path(value), "permissions[1].name");
    }

    #[test]
    fn test_script_language() {
        let mut value = sample();
        value["script"]["language"] = json!("cobol");
        assert_eq!(error_path(value), "script.language");
    }

    #[test]
    fn test_invalid_json() {
        let result = PluginManifest::from_json("{ not json");
        assert!(matches!(result, Err(PluginError::ManifestInvalid { path, .. }) if path == "$"));
    }

    #[test]
    fn test_settings_defaults() {
        let manifest = PluginManifest::from_value(sample()).unwrap();
        let defaults = manifest.settings_defaults();

        assert_eq!(defaults.get("showInStatusBar"), Some(&json!(true)));
        assert_eq!(defaults.get("goal"), Some(&json!(2000)));
        assert!(!defaults.contains_key("theme"));
    }

    #[test]
    fn test_app_compatibility() {
        let manifest = PluginManifest::from_value(sample()).unwrap();

        assert!(manifest.is_compatible_with("1.0.0"));
        assert!(manifest.is_compatible_with("2.3.1"));
        assert!(!manifest.is_compatible_with("0.9.9"));
        assert!(!manifest.is_compatible_with("garbage"));
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("1.2.3"), Some((1, 2, 3)));
        assert_eq!(parse_version("1.2.3-beta.1"), Some((1, 2, 3)));
        assert_eq!(parse_version("1.2"), None);
        assert_eq!(parse_version("1.2.3.4"), None);
    }

    #[test]
    fn test_json_roundtrip_keeps_extra_fields() {
        let manifest = PluginManifest::from_value(sample()).unwrap();
        let json = manifest.to_json().unwrap();
        assert!(json.contains("\"pluginType\": \"editor_extension\""));
        assert!(json.contains("\"keybinding\": \"Ctrl+Shift+W\""));
        assert_eq!(PluginManifest::from_json(&json).unwrap(), manifest);
    }

    #[test]
    fn test_manifest_digest() {
        let digest = manifest_digest(b"{}");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, manifest_digest(b"{}"));
        assert_ne!(digest, manifest_digest(b"{ }"));
    }
}
