use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::{TendrilError, TendrilResult};

use super::sandbox::{Capability, CapabilityGrants};
use super::version::{Version, VersionReq};

const MAX_ID_LEN: usize = 64;

/// Manifest as written by the plugin author. Every field is optional so that
/// validation can report all problems at once instead of failing on the first
/// missing key during deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawManifest {
    pub id: Option<String>,
    pub version: Option<String>,
    pub entry_point: Option<String>,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub homepage: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<RawDependency>,
    #[serde(default)]
    pub hooks: Vec<RawHookDeclaration>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawDependency {
    /// Bare id, any version.
    Id(String),
    Table {
        id: Option<String>,
        #[serde(alias = "version")]
        version_range: Option<String>,
        kind: Option<DependencyKind>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawHookDeclaration {
    Name(String),
    Table {
        name: Option<String>,
        priority: Option<i32>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Must be running before the dependent starts; reloads cascade.
    #[default]
    Hard,
    /// Orders loading when installed; the dependent is only notified on reload.
    Soft,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Hard => write!(f, "hard"),
            DependencyKind::Soft => write!(f, "soft"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub id: String,
    pub version_range: VersionReq,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn hard(id: impl Into<String>, version_range: VersionReq) -> Self {
        Self {
            id: id.into(),
            version_range,
            kind: DependencyKind::Hard,
        }
    }

    pub fn soft(id: impl Into<String>, version_range: VersionReq) -> Self {
        Self {
            id: id.into(),
            version_range,
            kind: DependencyKind::Soft,
        }
    }

    pub fn is_hard(&self) -> bool {
        self.kind == DependencyKind::Hard
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookDeclaration {
    pub name: String,
    pub priority: i32,
}

/// A single rule a manifest breaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestViolation {
    pub field: String,
    pub message: String,
}

impl ManifestViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ManifestViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A validated, immutable plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginManifest {
    pub id: String,
    pub version: Version,
    pub entry_point: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub license: Option<String>,
    pub homepage: Option<String>,
    pub dependencies: Vec<Dependency>,
    pub hooks: Vec<HookDeclaration>,
    pub capabilities: BTreeSet<Capability>,
    pub settings: serde_json::Value,
}

impl RawManifest {
    pub fn from_toml(content: &str) -> TendrilResult<Self> {
        toml::from_str(content).map_err(|e| TendrilError::ManifestParse {
            origin: "toml".to_string(),
            message: e.to_string(),
        })
    }

    pub fn from_json(content: &str) -> TendrilResult<Self> {
        serde_json::from_str(content).map_err(|e| TendrilError::ManifestParse {
            origin: "json".to_string(),
            message: e.to_string(),
        })
    }

    pub fn from_yaml(content: &str) -> TendrilResult<Self> {
        serde_yaml::from_str(content).map_err(|e| TendrilError::ManifestParse {
            origin: "yaml".to_string(),
            message: e.to_string(),
        })
    }

    /// Check every rule and return either the validated manifest or the
    /// complete list of violations.
    pub fn validate(&self) -> TendrilResult<PluginManifest> {
        let mut violations = Vec::new();

        let id = match self.id.as_deref().map(str::trim) {
            None | Some("") => {
                violations.push(ManifestViolation::new("id", "is required"));
                None
            }
            Some(id) if !is_valid_id(id) => {
                violations.push(ManifestViolation::new(
                    "id",
                    format!(
                        "'{}' must be 1-{} characters of letters, digits, '-', '_' or '.'",
                        id, MAX_ID_LEN
                    ),
                ));
                None
            }
            Some(id) => Some(id.to_string()),
        };

        let version = match self.version.as_deref().map(str::trim) {
            None | Some("") => {
                violations.push(ManifestViolation::new("version", "is required"));
                None
            }
            Some(raw) => match Version::parse(raw) {
                Ok(version) => Some(version),
                Err(e) => {
                    violations.push(ManifestViolation::new("version", e));
                    None
                }
            },
        };

        let entry_point = match self.entry_point.as_deref().map(str::trim) {
            None | Some("") => {
                violations.push(ManifestViolation::new("entry_point", "is required"));
                None
            }
            Some(entry) => Some(entry.to_string()),
        };

        let hooks = self.validate_hooks(&mut violations);
        let dependencies = self.validate_dependencies(id.as_deref(), &mut violations);

        let mut capabilities = BTreeSet::new();
        for (index, tag) in self.capabilities.iter().enumerate() {
            match Capability::from_str(tag) {
                Ok(cap) => {
                    capabilities.insert(cap);
                }
                Err(e) => violations.push(ManifestViolation::new(
                    format!("capabilities[{}]", index),
                    e,
                )),
            }
        }

        match (id, version, entry_point) {
            (Some(id), Some(version), Some(entry_point)) if violations.is_empty() => {
                Ok(PluginManifest {
                    id,
                    version,
                    entry_point,
                    description: self.description.clone(),
                    author: self.author.clone(),
                    license: self.license.clone(),
                    homepage: self.homepage.clone(),
                    dependencies,
                    hooks,
                    capabilities,
                    settings: self.settings.clone().unwrap_or(serde_json::Value::Null),
                })
            }
            _ => Err(TendrilError::ManifestInvalid {
                plugin: self
                    .id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| "<unnamed>".to_string()),
                violations,
            }),
        }
    }

    fn validate_hooks(&self, violations: &mut Vec<ManifestViolation>) -> Vec<HookDeclaration> {
        let mut seen = HashSet::new();
        let mut hooks = Vec::new();

        for (index, raw) in self.hooks.iter().enumerate() {
            let field = format!("hooks[{}]", index);
            let (name, priority) = match raw {
                RawHookDeclaration::Name(name) => (Some(name.trim()), 0),
                RawHookDeclaration::Table { name, priority } => {
                    (name.as_deref().map(str::trim), priority.unwrap_or(0))
                }
            };

            let name = match name {
                None | Some("") => {
                    violations.push(ManifestViolation::new(field, "hook name is required"));
                    continue;
                }
                Some(name) => name,
            };

            if !is_valid_hook_name(name) {
                violations.push(ManifestViolation::new(
                    field,
                    format!("'{}' is not a valid hook name", name),
                ));
                continue;
            }

            if !seen.insert(name.to_string()) {
                violations.push(ManifestViolation::new(
                    field,
                    format!("hook '{}' is declared more than once", name),
                ));
                continue;
            }

            hooks.push(HookDeclaration {
                name: name.to_string(),
                priority,
            });
        }

        hooks
    }

    fn validate_dependencies(
        &self,
        own_id: Option<&str>,
        violations: &mut Vec<ManifestViolation>,
    ) -> Vec<Dependency> {
        let mut seen = HashSet::new();
        let mut dependencies = Vec::new();

        for (index, raw) in self.dependencies.iter().enumerate() {
            let field = format!("dependencies[{}]", index);
            let (dep_id, range, kind) = match raw {
                RawDependency::Id(id) => (Some(id.trim()), None, DependencyKind::Hard),
                RawDependency::Table {
                    id,
                    version_range,
                    kind,
                } => (
                    id.as_deref().map(str::trim),
                    version_range.as_deref(),
                    kind.unwrap_or_default(),
                ),
            };

            let dep_id = match dep_id {
                None | Some("") => {
                    violations.push(ManifestViolation::new(field, "dependency id is required"));
                    continue;
                }
                Some(dep_id) => dep_id,
            };

            if !is_valid_id(dep_id) {
                violations.push(ManifestViolation::new(
                    field.clone(),
                    format!("'{}' is not a valid plugin id", dep_id),
                ));
            }

            if own_id == Some(dep_id) {
                violations.push(ManifestViolation::new(
                    field.clone(),
                    "a plugin cannot depend on itself",
                ));
            }

            if !seen.insert(dep_id.to_string()) {
                violations.push(ManifestViolation::new(
                    field.clone(),
                    format!("dependency '{}' is declared more than once", dep_id),
                ));
            }

            let version_range = match range {
                None => VersionReq::any(),
                Some(range) => match VersionReq::parse(range) {
                    Ok(req) => req,
                    Err(e) => {
                        violations.push(ManifestViolation::new(field, e));
                        continue;
                    }
                },
            };

            dependencies.push(Dependency {
                id: dep_id.to_string(),
                version_range,
                kind,
            });
        }

        dependencies
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn is_valid_hook_name(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

impl PluginManifest {
    pub const FILENAME: &'static str = "tendril-plugin.toml";

    /// Parse and validate a TOML manifest.
    pub fn parse(content: &str) -> TendrilResult<Self> {
        RawManifest::from_toml(content)?.validate()
    }

    pub fn parse_json(content: &str) -> TendrilResult<Self> {
        RawManifest::from_json(content)?.validate()
    }

    pub fn parse_yaml(content: &str) -> TendrilResult<Self> {
        RawManifest::from_yaml(content)?.validate()
    }

    /// Load a manifest file, choosing the format by extension (TOML by default).
    pub async fn load_from_file(path: &Path) -> TendrilResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            TendrilError::ManifestParse {
                origin: path.display().to_string(),
                message: e.to_string(),
            }
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::parse_json(&content),
            Some("yaml") | Some("yml") => Self::parse_yaml(&content),
            _ => Self::parse(&content),
        }
    }

    pub fn declares_hook(&self, name: &str) -> bool {
        self.hooks.iter().any(|h| h.name == name)
    }

    pub fn hook(&self, name: &str) -> Option<&HookDeclaration> {
        self.hooks.iter().find(|h| h.name == name)
    }

    pub fn hard_dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(|d| d.is_hard())
    }

    pub fn depends_on(&self, id: &str) -> Option<&Dependency> {
        self.dependencies.iter().find(|d| d.id == id)
    }

    /// Reject the manifest if the host does not grant every capability it declares.
    pub fn check_grants(&self, grants: &CapabilityGrants) -> TendrilResult<()> {
        let missing: Vec<String> = self
            .capabilities
            .iter()
            .filter(|cap| !grants.allows(&self.id, **cap))
            .map(|cap| cap.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(TendrilError::CapabilityNotGranted {
                plugin: self.id.clone(),
                capabilities: missing,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"
id = "analytics"
version = "1.2.0"
entry_point = "analytics::main"
description = "Page view counter"
capabilities = ["network:outbound"]
hooks = ["on_request", { name = "on_render", priority = -5 }]

[[dependencies]]
id = "auth"
version_range = "^1.0"

[[dependencies]]
id = "theme"
kind = "soft"

[settings]
sample_rate = 0.5
"#
    }

    #[test]
    fn test_parse_manifest() {
        let manifest = PluginManifest::parse(sample()).unwrap();
        assert_eq!(manifest.id, "analytics");
        assert_eq!(manifest.version, Version::new(1, 2, 0));
        assert_eq!(manifest.entry_point, "analytics::main");
        assert_eq!(manifest.hooks.len(), 2);
        assert_eq!(manifest.hooks[1].priority, -5);
        assert_eq!(manifest.dependencies[0].kind, DependencyKind::Hard);
        assert_eq!(manifest.dependencies[1].kind, DependencyKind::Soft);
        assert!(manifest.dependencies[1].version_range.is_any());
        assert!(manifest.capabilities.contains(&Capability::NetworkOutbound));
        assert_eq!(manifest.settings["sample_rate"], serde_json::json!(0.5));
        assert!(manifest.declares_hook("on_request"));
        assert!(!manifest.declares_hook("on_shutdown"));
    }

    #[test]
    fn test_collects_every_violation() {
        let raw = RawManifest::from_toml(
            r#"
id = "bad id"
version = "one"
hooks = ["on_request", "on_request", "9lives"]
capabilities = ["teleport"]

[[dependencies]]
id = "bad id"
"#,
        )
        .unwrap();

        match raw.validate().unwrap_err() {
            TendrilError::ManifestInvalid { plugin, violations } => {
                assert_eq!(plugin, "bad id");
                let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
                assert!(fields.contains(&"id"));
                assert!(fields.contains(&"version"));
                assert!(fields.contains(&"entry_point"));
                assert!(fields.contains(&"hooks[1]"));
                assert!(fields.contains(&"hooks[2]"));
                assert!(fields.contains(&"capabilities[0]"));
                assert!(fields.contains(&"dependencies[0]"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency() {
        let raw = RawManifest::from_toml(
            r#"
id = "loop"
version = "1.0.0"
entry_point = "loop"
dependencies = ["loop"]
"#,
        )
        .unwrap();

        let err = raw.validate().unwrap_err();
        assert!(err.to_string().contains("cannot depend on itself"));
    }

    #[test]
    fn test_bad_version_range() {
        let raw = RawManifest::from_toml(
            r#"
id = "chat"
version = "1.0.0"
entry_point = "chat"

[[dependencies]]
id = "auth"
version = ">=banana"
"#,
        )
        .unwrap();

        assert!(matches!(
            raw.validate(),
            Err(TendrilError::ManifestInvalid { .. })
        ));
    }

    #[test]
    fn test_parse_error() {
        let err = PluginManifest::parse("id = [").unwrap_err();
        assert_eq!(err.error_code(), "E1001");
    }

    #[test]
    fn test_json_and_yaml() {
        let json = PluginManifest::parse_json(
            r#"{"id": "search", "version": "0.3.1", "entry_point": "search",
                "hooks": ["on_query"], "dependencies": [{"id": "index", "version": ">=0.1"}]}"#,
        )
        .unwrap();
        assert_eq!(json.id, "search");
        assert!(json.depends_on("index").is_some());

        let yaml = PluginManifest::parse_yaml(
            "id: search\nversion: 0.3.1\nentry_point: search\ncapabilities:\n  - filesystem:read\n",
        )
        .unwrap();
        assert!(yaml.capabilities.contains(&Capability::FilesystemRead));
    }

    #[test]
    fn test_check_grants() {
        let manifest = PluginManifest::parse(sample()).unwrap();

        let denied = CapabilityGrants::new();
        match manifest.check_grants(&denied).unwrap_err() {
            TendrilError::CapabilityNotGranted {
                plugin,
                capabilities,
            } => {
                assert_eq!(plugin, "analytics");
                assert_eq!(capabilities, vec!["network:outbound".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let granted = CapabilityGrants::new().grant("analytics", [Capability::Network]);
        assert!(manifest.check_grants(&granted).is_ok());
    }
}
