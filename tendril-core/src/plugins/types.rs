use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{TendrilError, TendrilResult};

use super::lifecycle::PluginState;
use super::manifest::PluginManifest;
use super::sandbox::SandboxContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub settings: serde_json::Value,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            settings: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl PluginConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: serde_json::Value) -> Self {
        match settings {
            serde_json::Value::Null => Self::default(),
            settings => Self { settings },
        }
    }

    pub fn with_setting<V: Serialize>(mut self, key: &str, value: V) -> Self {
        if let serde_json::Value::Object(ref mut map) = self.settings {
            if let Ok(v) = serde_json::to_value(value) {
                map.insert(key.to_string(), v);
            }
        }
        self
    }

    pub fn get_setting<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        if let serde_json::Value::Object(ref map) = self.settings {
            map.get(key)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PluginEvent {
    Installed {
        plugin_id: String,
        version: String,
        timestamp: DateTime<Utc>,
    },
    Started {
        plugin_id: String,
        timestamp: DateTime<Utc>,
    },
    Stopped {
        plugin_id: String,
        timestamp: DateTime<Utc>,
    },
    Reloaded {
        plugin_id: String,
        timestamp: DateTime<Utc>,
    },
    /// Delivered to a soft dependent whose dependency was reloaded.
    DependencyReloaded {
        plugin_id: String,
        dependency: String,
        timestamp: DateTime<Utc>,
    },
    Tripped {
        plugin_id: String,
        errors_in_window: usize,
        timestamp: DateTime<Utc>,
    },
    Failed {
        plugin_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    Uninstalled {
        plugin_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl PluginEvent {
    pub fn installed(plugin_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self::Installed {
            plugin_id: plugin_id.into(),
            version: version.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn started(plugin_id: impl Into<String>) -> Self {
        Self::Started {
            plugin_id: plugin_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stopped(plugin_id: impl Into<String>) -> Self {
        Self::Stopped {
            plugin_id: plugin_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn reloaded(plugin_id: impl Into<String>) -> Self {
        Self::Reloaded {
            plugin_id: plugin_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn dependency_reloaded(plugin_id: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::DependencyReloaded {
            plugin_id: plugin_id.into(),
            dependency: dependency.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn tripped(plugin_id: impl Into<String>, errors_in_window: usize) -> Self {
        Self::Tripped {
            plugin_id: plugin_id.into(),
            errors_in_window,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(plugin_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Failed {
            plugin_id: plugin_id.into(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn uninstalled(plugin_id: impl Into<String>) -> Self {
        Self::Uninstalled {
            plugin_id: plugin_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        match self {
            Self::Installed { plugin_id, .. }
            | Self::Started { plugin_id, .. }
            | Self::Stopped { plugin_id, .. }
            | Self::Reloaded { plugin_id, .. }
            | Self::DependencyReloaded { plugin_id, .. }
            | Self::Tripped { plugin_id, .. }
            | Self::Failed { plugin_id, .. }
            | Self::Uninstalled { plugin_id, .. } => plugin_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Installed { timestamp, .. }
            | Self::Started { timestamp, .. }
            | Self::Stopped { timestamp, .. }
            | Self::Reloaded { timestamp, .. }
            | Self::DependencyReloaded { timestamp, .. }
            | Self::Tripped { timestamp, .. }
            | Self::Failed { timestamp, .. }
            | Self::Uninstalled { timestamp, .. } => *timestamp,
        }
    }
}

/// A hook subscription a plugin asked for during `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub hook: String,
    pub priority: i32,
}

/// Handed to a plugin while it starts and stops.
#[derive(Debug, Clone)]
pub struct PluginContext {
    manifest: Arc<PluginManifest>,
    config: PluginConfig,
    sandbox: SandboxContext,
    data_dir: Option<PathBuf>,
    requests: Arc<Mutex<Vec<SubscriptionRequest>>>,
}

impl PluginContext {
    pub fn new(manifest: Arc<PluginManifest>, sandbox: SandboxContext) -> Self {
        let config = PluginConfig::from_settings(manifest.settings.clone());
        Self {
            manifest,
            config,
            sandbox,
            data_dir: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &SandboxContext {
        &self.sandbox
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.as_deref()
    }

    /// Subscribe to a declared hook at the priority from the manifest.
    pub async fn subscribe(&self, hook: &str) -> TendrilResult<()> {
        let priority = self
            .manifest
            .hook(hook)
            .map(|h| h.priority)
            .ok_or_else(|| self.undeclared(hook))?;
        self.subscribe_with_priority(hook, priority).await
    }

    pub async fn subscribe_with_priority(&self, hook: &str, priority: i32) -> TendrilResult<()> {
        if !self.manifest.declares_hook(hook) {
            return Err(self.undeclared(hook));
        }

        let mut requests = self.requests.lock().await;
        if requests.iter().any(|r| r.hook == hook) {
            return Err(TendrilError::DuplicateHandler {
                hook: hook.to_string(),
                plugin: self.manifest.id.clone(),
            });
        }
        requests.push(SubscriptionRequest {
            hook: hook.to_string(),
            priority,
        });
        Ok(())
    }

    /// Subscribe to every hook the manifest declares, in declaration order.
    pub async fn subscribe_declared(&self) -> TendrilResult<()> {
        for hook in &self.manifest.hooks {
            self.subscribe_with_priority(&hook.name, hook.priority)
                .await?;
        }
        Ok(())
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionRequest> {
        self.requests.lock().await.clone()
    }

    pub(crate) async fn clear_subscriptions(&self) {
        self.requests.lock().await.clear();
    }

    fn undeclared(&self, hook: &str) -> TendrilError {
        TendrilError::UndeclaredHook {
            hook: hook.to_string(),
            plugin: self.manifest.id.clone(),
        }
    }
}

/// Snapshot of one installed plugin, as returned by `list()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSummary {
    pub id: String,
    pub version: String,
    pub state: PluginState,
    pub entry_point: String,
    pub description: Option<String>,
    pub dependencies: Vec<String>,
    pub hooks: Vec<String>,
    pub capabilities: Vec<String>,
    pub subscriptions: Vec<String>,
    pub last_error: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub installed_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::sandbox::{Sandbox, SandboxConfig};

    fn context() -> PluginContext {
        let manifest = PluginManifest::parse(
            r#"
id = "greeter"
version = "1.0.0"
entry_point = "greeter"
hooks = ["on_request", { name = "on_render", priority = 3 }]

[settings]
greeting = "hi"
"#,
        )
        .unwrap();
        let sandbox = Arc::new(Sandbox::new("greeter", SandboxConfig::new()));
        PluginContext::new(Arc::new(manifest), SandboxContext::new(sandbox))
    }

    #[test]
    fn test_plugin_config() {
        let config = PluginConfig::new().with_setting("retries", 3);
        assert_eq!(config.get_setting::<u32>("retries"), Some(3));
        assert_eq!(config.get_setting::<u32>("missing"), None);
        assert!(PluginConfig::from_settings(serde_json::Value::Null)
            .settings
            .is_object());
    }

    #[test]
    fn test_event_accessors() {
        let event = PluginEvent::dependency_reloaded("chat", "auth");
        assert_eq!(event.plugin_id(), "chat");

        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["event"], "dependency_reloaded");
        assert_eq!(encoded["dependency"], "auth");
    }

    #[tokio::test]
    async fn test_context_settings() {
        let ctx = context();
        assert_eq!(ctx.plugin_id(), "greeter");
        assert_eq!(
            ctx.config().get_setting::<String>("greeting").as_deref(),
            Some("hi")
        );
    }

    #[tokio::test]
    async fn test_subscribe_rules() {
        let ctx = context();

        ctx.subscribe("on_render").await.unwrap();
        assert!(matches!(
            ctx.subscribe("on_render").await,
            Err(TendrilError::DuplicateHandler { .. })
        ));
        assert!(matches!(
            ctx.subscribe("on_shutdown").await,
            Err(TendrilError::UndeclaredHook { .. })
        ));

        let subs = ctx.subscriptions().await;
        assert_eq!(
            subs,
            vec![SubscriptionRequest {
                hook: "on_render".to_string(),
                priority: 3
            }]
        );
    }

    #[tokio::test]
    async fn test_subscribe_declared_order() {
        let ctx = context();
        ctx.subscribe_declared().await.unwrap();
        let hooks: Vec<String> = ctx.subscriptions().await.into_iter().map(|s| s.hook).collect();
        assert_eq!(hooks, vec!["on_request", "on_render"]);
    }
}
