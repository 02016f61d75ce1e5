//! Plugin lifecycle state machine and the per-plugin instance record.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TendrilError, TendrilResult};

use super::manifest::PluginManifest;
use super::sandbox::Sandbox;
use super::traits::DynPlugin;
use super::types::{PluginContext, PluginSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    Discovered,
    Validated,
    Resolved,
    Loading,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl PluginState {
    pub fn valid_transitions(&self) -> &'static [PluginState] {
        use PluginState::*;
        match self {
            Discovered => &[Validated, Failed],
            Validated => &[Resolved, Failed],
            Resolved => &[Loading, Failed],
            Loading => &[Running, Failed],
            Running => &[Stopping, Failed],
            Stopping => &[Stopped, Failed],
            Stopped => &[Resolved, Failed],
            Failed => &[Resolved],
        }
    }

    pub fn can_transition_to(&self, target: PluginState) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// States from which `start` may begin a new run.
    pub fn is_startable(&self) -> bool {
        self.can_transition_to(PluginState::Resolved)
    }

    /// States that hold a live sandbox.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PluginState::Loading | PluginState::Running | PluginState::Stopping
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Discovered => "discovered",
            PluginState::Validated => "validated",
            PluginState::Resolved => "resolved",
            PluginState::Loading => "loading",
            PluginState::Running => "running",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
            PluginState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Everything the lifecycle controller owns for one installed plugin.
pub struct PluginInstance {
    pub manifest: Arc<PluginManifest>,
    state: PluginState,
    pub plugin: Option<DynPlugin>,
    pub sandbox: Option<Arc<Sandbox>>,
    pub context: Option<PluginContext>,
    /// Hooks currently registered with the dispatcher.
    pub subscriptions: Vec<String>,
    pub last_error: Option<String>,
    pub source_dir: Option<PathBuf>,
    pub installed_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl PluginInstance {
    pub fn new(manifest: Arc<PluginManifest>, state: PluginState) -> Self {
        let now = Utc::now();
        Self {
            manifest,
            state,
            plugin: None,
            sandbox: None,
            context: None,
            subscriptions: Vec::new(),
            last_error: None,
            source_dir: None,
            installed_at: now,
            state_changed_at: now,
            started_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn transition(&mut self, to: PluginState) -> TendrilResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(TendrilError::InvalidStateTransition {
                plugin: self.manifest.id.clone(),
                from: self.state,
                to,
            });
        }

        debug!(plugin_id = %self.manifest.id, from = %self.state, to = %to, "State transition");
        self.state = to;
        self.state_changed_at = Utc::now();
        match to {
            PluginState::Running => self.started_at = Some(self.state_changed_at),
            PluginState::Resolved => self.last_error = None,
            _ => {}
        }
        Ok(())
    }

    /// Move to `Failed` from any state, keeping the error for diagnostics.
    pub fn fail(&mut self, error: &TendrilError) {
        if self.state != PluginState::Failed {
            self.state = PluginState::Failed;
            self.state_changed_at = Utc::now();
        }
        self.last_error = Some(error.to_string());
    }

    pub fn summary(&self) -> PluginSummary {
        let manifest = &self.manifest;
        PluginSummary {
            id: manifest.id.clone(),
            version: manifest.version.to_string(),
            state: self.state,
            entry_point: manifest.entry_point.clone(),
            description: manifest.description.clone(),
            dependencies: manifest
                .dependencies
                .iter()
                .map(|d| format!("{} {} ({})", d.id, d.version_range, d.kind))
                .collect(),
            hooks: manifest.hooks.iter().map(|h| h.name.clone()).collect(),
            capabilities: manifest.capabilities.iter().map(|c| c.to_string()).collect(),
            subscriptions: self.subscriptions.clone(),
            last_error: self.last_error.clone(),
            source_dir: self.source_dir.clone(),
            installed_at: self.installed_at,
            state_changed_at: self.state_changed_at,
            started_at: self.started_at,
        }
    }
}
