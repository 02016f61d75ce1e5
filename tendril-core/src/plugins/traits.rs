use async_trait::async_trait;
use std::sync::Arc;

use crate::error::TendrilResult;
use crate::hooks::{HookContext, HookResult};

use super::manifest::PluginManifest;
use super::sandbox::SandboxContext;
use super::types::{PluginContext, PluginEvent};

/// Contract every plugin implements.
///
/// All methods run inside the plugin's sandbox on a spawned task, under a
/// deadline. Privileged operations go through the [`SandboxContext`].
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Called once per run. The default subscribes to every declared hook.
    async fn start(&self, ctx: &PluginContext) -> TendrilResult<()> {
        ctx.subscribe_declared().await
    }

    async fn stop(&self, _ctx: &PluginContext) -> TendrilResult<()> {
        Ok(())
    }

    async fn handle(&self, hook: &HookContext, sandbox: &SandboxContext)
        -> TendrilResult<HookResult>;

    /// Lifecycle notifications such as a reloaded soft dependency.
    async fn on_event(&self, _event: &PluginEvent, _sandbox: &SandboxContext) -> TendrilResult<()> {
        Ok(())
    }
}

pub type DynPlugin = Arc<dyn Plugin>;

/// Instantiates a plugin for a manifest entry point.
pub trait PluginFactory: Send + Sync {
    fn create(&self, manifest: &PluginManifest) -> TendrilResult<DynPlugin>;
}

impl<F> PluginFactory for F
where
    F: Fn(&PluginManifest) -> TendrilResult<DynPlugin> + Send + Sync,
{
    fn create(&self, manifest: &PluginManifest) -> TendrilResult<DynPlugin> {
        self(manifest)
    }
}

pub type DynPluginFactory = Arc<dyn PluginFactory>;
