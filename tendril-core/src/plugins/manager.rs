//! The lifecycle controller.
//!
//! [`PluginManager`] owns every [`PluginInstance`]. All lifecycle operations
//! are serialized through one registry lock that is acquired with a deadline;
//! hook dispatch goes straight to the [`HookDispatcher`] and never touches it.
//! A supervisor task turns health trips into stops, so the health monitor
//! itself never changes lifecycle state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::config::TendrilConfig;
use crate::error::{TendrilError, TendrilResult};
use crate::hooks::{DispatchOutcome, HookContext, HookDefinition, HookDispatcher, HookInfo};

use super::catalog::PluginCatalog;
use super::discovery::PluginDiscovery;
use super::executor::SandboxExecutor;
use super::health::{HealthMonitor, HealthRecord, TripNotice};
use super::lifecycle::{PluginInstance, PluginState};
use super::manifest::{ManifestViolation, PluginManifest, RawManifest};
use super::resolver::{DependencyGraph, Resolution};
use super::sandbox::{CapabilityGrants, ResourceLimits, Sandbox, SandboxConfig, SandboxContext};
use super::traits::DynPlugin;
use super::types::{PluginContext, PluginEvent, PluginSummary};

type Registry = BTreeMap<String, PluginInstance>;
type EventHandler = Arc<dyn Fn(PluginEvent) + Send + Sync>;

pub struct PluginManager {
    config: TendrilConfig,
    catalog: PluginCatalog,
    grants: RwLock<CapabilityGrants>,
    registry: Mutex<Registry>,
    executor: Arc<SandboxExecutor>,
    dispatcher: Arc<HookDispatcher>,
    health: Arc<HealthMonitor>,
    event_handlers: RwLock<Vec<EventHandler>>,
}

impl PluginManager {
    /// Build a manager and start its health supervisor. Must be called inside
    /// a tokio runtime.
    pub async fn new(config: TendrilConfig, catalog: PluginCatalog) -> TendrilResult<Arc<Self>> {
        config.validate()?;
        let grants = CapabilityGrants::from_config(&config.grants)?;

        let health = Arc::new(HealthMonitor::new(config.health.clone()));
        let executor = Arc::new(SandboxExecutor::new());
        executor.add_observer(health.clone()).await;
        let dispatcher = Arc::new(HookDispatcher::new(config.hooks.clone(), executor.clone()));
        let notices = health.trip_notices().await;

        let manager = Arc::new(Self {
            config,
            catalog,
            grants: RwLock::new(grants),
            registry: Mutex::new(BTreeMap::new()),
            executor,
            dispatcher,
            health,
            event_handlers: RwLock::new(Vec::new()),
        });

        Self::spawn_supervisor(&manager, notices);
        info!(
            entry_points = ?manager.catalog.entry_points(),
            "Plugin manager ready"
        );
        Ok(manager)
    }

    fn spawn_supervisor(manager: &Arc<Self>, mut notices: mpsc::UnboundedReceiver<TripNotice>) {
        let weak = Arc::downgrade(manager);
        tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.handle_trip(notice).await;
            }
            debug!("Health supervisor stopped");
        });
    }

    async fn handle_trip(&self, notice: TripNotice) {
        let mut reg = match self.lock("trip").await {
            Ok(reg) => reg,
            Err(e) => {
                e.log();
                return;
            }
        };

        // a reload or restart since the trip has reset the record
        if !self.health.is_current_trip(&notice).await {
            debug!(plugin_id = %notice.plugin_id, "Ignoring stale trip notice");
            return;
        }

        warn!(
            plugin_id = %notice.plugin_id,
            errors_in_window = notice.errors_in_window,
            window_secs = notice.window_secs,
            "Stopping tripped plugin"
        );

        let mut events = vec![PluginEvent::tripped(
            &notice.plugin_id,
            notice.errors_in_window,
        )];
        if let Err(e) = self
            .stop_cascade(&mut reg, &notice.plugin_id, &mut events)
            .await
        {
            e.log();
        }
        drop(reg);
        self.publish(events).await;
    }

    pub fn config(&self) -> &TendrilConfig {
        &self.config
    }

    pub fn catalog(&self) -> &PluginCatalog {
        &self.catalog
    }

    pub fn dispatcher(&self) -> &Arc<HookDispatcher> {
        &self.dispatcher
    }

    pub fn executor(&self) -> &Arc<SandboxExecutor> {
        &self.executor
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.config.plugins.start_timeout_ms)
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.config.plugins.stop_timeout_ms)
    }

    async fn lock(&self, operation: &str) -> TendrilResult<MutexGuard<'_, Registry>> {
        let wait = Duration::from_millis(self.config.plugins.lock_timeout_ms);
        match tokio::time::timeout(wait, self.registry.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                let err = TendrilError::CoordinatorUnavailable(format!(
                    "{} waited {}ms for the plugin registry",
                    operation,
                    wait.as_millis()
                ));
                err.log_with_context(&crate::error_context!(operation));
                Err(err)
            }
        }
    }

    fn graph(reg: &Registry) -> DependencyGraph {
        DependencyGraph::new(reg.values().map(|i| i.manifest.clone()))
    }

    fn is_running(reg: &Registry, id: &str) -> bool {
        reg.get(id)
            .is_some_and(|i| i.state() == PluginState::Running)
    }

    fn sandbox_config(&self, manifest: &PluginManifest) -> SandboxConfig {
        SandboxConfig::new()
            .with_capabilities(manifest.capabilities.iter().copied())
            .with_resource_limits(ResourceLimits::from(&self.config.sandbox))
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(PluginEvent) + Send + Sync + 'static,
    {
        self.event_handlers.write().await.push(Arc::new(handler));
    }

    async fn publish(&self, events: Vec<PluginEvent>) {
        if events.is_empty() {
            return;
        }
        let handlers = self.event_handlers.read().await.clone();
        for event in events {
            for handler in &handlers {
                handler(event.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // Grants
    // ------------------------------------------------------------------

    /// Replace the host grants. Running plugins keep their sandbox until the
    /// next start or reload.
    pub async fn set_grants(&self, grants: CapabilityGrants) {
        *self.grants.write().await = grants;
        info!("Capability grants replaced");
    }

    pub async fn grants(&self) -> CapabilityGrants {
        self.grants.read().await.clone()
    }

    // ------------------------------------------------------------------
    // Install / uninstall
    // ------------------------------------------------------------------

    pub async fn install(&self, manifest: PluginManifest) -> TendrilResult<String> {
        self.install_instance(manifest, None).await
    }

    /// Validate a raw descriptor and install it.
    pub async fn install_raw(&self, raw: RawManifest) -> TendrilResult<String> {
        self.install(raw.validate()?).await
    }

    pub async fn install_and_start(&self, manifest: PluginManifest) -> TendrilResult<String> {
        let id = self.install(manifest).await?;
        self.start(&id).await?;
        Ok(id)
    }

    /// Install the plugin whose manifest lives in `dir`.
    pub async fn install_from_dir(&self, dir: &Path) -> TendrilResult<String> {
        let manifest = PluginDiscovery::load_manifest(dir).await?;
        self.install_instance(manifest, Some(dir.to_path_buf()))
            .await
    }

    /// Install every valid plugin under the configured plugins directory.
    /// Invalid or conflicting ones are logged and skipped.
    pub async fn discover_and_install(&self) -> TendrilResult<Vec<String>> {
        let discovery = PluginDiscovery::new(self.config.plugins_dir());
        let mut installed = Vec::new();

        for found in discovery.discover().await? {
            let manifest = match found.manifest {
                Ok(m) => m,
                Err(_) => continue,
            };
            match self
                .install_instance((*manifest).clone(), Some(found.source_dir.clone()))
                .await
            {
                Ok(id) => installed.push(id),
                Err(e) => warn!(
                    path = ?found.source_dir,
                    error_code = e.error_code(),
                    "Skipping plugin: {}",
                    e
                ),
            }
        }

        info!(count = installed.len(), "Installed discovered plugins");
        Ok(installed)
    }

    async fn install_instance(
        &self,
        manifest: PluginManifest,
        source_dir: Option<PathBuf>,
    ) -> TendrilResult<String> {
        manifest.check_grants(&*self.grants.read().await)?;

        let id = manifest.id.clone();
        let version = manifest.version.to_string();
        {
            let mut reg = self.lock("install").await?;
            if reg.contains_key(&id) {
                return Err(TendrilError::PluginAlreadyInstalled(id));
            }
            let mut instance = PluginInstance::new(Arc::new(manifest), PluginState::Discovered);
            instance.source_dir = source_dir;
            instance.transition(PluginState::Validated)?;
            reg.insert(id.clone(), instance);
        }

        self.health.track(&id).await;
        info!(plugin_id = %id, version = %version, "Installed plugin");
        self.publish(vec![PluginEvent::installed(&id, version)]).await;
        Ok(id)
    }

    /// Stop and discard a plugin. Refused while a running plugin holds a
    /// hard dependency on it.
    pub async fn uninstall(&self, id: &str) -> TendrilResult<()> {
        let mut events = Vec::new();
        let result = {
            let mut reg = self.lock("uninstall").await?;
            self.uninstall_locked(&mut reg, id, &mut events).await
        };
        self.publish(events).await;
        result
    }

    async fn uninstall_locked(
        &self,
        reg: &mut Registry,
        id: &str,
        events: &mut Vec<PluginEvent>,
    ) -> TendrilResult<()> {
        if !reg.contains_key(id) {
            return Err(TendrilError::PluginNotFound(id.to_string()));
        }

        let dependents: Vec<String> = reg
            .values()
            .filter(|i| i.state().is_active())
            .filter(|i| i.manifest.hard_dependencies().any(|d| d.id == id))
            .map(|i| i.id().to_string())
            .collect();
        if !dependents.is_empty() {
            return Err(TendrilError::PluginInUse {
                plugin: id.to_string(),
                dependents,
            });
        }

        self.stop_one(reg, id, events).await?;
        reg.remove(id);
        self.health.remove(id).await;

        info!(plugin_id = %id, "Uninstalled plugin");
        events.push(PluginEvent::uninstalled(id));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Start / stop / reload
    // ------------------------------------------------------------------

    /// Start a plugin, starting its hard dependencies first. A running plugin
    /// is left alone.
    pub async fn start(&self, id: &str) -> TendrilResult<()> {
        let mut events = Vec::new();
        let result = {
            let mut reg = self.lock("start").await?;
            self.start_with_deps(&mut reg, id, &mut events).await
        };
        self.publish(events).await;
        result
    }

    /// Stop a plugin, stopping its running hard dependents first.
    pub async fn stop(&self, id: &str) -> TendrilResult<()> {
        let mut events = Vec::new();
        let result = {
            let mut reg = self.lock("stop").await?;
            self.stop_cascade(&mut reg, id, &mut events)
                .await
                .map(|_| ())
        };
        self.publish(events).await;
        result
    }

    /// Restart a plugin with a fresh health record.
    ///
    /// Running hard dependents are stopped before it and restarted after it
    /// in resolution order. Soft dependents only receive a
    /// [`PluginEvent::DependencyReloaded`] notification.
    pub async fn reload(&self, id: &str) -> TendrilResult<()> {
        let mut events = Vec::new();
        let result = {
            let mut reg = self.lock("reload").await?;
            self.reload_locked(&mut reg, id, &mut events).await
        };
        self.publish(events).await;
        result
    }

    /// Start every installed plugin in resolution order. Returns the plugins
    /// that could not be started and why.
    pub async fn start_all(&self) -> TendrilResult<BTreeMap<String, TendrilError>> {
        let mut events = Vec::new();
        let mut failures = BTreeMap::new();
        {
            let mut reg = self.lock("start_all").await?;
            let resolution = Self::graph(&reg).resolve();

            for (id, err) in &resolution.failures {
                if !Self::is_running(&reg, id) {
                    let err = self.fail_instance(&mut reg, id, err.clone(), &mut events).await;
                    failures.insert(id.clone(), err);
                }
            }

            for id in &resolution.order {
                if let Err(e) = self.start_one(&mut reg, id, &mut events).await {
                    failures.insert(id.clone(), e);
                }
            }

            info!(
                started = resolution.order.len().saturating_sub(failures.len()),
                failed = failures.len(),
                "Started plugins"
            );
        }
        self.publish(events).await;
        Ok(failures)
    }

    /// Stop every running plugin, dependents first.
    pub async fn shutdown(&self) -> TendrilResult<()> {
        let mut events = Vec::new();
        {
            let mut reg = self.lock("shutdown").await?;
            let resolution = Self::graph(&reg).resolve();

            let mut order: Vec<String> = reg
                .keys()
                .filter(|id| !resolution.is_resolved(id))
                .cloned()
                .collect();
            order.extend(resolution.shutdown_order());

            for id in order {
                if let Err(e) = self.stop_one(&mut reg, &id, &mut events).await {
                    e.log();
                }
            }
            info!("Plugin manager shut down");
        }
        self.publish(events).await;
        Ok(())
    }

    async fn start_with_deps(
        &self,
        reg: &mut Registry,
        id: &str,
        events: &mut Vec<PluginEvent>,
    ) -> TendrilResult<()> {
        let instance = reg
            .get(id)
            .ok_or_else(|| TendrilError::PluginNotFound(id.to_string()))?;
        if instance.state() == PluginState::Running {
            debug!(plugin_id = %id, "Plugin already running");
            return Ok(());
        }

        let graph = Self::graph(reg);
        if let Some(err) = graph.resolve().failure(id) {
            return Err(self.fail_instance(reg, id, err.clone(), events).await);
        }

        for dep in graph.dependencies_of(id) {
            if let Err(e) = self.start_one(reg, &dep, events).await {
                debug!(plugin_id = %id, dependency = %dep, "Dependency failed to start: {}", e);
                let err = TendrilError::DependencyFailed {
                    plugin: id.to_string(),
                    dependency: dep,
                };
                return Err(self.fail_instance(reg, id, err, events).await);
            }
        }

        self.start_one(reg, id, events).await
    }

    /// Start one plugin whose hard dependencies are already running.
    async fn start_one(
        &self,
        reg: &mut Registry,
        id: &str,
        events: &mut Vec<PluginEvent>,
    ) -> TendrilResult<()> {
        let (manifest, state, source_dir) = {
            let instance = reg
                .get(id)
                .ok_or_else(|| TendrilError::PluginNotFound(id.to_string()))?;
            (
                instance.manifest.clone(),
                instance.state(),
                instance.source_dir.clone(),
            )
        };
        if state == PluginState::Running {
            return Ok(());
        }

        if let Some(dep) = manifest
            .hard_dependencies()
            .find(|d| !Self::is_running(reg, &d.id))
        {
            let err = TendrilError::DependencyFailed {
                plugin: id.to_string(),
                dependency: dep.id.clone(),
            };
            return Err(self.fail_instance(reg, id, err, events).await);
        }

        let granted = manifest.check_grants(&*self.grants.read().await);
        if let Err(err) = granted {
            return Err(self.fail_instance(reg, id, err, events).await);
        }

        if let Some(instance) = reg.get_mut(id) {
            if instance.state() != PluginState::Resolved {
                instance.transition(PluginState::Resolved)?;
            }
            instance.transition(PluginState::Loading)?;
        }

        let sandbox = Arc::new(Sandbox::new(id, self.sandbox_config(&manifest)));
        match self.launch(&manifest, &sandbox, source_dir).await {
            Ok((plugin, context, hooks)) => {
                if let Some(instance) = reg.get_mut(id) {
                    instance.plugin = Some(plugin);
                    instance.sandbox = Some(sandbox);
                    instance.context = Some(context);
                    instance.subscriptions = hooks;
                    instance.transition(PluginState::Running)?;
                }
                info!(plugin_id = %id, version = %manifest.version, "Plugin started");
                events.push(PluginEvent::started(id));
                Ok(())
            }
            Err(err) => {
                sandbox.close();
                Err(self.fail_instance(reg, id, err, events).await)
            }
        }
    }

    /// Instantiate, run `start` in the sandbox and register the handlers the
    /// plugin asked for.
    async fn launch(
        &self,
        manifest: &Arc<PluginManifest>,
        sandbox: &Arc<Sandbox>,
        source_dir: Option<PathBuf>,
    ) -> TendrilResult<(DynPlugin, PluginContext, Vec<String>)> {
        let plugin = self.catalog.instantiate(manifest)?;
        let mut context = PluginContext::new(manifest.clone(), SandboxContext::new(sandbox.clone()));
        if let Some(dir) = source_dir {
            context = context.with_data_dir(dir);
        }

        {
            let plugin = plugin.clone();
            let context = context.clone();
            let timeout = Some(self.start_timeout());
            self.executor
                .invoke_lifecycle(sandbox, "start", timeout, move |_| async move {
                    plugin.start(&context).await
                })
                .await
                .map_err(|e| TendrilError::PluginStartFailed {
                    plugin: manifest.id.clone(),
                    message: e.to_string(),
                })?;
        }

        let mut hooks = Vec::new();
        for request in context.subscriptions().await {
            let subscribed = self
                .dispatcher
                .subscribe(
                    &request.hook,
                    &manifest.id,
                    request.priority,
                    plugin.clone(),
                    sandbox.clone(),
                )
                .await;
            if let Err(e) = subscribed {
                self.dispatcher.unsubscribe_plugin(&manifest.id).await;
                return Err(e);
            }
            hooks.push(request.hook);
        }

        if self.health.is_tripped(&manifest.id).await {
            self.health.reset(&manifest.id).await;
        }
        self.health.track(&manifest.id).await;

        Ok((plugin, context, hooks))
    }

    /// Stop `id` and every running hard dependent, dependents first.
    /// Returns the dependents that were stopped, in resolution order.
    async fn stop_cascade(
        &self,
        reg: &mut Registry,
        id: &str,
        events: &mut Vec<PluginEvent>,
    ) -> TendrilResult<Vec<String>> {
        if !reg.contains_key(id) {
            return Err(TendrilError::PluginNotFound(id.to_string()));
        }

        let dependents: Vec<String> = Self::graph(reg)
            .dependents_of(id)
            .into_iter()
            .filter(|d| Self::is_running(reg, d))
            .collect();

        for dependent in dependents.iter().rev() {
            self.stop_one(reg, dependent, events).await?;
        }
        self.stop_one(reg, id, events).await?;

        Ok(dependents)
    }

    /// Stop one running plugin. A plugin whose `stop` fails is torn down
    /// anyway and parked in `Failed`.
    async fn stop_one(
        &self,
        reg: &mut Registry,
        id: &str,
        events: &mut Vec<PluginEvent>,
    ) -> TendrilResult<()> {
        let instance = reg
            .get_mut(id)
            .ok_or_else(|| TendrilError::PluginNotFound(id.to_string()))?;
        if instance.state() != PluginState::Running {
            return Ok(());
        }

        instance.transition(PluginState::Stopping)?;
        self.dispatcher.unsubscribe_plugin(id).await;

        let stopped = match (
            instance.plugin.clone(),
            instance.context.clone(),
            instance.sandbox.clone(),
        ) {
            (Some(plugin), Some(context), Some(sandbox)) => {
                let timeout = Some(self.stop_timeout());
                self.executor
                    .invoke_lifecycle(&sandbox, "stop", timeout, move |_| async move {
                        plugin.stop(&context).await
                    })
                    .await
            }
            _ => Ok(()),
        };

        if let Some(sandbox) = instance.sandbox.take() {
            sandbox.close();
        }
        if let Some(context) = instance.context.take() {
            context.clear_subscriptions().await;
        }
        instance.plugin = None;
        instance.subscriptions.clear();

        match stopped {
            Ok(()) => {
                instance.transition(PluginState::Stopped)?;
                info!(plugin_id = %id, "Plugin stopped");
                events.push(PluginEvent::stopped(id));
            }
            Err(err) => {
                warn!(plugin_id = %id, error_code = err.error_code(), "Plugin failed to stop cleanly: {}", err);
                instance.fail(&err);
                events.push(PluginEvent::failed(id, err.to_string()));
            }
        }
        Ok(())
    }

    async fn reload_locked(
        &self,
        reg: &mut Registry,
        id: &str,
        events: &mut Vec<PluginEvent>,
    ) -> TendrilResult<()> {
        info!(plugin_id = %id, "Reloading plugin");
        let dependents = self.stop_cascade(reg, id, events).await?;

        match self.refresh_manifest(reg, id).await {
            Ok(manifest) => {
                if let Some(instance) = reg.get_mut(id) {
                    instance.manifest = manifest;
                }
            }
            Err(err) => return Err(self.fail_instance(reg, id, err, events).await),
        }

        self.health.reset(id).await;
        self.start_with_deps(reg, id, events).await?;

        for dependent in &dependents {
            if let Err(e) = self.start_with_deps(reg, dependent, events).await {
                warn!(
                    plugin_id = %dependent,
                    dependency = %id,
                    "Dependent failed to restart after reload: {}",
                    e
                );
            }
        }

        for soft in Self::graph(reg).soft_dependents_of(id) {
            self.notify(reg, &soft, PluginEvent::dependency_reloaded(&soft, id))
                .await;
        }

        events.push(PluginEvent::reloaded(id));
        Ok(())
    }

    /// Re-read the manifest from disk when the plugin came from a directory,
    /// then check it against the current grants.
    async fn refresh_manifest(&self, reg: &Registry, id: &str) -> TendrilResult<Arc<PluginManifest>> {
        let instance = reg
            .get(id)
            .ok_or_else(|| TendrilError::PluginNotFound(id.to_string()))?;

        let manifest = match &instance.source_dir {
            Some(dir) => {
                let fresh = PluginDiscovery::load_manifest(dir).await?;
                if fresh.id != id {
                    return Err(TendrilError::ManifestInvalid {
                        plugin: id.to_string(),
                        violations: vec![ManifestViolation::new(
                            "id",
                            format!("changed from '{}' to '{}'", id, fresh.id),
                        )],
                    });
                }
                Arc::new(fresh)
            }
            None => instance.manifest.clone(),
        };

        manifest.check_grants(&*self.grants.read().await)?;
        Ok(manifest)
    }

    /// Deliver a lifecycle event to a running plugin inside its sandbox.
    async fn notify(&self, reg: &Registry, id: &str, event: PluginEvent) {
        let Some(instance) = reg.get(id) else {
            return;
        };
        if instance.state() != PluginState::Running {
            return;
        }
        let (Some(plugin), Some(sandbox)) = (instance.plugin.clone(), instance.sandbox.clone())
        else {
            return;
        };

        let delivered = self
            .executor
            .invoke_lifecycle(&sandbox, "on_event", None, move |ctx| async move {
                plugin.on_event(&event, &ctx).await
            })
            .await;
        if let Err(e) = delivered {
            debug!(plugin_id = %id, "Event delivery failed: {}", e);
        }
    }

    /// Tear down whatever `id` holds and park it in `Failed`.
    async fn fail_instance(
        &self,
        reg: &mut Registry,
        id: &str,
        err: TendrilError,
        events: &mut Vec<PluginEvent>,
    ) -> TendrilError {
        if let Some(instance) = reg.get_mut(id) {
            if instance.state().is_active() {
                self.dispatcher.unsubscribe_plugin(id).await;
            }
            if let Some(sandbox) = instance.sandbox.take() {
                sandbox.close();
            }
            instance.plugin = None;
            instance.context = None;
            instance.subscriptions.clear();
            instance.fail(&err);
        }
        err.log();
        events.push(PluginEvent::failed(id, err.to_string()));
        err
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn list(&self) -> TendrilResult<Vec<PluginSummary>> {
        let reg = self.lock("list").await?;
        Ok(reg.values().map(|i| i.summary()).collect())
    }

    pub async fn get(&self, id: &str) -> TendrilResult<PluginSummary> {
        let reg = self.lock("get").await?;
        reg.get(id)
            .map(|i| i.summary())
            .ok_or_else(|| TendrilError::PluginNotFound(id.to_string()))
    }

    pub async fn state(&self, id: &str) -> TendrilResult<PluginState> {
        let reg = self.lock("state").await?;
        reg.get(id)
            .map(|i| i.state())
            .ok_or_else(|| TendrilError::PluginNotFound(id.to_string()))
    }

    /// Resolution of the currently installed set.
    pub async fn resolve_order(&self) -> TendrilResult<Resolution> {
        let reg = self.lock("resolve").await?;
        Ok(Self::graph(&reg).resolve())
    }

    pub async fn get_health(&self, id: &str) -> TendrilResult<HealthRecord> {
        self.health
            .get(id)
            .await
            .ok_or_else(|| TendrilError::PluginNotFound(id.to_string()))
    }

    pub async fn get_all_health(&self) -> Vec<HealthRecord> {
        self.health.all().await
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    pub async fn register_hook(&self, definition: HookDefinition) -> TendrilResult<()> {
        self.dispatcher.register_hook(definition).await
    }

    pub async fn get_hooks(&self) -> Vec<HookInfo> {
        self.dispatcher.get_hooks().await
    }

    pub async fn emit(&self, hook: &str, payload: serde_json::Value) -> TendrilResult<DispatchOutcome> {
        self.dispatcher.emit(hook, payload).await
    }

    pub async fn emit_with_context(&self, ctx: HookContext) -> TendrilResult<DispatchOutcome> {
        self.dispatcher.emit_with_context(ctx).await
    }
}
