use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::HooksConfig;
use crate::error::{TendrilError, TendrilResult};
use crate::plugins::{DynPlugin, InvocationStatus, Sandbox, SandboxExecutor};

use super::types::{
    DispatchMode, DispatchOutcome, FanOutReport, HandlerOutcome, HookContext, HookDefinition,
    HookExecution, HookInfo, HookResult, PipelineFailure, PipelineReport, SubscriberInfo,
};

struct Subscription {
    plugin_id: String,
    priority: i32,
    sequence: u64,
    plugin: DynPlugin,
    sandbox: Arc<Sandbox>,
}

impl Subscription {
    fn info(&self) -> SubscriberInfo {
        SubscriberInfo {
            plugin_id: self.plugin_id.clone(),
            priority: self.priority,
            sequence: self.sequence,
        }
    }
}

type Snapshot = Arc<Vec<Arc<Subscription>>>;

#[derive(Default)]
struct HookEntry {
    definition: Option<HookDefinition>,
    /// Replaced wholesale on every change; dispatches hold their own clone.
    subscribers: Snapshot,
}

/// Routes host events to the plugins subscribed to them.
///
/// Registration takes a short write lock and swaps in a new subscriber list.
/// `emit` clones the current list and releases the lock before invoking
/// anything, so a dispatch in flight never observes later changes.
pub struct HookDispatcher {
    config: HooksConfig,
    executor: Arc<SandboxExecutor>,
    hooks: RwLock<BTreeMap<String, HookEntry>>,
    sequence: AtomicU64,
    executions: RwLock<VecDeque<HookExecution>>,
}

impl HookDispatcher {
    pub fn new(config: HooksConfig, executor: Arc<SandboxExecutor>) -> Self {
        Self {
            config,
            executor,
            hooks: RwLock::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
            executions: RwLock::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &HooksConfig {
        &self.config
    }

    /// Define a hook. Re-registering with the same mode updates the timeout
    /// and description; a different mode is rejected.
    pub async fn register_hook(&self, definition: HookDefinition) -> TendrilResult<()> {
        let mut hooks = self.hooks.write().await;
        let entry = hooks.entry(definition.name.clone()).or_default();

        if let Some(existing) = &entry.definition {
            if existing.mode != definition.mode {
                return Err(TendrilError::HookAlreadyDefined(definition.name));
            }
        }

        info!(
            hook = %definition.name,
            mode = %definition.mode,
            timeout_ms = ?definition.timeout_ms,
            "Registered hook"
        );
        entry.definition = Some(definition);
        Ok(())
    }

    pub async fn definition(&self, hook: &str) -> Option<HookDefinition> {
        let hooks = self.hooks.read().await;
        hooks.get(hook).and_then(|e| e.definition.clone())
    }

    pub async fn is_defined(&self, hook: &str) -> bool {
        self.definition(hook).await.is_some()
    }

    /// Add `plugin_id`'s handler to `hook`, ordered by priority then
    /// registration sequence.
    pub async fn subscribe(
        &self,
        hook: &str,
        plugin_id: &str,
        priority: i32,
        plugin: DynPlugin,
        sandbox: Arc<Sandbox>,
    ) -> TendrilResult<()> {
        let mut hooks = self.hooks.write().await;
        let entry = hooks.entry(hook.to_string()).or_default();

        if entry.subscribers.iter().any(|s| s.plugin_id == plugin_id) {
            return Err(TendrilError::DuplicateHandler {
                hook: hook.to_string(),
                plugin: plugin_id.to_string(),
            });
        }

        if entry.subscribers.len() >= self.config.max_handlers_per_hook {
            return Err(TendrilError::HookHandlerLimit {
                hook: hook.to_string(),
                max: self.config.max_handlers_per_hook,
            });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut next: Vec<Arc<Subscription>> = entry.subscribers.iter().cloned().collect();
        next.push(Arc::new(Subscription {
            plugin_id: plugin_id.to_string(),
            priority,
            sequence,
            plugin,
            sandbox,
        }));
        next.sort_by_key(|s| (s.priority, s.sequence));
        entry.subscribers = Arc::new(next);

        info!(
            hook = %hook,
            plugin_id = %plugin_id,
            priority = priority,
            sequence = sequence,
            "Subscribed hook handler"
        );
        Ok(())
    }

    pub async fn unsubscribe(&self, hook: &str, plugin_id: &str) -> TendrilResult<()> {
        let mut hooks = self.hooks.write().await;
        let not_found = || TendrilError::HandlerNotFound {
            hook: hook.to_string(),
            plugin: plugin_id.to_string(),
        };

        let entry = hooks.get_mut(hook).ok_or_else(not_found)?;
        if !entry.subscribers.iter().any(|s| s.plugin_id == plugin_id) {
            return Err(not_found());
        }

        let next: Vec<Arc<Subscription>> = entry
            .subscribers
            .iter()
            .filter(|s| s.plugin_id != plugin_id)
            .cloned()
            .collect();
        entry.subscribers = Arc::new(next);

        info!(hook = %hook, plugin_id = %plugin_id, "Unsubscribed hook handler");
        Ok(())
    }

    /// Drop every handler `plugin_id` holds. Returns how many were removed.
    pub async fn unsubscribe_plugin(&self, plugin_id: &str) -> usize {
        let mut hooks = self.hooks.write().await;
        let mut removed = 0;

        for entry in hooks.values_mut() {
            let before = entry.subscribers.len();
            if !entry.subscribers.iter().any(|s| s.plugin_id == plugin_id) {
                continue;
            }
            let next: Vec<Arc<Subscription>> = entry
                .subscribers
                .iter()
                .filter(|s| s.plugin_id != plugin_id)
                .cloned()
                .collect();
            removed += before - next.len();
            entry.subscribers = Arc::new(next);
        }

        if removed > 0 {
            info!(
                plugin_id = %plugin_id,
                count = removed,
                "Unsubscribed plugin hook handlers"
            );
        }

        removed
    }

    pub async fn subscribers(&self, hook: &str) -> Vec<SubscriberInfo> {
        let hooks = self.hooks.read().await;
        hooks
            .get(hook)
            .map(|e| e.subscribers.iter().map(|s| s.info()).collect())
            .unwrap_or_default()
    }

    pub async fn handler_count(&self) -> usize {
        let hooks = self.hooks.read().await;
        hooks.values().map(|e| e.subscribers.len()).sum()
    }

    pub async fn get_hooks(&self) -> Vec<HookInfo> {
        let hooks = self.hooks.read().await;
        hooks
            .iter()
            .map(|(name, entry)| HookInfo {
                name: name.clone(),
                definition: entry.definition.clone(),
                subscribers: entry.subscribers.iter().map(|s| s.info()).collect(),
            })
            .collect()
    }

    pub async fn emit(&self, hook: &str, payload: serde_json::Value) -> TendrilResult<DispatchOutcome> {
        self.emit_with_context(HookContext::new(hook, payload)).await
    }

    pub async fn emit_with_context(&self, ctx: HookContext) -> TendrilResult<DispatchOutcome> {
        let (definition, snapshot) = {
            let hooks = self.hooks.read().await;
            let entry = hooks
                .get(&ctx.hook)
                .ok_or_else(|| TendrilError::HookNotDefined(ctx.hook.clone()))?;
            let definition = entry
                .definition
                .clone()
                .ok_or_else(|| TendrilError::HookNotDefined(ctx.hook.clone()))?;
            (definition, entry.subscribers.clone())
        };

        let timeout = definition.timeout_ms.map(Duration::from_millis);
        let live: Vec<Arc<Subscription>> = snapshot
            .iter()
            .filter(|s| {
                if s.sandbox.is_closed() {
                    debug!(
                        hook = %ctx.hook,
                        plugin_id = %s.plugin_id,
                        "Skipping handler with a torn-down sandbox"
                    );
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();

        debug!(
            hook = %ctx.hook,
            mode = %definition.mode,
            correlation_id = %ctx.correlation_id,
            handlers = live.len(),
            "Dispatching hook"
        );

        let outcome = match definition.mode {
            DispatchMode::FanOut => DispatchOutcome::FanOut(self.fan_out(&ctx, &live, timeout).await),
            DispatchMode::Pipeline => {
                DispatchOutcome::Pipeline(self.pipeline(&ctx, &live, timeout).await)
            }
        };

        Ok(outcome)
    }

    async fn fan_out(
        &self,
        ctx: &HookContext,
        subscribers: &[Arc<Subscription>],
        timeout: Option<Duration>,
    ) -> FanOutReport {
        let outcomes = join_all(
            subscribers
                .iter()
                .map(|sub| self.invoke_handler(sub, ctx, timeout)),
        )
        .await;

        let report = FanOutReport {
            hook: ctx.hook.clone(),
            correlation_id: ctx.correlation_id,
            outcomes,
        };

        let failed = report.failures().count();
        if failed > 0 {
            warn!(
                hook = %ctx.hook,
                failed = failed,
                total = report.outcomes.len(),
                "Fan-out completed with handler failures"
            );
        }
        report
    }

    async fn pipeline(
        &self,
        ctx: &HookContext,
        subscribers: &[Arc<Subscription>],
        timeout: Option<Duration>,
    ) -> PipelineReport {
        let mut value = ctx.payload.clone();
        let mut completed = Vec::new();
        let mut halted_by = None;
        let mut failure = None;

        for sub in subscribers {
            let stage = ctx.with_payload(value.clone());
            let outcome = self.invoke_handler(sub, &stage, timeout).await;

            match outcome.result {
                Ok(HookResult::Continue) => completed.push(outcome.plugin_id),
                Ok(HookResult::Modified(next)) => {
                    value = next;
                    completed.push(outcome.plugin_id);
                }
                Ok(HookResult::Halt(terminal)) => {
                    value = terminal;
                    info!(hook = %ctx.hook, plugin_id = %outcome.plugin_id, "Pipeline halted");
                    halted_by = Some(outcome.plugin_id.clone());
                    completed.push(outcome.plugin_id);
                    break;
                }
                Err(error) => {
                    warn!(
                        hook = %ctx.hook,
                        plugin_id = %outcome.plugin_id,
                        status = %outcome.status,
                        "Pipeline aborted: {}",
                        error
                    );
                    failure = Some(PipelineFailure {
                        plugin_id: outcome.plugin_id,
                        error,
                    });
                    break;
                }
            }
        }

        PipelineReport {
            hook: ctx.hook.clone(),
            correlation_id: ctx.correlation_id,
            value,
            halted_by,
            failure,
            completed,
        }
    }

    async fn invoke_handler(
        &self,
        sub: &Subscription,
        ctx: &HookContext,
        timeout: Option<Duration>,
    ) -> HandlerOutcome {
        let execution = HookExecution::new(ctx, &sub.plugin_id);
        let started = Instant::now();
        let plugin = sub.plugin.clone();
        let hook_ctx = ctx.clone();
        let operation = format!("hook:{}", ctx.hook);

        let result = self
            .executor
            .invoke(&sub.sandbox, &operation, timeout, move |sandbox| async move {
                plugin.handle(&hook_ctx, &sandbox).await
            })
            .await;

        let execution = match &result {
            Ok(r) => execution.complete(r.clone()),
            Err(e) => execution.fail(e),
        };
        self.record_execution(execution).await;

        HandlerOutcome {
            plugin_id: sub.plugin_id.clone(),
            status: InvocationStatus::of(&result),
            result,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn record_execution(&self, execution: HookExecution) {
        let mut executions = self.executions.write().await;
        executions.push_back(execution);
        while executions.len() > self.config.history_size {
            executions.pop_front();
        }
    }

    /// Most recent first.
    pub async fn get_history(&self, limit: usize) -> Vec<HookExecution> {
        let executions = self.executions.read().await;
        executions.iter().rev().take(limit).cloned().collect()
    }

    pub async fn get_history_for_hook(&self, hook: &str, limit: usize) -> Vec<HookExecution> {
        let executions = self.executions.read().await;
        executions
            .iter()
            .rev()
            .filter(|e| e.hook == hook)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn clear_history(&self) {
        self.executions.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{SandboxConfig, SandboxContext};
    use async_trait::async_trait;
    use serde_json::json;

    enum Behaviour {
        Continue,
        Append(&'static str),
        Halt,
        Fail,
    }

    struct Stage {
        behaviour: Behaviour,
    }

    #[async_trait]
    impl crate::plugins::Plugin for Stage {
        async fn handle(
            &self,
            hook: &HookContext,
            _sandbox: &SandboxContext,
        ) -> TendrilResult<HookResult> {
            match &self.behaviour {
                Behaviour::Continue => Ok(HookResult::Continue),
                Behaviour::Append(tag) => {
                    let mut items = hook.payload.as_array().cloned().unwrap_or_default();
                    items.push(json!(tag));
                    Ok(HookResult::modified(json!(items)))
                }
                Behaviour::Halt => Ok(HookResult::halt(json!("stopped"))),
                Behaviour::Fail => Err(TendrilError::plugin("stage failed")),
            }
        }
    }

    fn dispatcher() -> HookDispatcher {
        HookDispatcher::new(HooksConfig::default(), Arc::new(SandboxExecutor::new()))
    }

    async fn add(d: &HookDispatcher, hook: &str, id: &str, priority: i32, behaviour: Behaviour) {
        let sandbox = Arc::new(Sandbox::new(id, SandboxConfig::new()));
        d.subscribe(hook, id, priority, Arc::new(Stage { behaviour }), sandbox)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_hook_rules() {
        let d = dispatcher();
        d.register_hook(HookDefinition::pipeline("render")).await.unwrap();
        d.register_hook(HookDefinition::pipeline("render").with_timeout_ms(50))
            .await
            .unwrap();
        assert_eq!(d.definition("render").await.unwrap().timeout_ms, Some(50));

        assert!(matches!(
            d.register_hook(HookDefinition::fan_out("render")).await,
            Err(TendrilError::HookAlreadyDefined(_))
        ));
    }

    #[tokio::test]
    async fn test_order_by_priority_then_sequence() {
        let d = dispatcher();
        add(&d, "h", "late", 5, Behaviour::Continue).await;
        add(&d, "h", "first", 0, Behaviour::Continue).await;
        add(&d, "h", "second", 0, Behaviour::Continue).await;

        let order: Vec<String> = d.subscribers("h").await.into_iter().map(|s| s.plugin_id).collect();
        assert_eq!(order, vec!["first", "second", "late"]);
    }

    #[tokio::test]
    async fn test_duplicate_and_limit() {
        let d = HookDispatcher::new(
            HooksConfig {
                max_handlers_per_hook: 1,
                ..HooksConfig::default()
            },
            Arc::new(SandboxExecutor::new()),
        );
        add(&d, "h", "a", 0, Behaviour::Continue).await;

        let sandbox = Arc::new(Sandbox::new("a", SandboxConfig::new()));
        let dup = d
            .subscribe("h", "a", 0, Arc::new(Stage { behaviour: Behaviour::Continue }), sandbox.clone())
            .await;
        assert!(matches!(dup, Err(TendrilError::DuplicateHandler { .. })));

        let over = d
            .subscribe("h", "b", 0, Arc::new(Stage { behaviour: Behaviour::Continue }), sandbox)
            .await;
        assert!(matches!(over, Err(TendrilError::HookHandlerLimit { max: 1, .. })));
    }

    #[tokio::test]
    async fn test_emit_undefined_hook() {
        let d = dispatcher();
        add(&d, "ghost", "a", 0, Behaviour::Continue).await;
        assert!(matches!(
            d.emit("ghost", json!(null)).await,
            Err(TendrilError::HookNotDefined(_))
        ));
    }

    #[tokio::test]
    async fn test_pipeline_threads_value() {
        let d = dispatcher();
        d.register_hook(HookDefinition::pipeline("p")).await.unwrap();
        add(&d, "p", "a", 0, Behaviour::Append("a")).await;
        add(&d, "p", "b", 1, Behaviour::Continue).await;
        add(&d, "p", "c", 2, Behaviour::Append("c")).await;

        let report = d.emit("p", json!([])).await.unwrap().into_pipeline().unwrap();
        assert!(report.is_success());
        assert_eq!(report.value, json!(["a", "c"]));
        assert_eq!(report.completed, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_pipeline_halt() {
        let d = dispatcher();
        d.register_hook(HookDefinition::pipeline("p")).await.unwrap();
        add(&d, "p", "a", 0, Behaviour::Halt).await;
        add(&d, "p", "b", 1, Behaviour::Append("b")).await;

        let report = d.emit("p", json!([])).await.unwrap().into_pipeline().unwrap();
        assert_eq!(report.halted_by.as_deref(), Some("a"));
        assert_eq!(report.value, json!("stopped"));
        assert_eq!(report.completed, vec!["a"]);
    }

    #[tokio::test]
    async fn test_pipeline_failure_keeps_last_good_value() {
        let d = dispatcher();
        d.register_hook(HookDefinition::pipeline("p")).await.unwrap();
        add(&d, "p", "a", 0, Behaviour::Append("a")).await;
        add(&d, "p", "b", 1, Behaviour::Fail).await;
        add(&d, "p", "c", 2, Behaviour::Append("c")).await;

        let report = d.emit("p", json!([])).await.unwrap().into_pipeline().unwrap();
        assert_eq!(report.value, json!(["a"]));
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.plugin_id, "b");
        assert!(matches!(failure.error, TendrilError::RuntimeFault { .. }));
        assert!(report.into_result().is_err());
    }

    #[tokio::test]
    async fn test_fan_out_collects_failures() {
        let d = dispatcher();
        d.register_hook(HookDefinition::fan_out("f")).await.unwrap();
        add(&d, "f", "a", 0, Behaviour::Continue).await;
        add(&d, "f", "b", 0, Behaviour::Fail).await;
        add(&d, "f", "c", 0, Behaviour::Continue).await;

        let report = d.emit("f", json!({})).await.unwrap().into_fan_out().unwrap();
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.successes().count(), 2);
        let failed: Vec<&str> = report.failures().map(|o| o.plugin_id.as_str()).collect();
        assert_eq!(failed, vec!["b"]);
        assert_eq!(d.get_history(10).await.len(), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_closed_sandbox() {
        let d = dispatcher();
        d.register_hook(HookDefinition::fan_out("f")).await.unwrap();
        add(&d, "f", "a", 0, Behaviour::Continue).await;

        let closed = Arc::new(Sandbox::new("b", SandboxConfig::new()));
        d.subscribe("f", "b", 0, Arc::new(Stage { behaviour: Behaviour::Continue }), closed.clone())
            .await
            .unwrap();
        closed.close();

        let report = d.emit("f", json!({})).await.unwrap().into_fan_out().unwrap();
        assert_eq!(report.outcomes.len(), 1);

        assert_eq!(d.unsubscribe_plugin("b").await, 1);
        assert!(matches!(
            d.unsubscribe("f", "b").await,
            Err(TendrilError::HandlerNotFound { .. })
        ));
        d.unsubscribe("f", "a").await.unwrap();
        assert_eq!(d.handler_count().await, 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let d = HookDispatcher::new(
            HooksConfig {
                history_size: 2,
                ..HooksConfig::default()
            },
            Arc::new(SandboxExecutor::new()),
        );
        d.register_hook(HookDefinition::fan_out("f")).await.unwrap();
        add(&d, "f", "a", 0, Behaviour::Continue).await;

        for _ in 0..5 {
            d.emit("f", json!({})).await.unwrap();
        }
        assert_eq!(d.get_history(10).await.len(), 2);
        assert_eq!(d.get_history_for_hook("f", 1).await.len(), 1);
    }
}
