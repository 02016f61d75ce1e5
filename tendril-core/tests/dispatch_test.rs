use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tendril_core::{
    DispatchMode, DynPlugin, HookContext, HookDefinition, HookDispatcher, HookResult,
    HooksConfig, InvocationStatus, Plugin, PluginCatalog, PluginManager, PluginManifest, Sandbox,
    SandboxConfig, SandboxContext, SandboxExecutor, TendrilConfig, TendrilError, TendrilResult,
};

/// Behaviour is picked from the manifest `settings.action` value.
struct Scripted {
    id: String,
    action: String,
}

#[async_trait]
impl Plugin for Scripted {
    async fn handle(&self, hook: &HookContext, _sandbox: &SandboxContext) -> TendrilResult<HookResult> {
        match self.action.as_str() {
            "append" => {
                let mut items = hook.payload.as_array().cloned().unwrap_or_default();
                items.push(json!(self.id));
                Ok(HookResult::modified(Value::Array(items)))
            }
            "halt" => Ok(HookResult::halt(json!({ "halted_by": self.id }))),
            "fail" => Err(TendrilError::plugin(format!("{} refused", self.id))),
            "panic" => panic!("{} exploded", self.id),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(HookResult::Continue)
            }
            _ => Ok(HookResult::Continue),
        }
    }
}

fn catalog() -> PluginCatalog {
    PluginCatalog::new().with("scripted", |m: &PluginManifest| -> TendrilResult<DynPlugin> {
        let action = m
            .settings
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("continue")
            .to_string();
        Ok(Arc::new(Scripted {
            id: m.id.clone(),
            action,
        }))
    })
}

fn manifest(id: &str, hook: &str, priority: i32, action: &str) -> PluginManifest {
    PluginManifest::parse(&format!(
        r#"
id = "{id}"
version = "1.0.0"
entry_point = "scripted"
hooks = [{{ name = "{hook}", priority = {priority} }}]

[settings]
action = "{action}"
"#
    ))
    .unwrap()
}

async fn manager_with(hook: HookDefinition, plugins: &[(&str, i32, &str)]) -> Arc<PluginManager> {
    let manager = PluginManager::new(TendrilConfig::default(), catalog())
        .await
        .unwrap();
    let name = hook.name.clone();
    manager.register_hook(hook).await.unwrap();
    for (id, priority, action) in plugins {
        manager
            .install_and_start(manifest(id, &name, *priority, action))
            .await
            .unwrap();
    }
    manager
}

mod fan_out_tests {
    use super::*;

    #[tokio::test]
    async fn test_one_fault_does_not_affect_others() {
        let manager = manager_with(
            HookDefinition::fan_out("on_save"),
            &[("alpha", 0, "continue"), ("bravo", 0, "panic"), ("charlie", 0, "continue")],
        )
        .await;

        let report = manager
            .emit("on_save", json!({ "doc": 1 }))
            .await
            .unwrap()
            .into_fan_out()
            .unwrap();

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.successes().count(), 2);

        let failed: Vec<_> = report.failures().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].plugin_id, "bravo");
        assert_eq!(failed[0].status, InvocationStatus::RuntimeFault);

        let health = manager.get_health("bravo").await.unwrap();
        assert_eq!(health.runtime_faults, 1);
        assert_eq!(manager.get_health("alpha").await.unwrap().errors, 0);
    }

    #[tokio::test]
    async fn test_fan_out_runs_concurrently() {
        let manager = manager_with(
            HookDefinition::fan_out("on_tick"),
            &[("s1", 0, "slow"), ("s2", 0, "slow"), ("s3", 0, "slow")],
        )
        .await;

        let started = std::time::Instant::now();
        let outcome = manager.emit("on_tick", json!(null)).await.unwrap();
        assert_eq!(outcome.mode(), DispatchMode::FanOut);
        assert!(outcome.as_fan_out().unwrap().is_clean());
        assert!(started.elapsed() < Duration::from_millis(550));
    }
}

mod pipeline_tests {
    use super::*;

    #[tokio::test]
    async fn test_priority_orders_the_chain() {
        let manager = manager_with(
            HookDefinition::pipeline("transform"),
            &[("late", 10, "append"), ("early", -5, "append"), ("middle", 0, "append")],
        )
        .await;

        let report = manager
            .emit("transform", json!([]))
            .await
            .unwrap()
            .into_pipeline()
            .unwrap();
        assert_eq!(report.value, json!(["early", "middle", "late"]));
        assert_eq!(report.completed, vec!["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn test_abort_returns_last_good_value() {
        let manager = manager_with(
            HookDefinition::pipeline("transform"),
            &[("one", 0, "append"), ("two", 1, "fail"), ("three", 2, "append")],
        )
        .await;

        let report = manager
            .emit("transform", json!([]))
            .await
            .unwrap()
            .into_pipeline()
            .unwrap();

        assert_eq!(report.value, json!(["one"]));
        assert_eq!(report.completed, vec!["one"]);
        let failure = report.failure.clone().unwrap();
        assert_eq!(failure.plugin_id, "two");
        assert!(failure.error.to_string().contains("two refused"));
        assert!(matches!(report.into_result(), Err(TendrilError::RuntimeFault { .. })));
    }

    #[tokio::test]
    async fn test_halt_short_circuits() {
        let manager = manager_with(
            HookDefinition::pipeline("auth"),
            &[("gate", 0, "halt"), ("after", 1, "append")],
        )
        .await;

        let report = manager
            .emit("auth", json!([]))
            .await
            .unwrap()
            .into_pipeline()
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.halted_by.as_deref(), Some("gate"));
        assert_eq!(report.value, json!({ "halted_by": "gate" }));
    }

    #[tokio::test]
    async fn test_stopped_plugin_leaves_the_chain() {
        let manager = manager_with(
            HookDefinition::pipeline("transform"),
            &[("one", 0, "append"), ("two", 1, "append")],
        )
        .await;
        manager.stop("one").await.unwrap();

        let report = manager
            .emit("transform", json!([]))
            .await
            .unwrap()
            .into_pipeline()
            .unwrap();
        assert_eq!(report.value, json!(["two"]));
    }
}

mod registry_tests {
    use super::*;

    #[tokio::test]
    async fn test_undefined_hook() {
        let manager = PluginManager::new(TendrilConfig::default(), catalog())
            .await
            .unwrap();
        assert!(matches!(
            manager.emit("nowhere", json!(null)).await,
            Err(TendrilError::HookNotDefined(name)) if name == "nowhere"
        ));
    }

    #[tokio::test]
    async fn test_get_hooks_lists_subscribers() {
        let manager = manager_with(
            HookDefinition::fan_out("on_save").with_description("document saved"),
            &[("alpha", 1, "continue"), ("bravo", 0, "continue")],
        )
        .await;

        let hooks = manager.get_hooks().await;
        assert_eq!(hooks.len(), 1);
        let subscribers: Vec<&str> = hooks[0]
            .subscribers
            .iter()
            .map(|s| s.plugin_id.as_str())
            .collect();
        assert_eq!(subscribers, vec!["bravo", "alpha"]);
        assert_eq!(
            hooks[0].definition.as_ref().unwrap().description.as_deref(),
            Some("document saved")
        );
    }

    #[tokio::test]
    async fn test_in_flight_dispatch_uses_its_snapshot() {
        let dispatcher = Arc::new(HookDispatcher::new(
            HooksConfig::default(),
            Arc::new(SandboxExecutor::new()),
        ));
        dispatcher
            .register_hook(HookDefinition::fan_out("on_tick"))
            .await
            .unwrap();

        let slow = Arc::new(Scripted {
            id: "slow".to_string(),
            action: "slow".to_string(),
        });
        dispatcher
            .subscribe(
                "on_tick",
                "slow",
                0,
                slow,
                Arc::new(Sandbox::new("slow", SandboxConfig::new())),
            )
            .await
            .unwrap();

        let in_flight = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.emit("on_tick", json!(null)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let late = Arc::new(Scripted {
            id: "late".to_string(),
            action: "continue".to_string(),
        });
        dispatcher
            .subscribe(
                "on_tick",
                "late",
                0,
                late,
                Arc::new(Sandbox::new("late", SandboxConfig::new())),
            )
            .await
            .unwrap();

        let report = in_flight.await.unwrap().unwrap().into_fan_out().unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(dispatcher.subscribers("on_tick").await.len(), 2);
    }
}
