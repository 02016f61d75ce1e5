use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tendril_core::{
    DynPlugin, HookContext, HookDefinition, HookResult, InvocationStatus, Plugin, PluginCatalog,
    PluginManager, PluginManifest, ResourceLimits, Sandbox, SandboxConfig, SandboxContext,
    SandboxExecutor, TendrilConfig, TendrilError, TendrilResult,
};

struct Worker {
    action: String,
}

#[async_trait]
impl Plugin for Worker {
    async fn handle(&self, _hook: &HookContext, sandbox: &SandboxContext) -> TendrilResult<HookResult> {
        let (verb, arg) = self.action.split_once(':').unwrap_or((self.action.as_str(), ""));
        match verb {
            "sleep" => {
                let ms: u64 = arg.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            "fetch" => sandbox.check_host(arg).await?,
            "alloc" => sandbox.reserve_memory(arg.parse().unwrap_or(0)).await?,
            _ => {}
        }
        Ok(HookResult::Continue)
    }
}

fn catalog() -> PluginCatalog {
    PluginCatalog::new().with("worker", |m: &PluginManifest| -> TendrilResult<DynPlugin> {
        let action = m
            .settings
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        Ok(Arc::new(Worker { action }))
    })
}

fn manifest(id: &str, action: &str, capabilities: &str) -> PluginManifest {
    PluginManifest::parse(&format!(
        r#"
id = "{id}"
version = "1.0.0"
entry_point = "worker"
hooks = ["work"]
capabilities = [{capabilities}]

[settings]
action = "{action}"
"#
    ))
    .unwrap()
}

async fn setup(config: TendrilConfig, hook: HookDefinition) -> Arc<PluginManager> {
    let manager = PluginManager::new(config, catalog()).await.unwrap();
    manager.register_hook(hook).await.unwrap();
    manager
}

mod timeout_tests {
    use super::*;

    #[tokio::test]
    async fn test_hook_timeout_aborts_slow_handler() {
        let manager = setup(
            TendrilConfig::default(),
            HookDefinition::fan_out("work").with_timeout_ms(200),
        )
        .await;
        manager
            .install_and_start(manifest("sloth", "sleep:500", ""))
            .await
            .unwrap();

        let started = Instant::now();
        let report = manager
            .emit("work", json!(null))
            .await
            .unwrap()
            .into_fan_out()
            .unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(450), "took {elapsed:?}");

        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].status, InvocationStatus::Timeout);
        assert!(matches!(
            report.outcomes[0].result,
            Err(TendrilError::InvocationTimeout { timeout_ms: 200, .. })
        ));

        let health = manager.get_health("sloth").await.unwrap();
        assert_eq!(health.timeouts, 1);
        assert_eq!(health.errors, 1);

        let history = manager.dispatcher().get_history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, Some(InvocationStatus::Timeout));
    }

    #[tokio::test]
    async fn test_sandbox_default_timeout_applies() {
        let mut config = TendrilConfig::default();
        config.sandbox.invocation_timeout_ms = 100;
        let manager = setup(config, HookDefinition::pipeline("work")).await;
        manager
            .install_and_start(manifest("sloth", "sleep:300", ""))
            .await
            .unwrap();

        let report = manager
            .emit("work", json!(1))
            .await
            .unwrap()
            .into_pipeline()
            .unwrap();
        let failure = report.failure.unwrap();
        assert!(matches!(
            failure.error,
            TendrilError::InvocationTimeout { timeout_ms: 100, .. }
        ));
        assert_eq!(report.value, json!(1));
    }

    #[tokio::test]
    async fn test_slot_wait_counts_toward_deadline() {
        let limits = ResourceLimits {
            max_memory_mb: None,
            invocation_timeout_ms: 150,
            max_concurrent_invocations: 1,
        };
        let sandbox = Arc::new(Sandbox::new(
            "narrow",
            SandboxConfig::new().with_resource_limits(limits),
        ));
        let executor = SandboxExecutor::new();

        let work = |_ctx: SandboxContext| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, TendrilError>(())
        };
        let (first, second) = tokio::join!(
            executor.invoke(&sandbox, "first", None, work),
            executor.invoke(&sandbox, "second", None, work),
        );

        let statuses = [InvocationStatus::of(&first), InvocationStatus::of(&second)];
        assert!(statuses.contains(&InvocationStatus::Success));
        assert!(statuses.contains(&InvocationStatus::Timeout));
    }
}

mod capability_tests {
    use super::*;

    #[tokio::test]
    async fn test_undeclared_network_access_is_denied() {
        let manager = setup(TendrilConfig::default(), HookDefinition::fan_out("work")).await;
        manager
            .install_and_start(manifest("snoop", "fetch:example.com", ""))
            .await
            .unwrap();

        let report = manager
            .emit("work", json!(null))
            .await
            .unwrap()
            .into_fan_out()
            .unwrap();
        assert_eq!(report.outcomes[0].status, InvocationStatus::CapabilityDenied);
        assert!(matches!(
            &report.outcomes[0].result,
            Err(TendrilError::CapabilityDenied { plugin, capability })
                if plugin == "snoop" && capability == "network:outbound"
        ));

        let health = manager.get_health("snoop").await.unwrap();
        assert_eq!(health.capability_denials, 1);
        assert_eq!(health.errors, 0);
        assert!(!health.tripped);
    }

    #[tokio::test]
    async fn test_granted_network_access() {
        let mut config = TendrilConfig::default();
        config
            .grants
            .insert("fetcher".to_string(), vec!["network".to_string()]);
        let manager = setup(config, HookDefinition::fan_out("work")).await;
        manager
            .install_and_start(manifest("fetcher", "fetch:api.example.com", "\"network\""))
            .await
            .unwrap();

        let report = manager
            .emit("work", json!(null))
            .await
            .unwrap()
            .into_fan_out()
            .unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_ungranted_capability_blocks_install() {
        let manager = setup(TendrilConfig::default(), HookDefinition::fan_out("work")).await;
        let result = manager
            .install(manifest("greedy", "", "\"filesystem\", \"process_spawn\""))
            .await;

        match result {
            Err(TendrilError::CapabilityNotGranted { plugin, capabilities }) => {
                assert_eq!(plugin, "greedy");
                assert_eq!(capabilities.len(), 2);
            }
            other => panic!("expected CapabilityNotGranted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_memory_ceiling_is_a_fault() {
        let mut config = TendrilConfig::default();
        config.sandbox.max_memory_mb = 64;
        let manager = setup(config, HookDefinition::fan_out("work")).await;
        manager
            .install_and_start(manifest("hog", "alloc:128", ""))
            .await
            .unwrap();

        let report = manager
            .emit("work", json!(null))
            .await
            .unwrap()
            .into_fan_out()
            .unwrap();
        assert_eq!(report.outcomes[0].status, InvocationStatus::RuntimeFault);
        assert!(report.outcomes[0]
            .result
            .as_ref()
            .unwrap_err()
            .to_string()
            .contains("memory_mb"));
    }
}
