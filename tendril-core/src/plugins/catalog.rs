use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{TendrilError, TendrilResult};

use super::manifest::PluginManifest;
use super::traits::{DynPlugin, DynPluginFactory, PluginFactory};

/// Maps manifest entry points to the factories that build them.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: BTreeMap<String, DynPluginFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry_point: impl Into<String>, factory: impl PluginFactory + 'static) {
        let entry_point = entry_point.into();
        debug!(entry_point = %entry_point, "Registered plugin factory");
        self.factories.insert(entry_point, Arc::new(factory));
    }

    pub fn with(mut self, entry_point: impl Into<String>, factory: impl PluginFactory + 'static) -> Self {
        self.register(entry_point, factory);
        self
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.factories.contains_key(entry_point)
    }

    pub fn entry_points(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn instantiate(&self, manifest: &PluginManifest) -> TendrilResult<DynPlugin> {
        let factory = self.factories.get(&manifest.entry_point).ok_or_else(|| {
            TendrilError::EntryPointNotFound {
                plugin: manifest.id.clone(),
                entry_point: manifest.entry_point.clone(),
            }
        })?;
        factory.create(manifest)
    }
}

impl std::fmt::Debug for PluginCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginCatalog")
            .field("entry_points", &self.entry_points())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookContext, HookResult};
    use crate::plugins::sandbox::SandboxContext;
    use crate::plugins::traits::Plugin;
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Plugin for Noop {
        async fn handle(
            &self,
            _hook: &HookContext,
            _sandbox: &SandboxContext,
        ) -> TendrilResult<HookResult> {
            Ok(HookResult::Continue)
        }
    }

    fn manifest(entry_point: &str) -> PluginManifest {
        PluginManifest::parse(&format!(
            "id = \"noop\"\nversion = \"1.0.0\"\nentry_point = \"{}\"\n",
            entry_point
        ))
        .unwrap()
    }

    #[test]
    fn test_instantiate() {
        let catalog = PluginCatalog::new()
            .with("noop", |_m: &PluginManifest| -> TendrilResult<DynPlugin> {
                Ok(Arc::new(Noop))
            });

        assert!(catalog.contains("noop"));
        assert!(catalog.instantiate(&manifest("noop")).is_ok());
    }

    #[test]
    fn test_unknown_entry_point() {
        let catalog = PluginCatalog::new();
        match catalog.instantiate(&manifest("ghost")) {
            Err(TendrilError::EntryPointNotFound { plugin, entry_point }) => {
                assert_eq!(plugin, "noop");
                assert_eq!(entry_point, "ghost");
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected an error"),
        }
    }
}
