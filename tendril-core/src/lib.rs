#![allow(clippy::type_complexity, clippy::new_without_default)]

pub mod config;
pub mod error;
pub mod hooks;
pub mod plugins;

pub use config::{
    ensure_config_dir, get_config_dir, ConfigLoadError, HealthConfig, HooksConfig, LoggingConfig,
    PluginsConfig, SandboxLimitsConfig, TendrilConfig,
};
pub use error::{CliErrorDisplay, ErrorContext, TendrilError, TendrilResult};
pub use hooks::{
    DispatchMode, DispatchOutcome, FanOutReport, HandlerOutcome, HookContext, HookDefinition,
    HookDispatcher, HookExecution, HookInfo, HookResult, PipelineFailure, PipelineReport,
    SubscriberInfo,
};
pub use plugins::{
    resolve, version_satisfies, AccessViolation, Capability, CapabilityGrants, Dependency,
    DependencyGraph, DependencyKind, DiscoveredPlugin, DynPlugin, DynPluginFactory, HealthMonitor,
    HealthRecord, HookDeclaration, InvocationKind, InvocationObserver, InvocationReport,
    InvocationStatus, ManifestViolation, Plugin, PluginCatalog, PluginConfig, PluginContext,
    PluginDiscovery, PluginEvent, PluginFactory, PluginInstance, PluginManager, PluginManifest,
    PluginState, PluginSummary, RawManifest, Resolution, ResourceLimits, ResourceUsage, Sandbox,
    SandboxConfig, SandboxContext, SandboxExecutor, SubscriptionRequest, TripNotice, Version,
    VersionReq,
};
