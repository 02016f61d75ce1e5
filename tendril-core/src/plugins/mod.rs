mod catalog;
mod discovery;
mod executor;
mod health;
mod lifecycle;
mod manager;
mod manifest;
mod resolver;
mod sandbox;
mod traits;
mod types;
mod version;

pub use catalog::PluginCatalog;
pub use discovery::{DiscoveredPlugin, PluginDiscovery, MANIFEST_FILENAMES};
pub use executor::{
    InvocationKind, InvocationObserver, InvocationReport, InvocationStatus, SandboxExecutor,
};
pub use health::{HealthMonitor, HealthRecord, TripNotice};
pub use lifecycle::{PluginInstance, PluginState};
pub use manager::PluginManager;

pub use manifest::{
    Dependency, DependencyKind, HookDeclaration, ManifestViolation, PluginManifest, RawDependency,
    RawHookDeclaration, RawManifest,
};

pub use resolver::{resolve, DependencyGraph, Resolution};

pub use sandbox::{
    AccessViolation, Capability, CapabilityGrants, ResourceLimits, ResourceUsage, Sandbox,
    SandboxConfig, SandboxContext,
};

pub use traits::{DynPlugin, DynPluginFactory, Plugin, PluginFactory};

pub use types::{PluginConfig, PluginContext, PluginEvent, PluginSummary, SubscriptionRequest};

pub use version::{version_satisfies, Version, VersionReq};
