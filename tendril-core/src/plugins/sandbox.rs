use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::{RwLock, Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::config::SandboxLimitsConfig;
use crate::error::{TendrilError, TendrilResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Filesystem,
    FilesystemRead,
    FilesystemWrite,
    Network,
    NetworkOutbound,
    NetworkInbound,
    Environment,
    ProcessSpawn,
    All,
}

impl Capability {
    pub fn implies(&self, other: &Capability) -> bool {
        match self {
            Capability::All => true,
            Capability::Filesystem => matches!(
                other,
                Capability::Filesystem | Capability::FilesystemRead | Capability::FilesystemWrite
            ),
            Capability::Network => matches!(
                other,
                Capability::Network | Capability::NetworkOutbound | Capability::NetworkInbound
            ),
            _ => self == other,
        }
    }

    pub fn all_tags() -> &'static [&'static str] {
        &[
            "filesystem",
            "filesystem:read",
            "filesystem:write",
            "network",
            "network:outbound",
            "network:inbound",
            "environment",
            "process_spawn",
            "all",
        ]
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Filesystem => write!(f, "filesystem"),
            Capability::FilesystemRead => write!(f, "filesystem:read"),
            Capability::FilesystemWrite => write!(f, "filesystem:write"),
            Capability::Network => write!(f, "network"),
            Capability::NetworkOutbound => write!(f, "network:outbound"),
            Capability::NetworkInbound => write!(f, "network:inbound"),
            Capability::Environment => write!(f, "environment"),
            Capability::ProcessSpawn => write!(f, "process_spawn"),
            Capability::All => write!(f, "all"),
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "filesystem" => Ok(Capability::Filesystem),
            "filesystem:read" => Ok(Capability::FilesystemRead),
            "filesystem:write" => Ok(Capability::FilesystemWrite),
            "network" => Ok(Capability::Network),
            "network:outbound" => Ok(Capability::NetworkOutbound),
            "network:inbound" => Ok(Capability::NetworkInbound),
            "environment" => Ok(Capability::Environment),
            "process_spawn" => Ok(Capability::ProcessSpawn),
            "all" => Ok(Capability::All),
            other => Err(format!(
                "unknown capability '{}' (expected one of: {})",
                other,
                Capability::all_tags().join(", ")
            )),
        }
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Capability::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

/// Host-side capability grants. Per-plugin entries extend the default set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityGrants {
    pub default: BTreeSet<Capability>,
    pub plugins: BTreeMap<String, BTreeSet<Capability>>,
}

impl CapabilityGrants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[grants]` config table; the `default` key is the base set.
    pub fn from_config(table: &BTreeMap<String, Vec<String>>) -> TendrilResult<Self> {
        let mut grants = Self::new();
        for (key, tags) in table {
            let mut caps = BTreeSet::new();
            for tag in tags {
                let cap = Capability::from_str(tag).map_err(|message| {
                    TendrilError::InvalidConfigValue {
                        key: format!("grants.{}", key),
                        message,
                    }
                })?;
                caps.insert(cap);
            }
            if key == "default" {
                grants.default = caps;
            } else {
                grants.plugins.insert(key.clone(), caps);
            }
        }
        Ok(grants)
    }

    pub fn with_default(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.default.extend(caps);
        self
    }

    pub fn grant(
        mut self,
        plugin_id: impl Into<String>,
        caps: impl IntoIterator<Item = Capability>,
    ) -> Self {
        self.plugins.entry(plugin_id.into()).or_default().extend(caps);
        self
    }

    pub fn allows(&self, plugin_id: &str, capability: Capability) -> bool {
        self.default.iter().any(|g| g.implies(&capability))
            || self
                .plugins
                .get(plugin_id)
                .is_some_and(|set| set.iter().any(|g| g.implies(&capability)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<u64>,
    pub invocation_timeout_ms: u64,
    pub max_concurrent_invocations: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from(&SandboxLimitsConfig::default())
    }
}

impl From<&SandboxLimitsConfig> for ResourceLimits {
    fn from(config: &SandboxLimitsConfig) -> Self {
        Self {
            max_memory_mb: Some(config.max_memory_mb),
            invocation_timeout_ms: config.invocation_timeout_ms,
            max_concurrent_invocations: config.max_concurrent_invocations.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub capabilities: BTreeSet<Capability>,
    pub allowed_paths: Vec<PathBuf>,
    pub denied_paths: Vec<PathBuf>,
    pub allowed_hosts: Vec<String>,
    pub denied_hosts: Vec<String>,
    pub resource_limits: ResourceLimits,
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self {
            capabilities: BTreeSet::new(),
            allowed_paths: Vec::new(),
            denied_paths: Vec::new(),
            allowed_hosts: Vec::new(),
            denied_hosts: Vec::new(),
            resource_limits: ResourceLimits::default(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    pub fn with_allowed_path(mut self, path: PathBuf) -> Self {
        self.allowed_paths.push(path);
        self
    }

    pub fn with_denied_path(mut self, path: PathBuf) -> Self {
        self.denied_paths.push(path);
        self
    }

    pub fn with_allowed_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.push(host.into());
        self
    }

    pub fn with_denied_host(mut self, host: impl Into<String>) -> Self {
        self.denied_hosts.push(host.into());
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.resource_limits.invocation_timeout_ms = timeout_ms;
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessViolation {
    pub capability: Capability,
    pub requested_resource: String,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl AccessViolation {
    pub fn new(capability: Capability, requested_resource: String, message: String) -> Self {
        Self {
            capability,
            requested_resource,
            message,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub current_memory_mb: u64,
    pub peak_memory_mb: u64,
}

/// Isolated execution context owned by one running plugin.
pub struct Sandbox {
    plugin_id: String,
    config: SandboxConfig,
    violations: RwLock<Vec<AccessViolation>>,
    resource_usage: RwLock<ResourceUsage>,
    slots: Semaphore,
    closed: AtomicBool,
}

impl Sandbox {
    pub fn new(plugin_id: impl Into<String>, config: SandboxConfig) -> Self {
        let slots = config.resource_limits.max_concurrent_invocations.max(1) as usize;
        Self {
            plugin_id: plugin_id.into(),
            config,
            violations: RwLock::new(Vec::new()),
            resource_usage: RwLock::new(ResourceUsage::default()),
            slots: Semaphore::new(slots),
            closed: AtomicBool::new(false),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn timeout_ms(&self) -> u64 {
        self.config.resource_limits.invocation_timeout_ms
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.config
            .capabilities
            .iter()
            .any(|granted| granted.implies(&capability))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear down: no further invocations are admitted.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.slots.close();
            debug!(plugin_id = %self.plugin_id, "Sandbox closed");
        }
    }

    pub(crate) async fn acquire_slot(&self) -> TendrilResult<SemaphorePermit<'_>> {
        self.slots.acquire().await.map_err(|_| TendrilError::RuntimeFault {
            plugin: self.plugin_id.clone(),
            message: "sandbox has been torn down".to_string(),
        })
    }

    fn denied(&self, capability: Capability) -> TendrilError {
        TendrilError::CapabilityDenied {
            plugin: self.plugin_id.clone(),
            capability: capability.to_string(),
        }
    }

    async fn deny(
        &self,
        capability: Capability,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> TendrilError {
        self.record_violation(AccessViolation::new(
            capability,
            resource.into(),
            message.into(),
        ))
        .await;
        self.denied(capability)
    }

    pub async fn check_capability(&self, capability: Capability) -> TendrilResult<()> {
        if self.has_capability(capability) {
            Ok(())
        } else {
            Err(self
                .deny(capability, capability.to_string(), "capability not granted")
                .await)
        }
    }

    pub async fn check_path_access(&self, path: &Path, write: bool) -> TendrilResult<()> {
        let capability = if write {
            Capability::FilesystemWrite
        } else {
            Capability::FilesystemRead
        };

        self.check_capability(capability).await?;

        let canonical_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        let display = path.display().to_string();

        if self
            .config
            .denied_paths
            .iter()
            .any(|denied| canonical_path.starts_with(denied))
        {
            return Err(self.deny(capability, display, "path is denied").await);
        }

        if self.config.allowed_paths.is_empty()
            || self
                .config
                .allowed_paths
                .iter()
                .any(|allowed| canonical_path.starts_with(allowed))
        {
            return Ok(());
        }

        Err(self
            .deny(capability, display, "path not in allowed list")
            .await)
    }

    pub async fn check_network_access(&self, host: &str, outbound: bool) -> TendrilResult<()> {
        let capability = if outbound {
            Capability::NetworkOutbound
        } else {
            Capability::NetworkInbound
        };

        self.check_capability(capability).await?;

        let matches = |pattern: &String| host == pattern || host.ends_with(&format!(".{}", pattern));

        if self.config.denied_hosts.iter().any(matches) {
            return Err(self.deny(capability, host, "host is denied").await);
        }

        if self.config.allowed_hosts.is_empty() || self.config.allowed_hosts.iter().any(matches) {
            return Ok(());
        }

        Err(self
            .deny(capability, host, "host not in allowed list")
            .await)
    }

    pub async fn reserve_memory(&self, mb: u64) -> TendrilResult<()> {
        let mut usage = self.resource_usage.write().await;
        let ceiling = self.config.resource_limits.max_memory_mb;
        let Some(requested) = usage.current_memory_mb.checked_add(mb) else {
            return Err(TendrilError::ResourceLimitExceeded {
                plugin: self.plugin_id.clone(),
                resource: "memory_mb".to_string(),
                limit: ceiling.unwrap_or(u64::MAX),
                requested: u64::MAX,
            });
        };
        if let Some(limit) = ceiling {
            if requested > limit {
                warn!(
                    plugin_id = %self.plugin_id,
                    requested_mb = requested,
                    limit_mb = limit,
                    "Memory ceiling reached"
                );
                return Err(TendrilError::ResourceLimitExceeded {
                    plugin: self.plugin_id.clone(),
                    resource: "memory_mb".to_string(),
                    limit,
                    requested,
                });
            }
        }
        usage.current_memory_mb = requested;
        usage.peak_memory_mb = usage.peak_memory_mb.max(requested);
        Ok(())
    }

    pub async fn release_memory(&self, mb: u64) {
        let mut usage = self.resource_usage.write().await;
        usage.current_memory_mb = usage.current_memory_mb.saturating_sub(mb);
    }

    pub async fn get_resource_usage(&self) -> ResourceUsage {
        self.resource_usage.read().await.clone()
    }

    pub async fn record_violation(&self, violation: AccessViolation) {
        warn!(
            plugin_id = %self.plugin_id,
            capability = %violation.capability,
            resource = %violation.requested_resource,
            "Access violation: {}",
            violation.message
        );
        self.violations.write().await.push(violation);
    }

    pub async fn get_violations(&self) -> Vec<AccessViolation> {
        self.violations.read().await.clone()
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("plugin_id", &self.plugin_id)
            .field("capabilities", &self.config.capabilities)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The only handle plugin code receives for privileged operations.
#[derive(Debug, Clone)]
pub struct SandboxContext {
    sandbox: Arc<Sandbox>,
}

impl SandboxContext {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }

    pub fn plugin_id(&self) -> &str {
        self.sandbox.plugin_id()
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.sandbox.has_capability(capability)
    }

    pub async fn require(&self, capability: Capability) -> TendrilResult<()> {
        self.sandbox.check_capability(capability).await
    }

    pub async fn check_path(&self, path: &Path, write: bool) -> TendrilResult<()> {
        self.sandbox.check_path_access(path, write).await
    }

    pub async fn check_host(&self, host: &str) -> TendrilResult<()> {
        self.sandbox.check_network_access(host, true).await
    }

    pub async fn reserve_memory(&self, mb: u64) -> TendrilResult<()> {
        self.sandbox.reserve_memory(mb).await
    }

    pub async fn release_memory(&self, mb: u64) {
        self.sandbox.release_memory(mb).await
    }

    pub async fn read_env(&self, key: &str) -> TendrilResult<Option<String>> {
        self.require(Capability::Environment).await?;
        Ok(std::env::var(key).ok())
    }

    pub async fn read_to_string(&self, path: &Path) -> TendrilResult<String> {
        self.check_path(path, false).await?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    pub async fn write(&self, path: &Path, contents: impl AsRef<[u8]>) -> TendrilResult<()> {
        self.check_path(path, true).await?;
        Ok(tokio::fs::write(path, contents).await?)
    }

    pub async fn violations(&self) -> Vec<AccessViolation> {
        self.sandbox.get_violations().await
    }
}
