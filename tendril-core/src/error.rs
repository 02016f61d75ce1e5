//! Error types for the Tendril core library.
//!
//! Every management operation and every sandboxed invocation reports failures
//! through [`TendrilError`]. Variants carry the plugin, dependency, capability or
//! hook involved so an operator can act on the error without consulting logs.
//!
//! # Error Codes Reference
//!
//! | Code Range | Category | Description |
//! |------------|----------|-------------|
//! | E1001-E1099 | Manifest | Parse failures, validation violations, ungranted capabilities |
//! | E2001-E2099 | Resolution | Cycles, missing dependencies, version mismatches |
//! | E3001-E3099 | Lifecycle | Unknown plugins, illegal transitions, in-use plugins, coordinator failure |
//! | E4001-E4099 | Sandbox | Capability denials, timeouts, runtime faults, resource ceilings |
//! | E5001-E5099 | Hook | Hook definition and subscription errors |
//! | E6001-E6099 | Config | Configuration parse and validation errors |
//! | E9001-E9099 | General | Internal, IO and serialization errors |

use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::plugins::{ManifestViolation, PluginState};

/// Context information for error tracking and debugging.
///
/// Captures the location where an error occurred along with an optional
/// operation description.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// File where the error occurred
    pub file: &'static str,
    /// Line number where the error occurred
    pub line: u32,
    /// Column number where the error occurred
    pub column: u32,
    /// Optional description of the operation being performed
    pub operation: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with the given location.
    pub fn new(file: &'static str, line: u32, column: u32) -> Self {
        Self {
            file,
            line,
            column,
            operation: None,
        }
    }

    /// Add an operation description to the context.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)?;
        if let Some(ref op) = self.operation {
            write!(f, " ({})", op)?;
        }
        Ok(())
    }
}

/// Macro to create an ErrorContext at the current source location.
#[macro_export]
macro_rules! error_context {
    () => {
        $crate::error::ErrorContext::new(file!(), line!(), column!())
    };
    ($op:expr) => {
        $crate::error::ErrorContext::new(file!(), line!(), column!()).with_operation($op)
    };
}

fn join_violations(violations: &[ManifestViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// The main error type for the Tendril core library.
#[derive(Debug, Clone, Error)]
pub enum TendrilError {
    // ========================================================================
    // Manifest Errors (E1001-E1099)
    // ========================================================================
    /// The manifest document could not be parsed at all
    #[error("[E1001] Failed to parse manifest from {origin}: {message}")]
    ManifestParse { origin: String, message: String },

    /// The manifest parsed but violates one or more rules
    #[error(
        "[E1002] Invalid manifest for '{plugin}' ({} violation(s)): {}",
        .violations.len(),
        join_violations(.violations)
    )]
    ManifestInvalid {
        plugin: String,
        violations: Vec<ManifestViolation>,
    },

    /// The host does not grant a capability the manifest requires
    #[error("[E1003] Plugin '{plugin}' requires capabilities not granted by the host: {}", .capabilities.join(", "))]
    CapabilityNotGranted {
        plugin: String,
        capabilities: Vec<String>,
    },

    // ========================================================================
    // Resolution Errors (E2001-E2099)
    // ========================================================================
    /// The dependency graph contains a cycle
    #[error("[E2001] Cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A hard dependency is not installed
    #[error("[E2002] Plugin '{plugin}' depends on '{dependency}' ({requirement}) which is not installed")]
    MissingDependency {
        plugin: String,
        dependency: String,
        requirement: String,
    },

    /// A dependency is installed at a version outside the requested range
    #[error("[E2003] Plugin '{plugin}' requires '{dependency}' {requirement}, found {found}")]
    VersionMismatch {
        plugin: String,
        dependency: String,
        requirement: String,
        found: String,
    },

    /// A hard dependency failed its own resolution
    #[error("[E2004] Plugin '{plugin}' cannot be resolved because dependency '{dependency}' failed")]
    DependencyFailed { plugin: String, dependency: String },

    // ========================================================================
    // Lifecycle Errors (E3001-E3099)
    // ========================================================================
    /// Plugin not installed
    #[error("[E3001] Plugin not found: {0}")]
    PluginNotFound(String),

    /// A plugin with the same id is already installed
    #[error("[E3002] Plugin already installed: {0}")]
    PluginAlreadyInstalled(String),

    /// The lifecycle state machine rejected a transition
    #[error("[E3003] Plugin '{plugin}' cannot move from {from} to {to}")]
    InvalidStateTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    /// Running plugins hold a hard dependency on the target
    #[error("[E3004] Plugin '{plugin}' is in use by running plugins: {}", .dependents.join(", "))]
    PluginInUse {
        plugin: String,
        dependents: Vec<String>,
    },

    /// No factory is registered for the manifest entry point
    #[error("[E3005] Plugin '{plugin}' has unknown entry point '{entry_point}'")]
    EntryPointNotFound { plugin: String, entry_point: String },

    /// The plugin failed during its start sequence
    #[error("[E3006] Failed to start plugin '{plugin}': {message}")]
    PluginStartFailed { plugin: String, message: String },

    /// The coordinating lock could not be acquired; the runtime must be restarted
    #[error("[E3007] Lifecycle coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    // ========================================================================
    // Sandbox Errors (E4001-E4099)
    // ========================================================================
    /// A privileged operation was attempted without the capability
    #[error("[E4001] Plugin '{plugin}' was denied capability: {capability}")]
    CapabilityDenied { plugin: String, capability: String },

    /// The invocation exceeded its wall-clock deadline and was aborted
    #[error("[E4002] Plugin '{plugin}' timed out during {operation} after {timeout_ms} ms")]
    InvocationTimeout {
        plugin: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Plugin code failed or panicked
    #[error("[E4003] Plugin '{plugin}' faulted: {message}")]
    RuntimeFault { plugin: String, message: String },

    /// A sandbox resource ceiling was hit
    #[error("[E4004] Plugin '{plugin}' exceeded {resource} limit: requested {requested}, limit {limit}")]
    ResourceLimitExceeded {
        plugin: String,
        resource: String,
        limit: u64,
        requested: u64,
    },

    /// Error raised by plugin code itself
    #[error("[E4005] Plugin error: {0}")]
    PluginError(String),

    // ========================================================================
    // Hook Errors (E5001-E5099)
    // ========================================================================
    /// Emit or lookup on a hook the host never registered
    #[error("[E5001] Hook not defined: {0}")]
    HookNotDefined(String),

    /// The hook is already registered with a different dispatch mode
    #[error("[E5002] Hook already defined with a different mode: {0}")]
    HookAlreadyDefined(String),

    /// A plugin may register at most one handler per hook
    #[error("[E5003] Plugin '{plugin}' already has a handler for hook '{hook}'")]
    DuplicateHandler { hook: String, plugin: String },

    /// A plugin subscribed to a hook its manifest does not declare
    #[error("[E5004] Plugin '{plugin}' did not declare hook '{hook}' in its manifest")]
    UndeclaredHook { hook: String, plugin: String },

    /// No handler registered for that plugin and hook
    #[error("[E5005] No handler for hook '{hook}' from plugin '{plugin}'")]
    HandlerNotFound { hook: String, plugin: String },

    /// The per-hook subscriber ceiling was reached
    #[error("[E5006] Maximum handlers ({max}) reached for hook '{hook}'")]
    HookHandlerLimit { hook: String, max: usize },

    // ========================================================================
    // Config Errors (E6001-E6099)
    // ========================================================================
    /// Failed to parse configuration
    #[error("[E6001] Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Invalid configuration value
    #[error("[E6002] Invalid configuration value for '{key}': {message}")]
    InvalidConfigValue { key: String, message: String },

    // ========================================================================
    // General Errors (E9001-E9099)
    // ========================================================================
    /// Internal error (unexpected state)
    #[error("[E9001] Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("[E9002] IO error: {0}")]
    Io(String),

    /// Serialization error
    #[error("[E9003] Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for Tendril operations.
pub type TendrilResult<T> = Result<T, TendrilError>;

// ============================================================================
// From trait implementations for seamless error propagation
// ============================================================================

impl From<serde_json::Error> for TendrilError {
    fn from(err: serde_json::Error) -> Self {
        TendrilError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for TendrilError {
    fn from(err: std::io::Error) -> Self {
        TendrilError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for TendrilError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(key) => TendrilError::InvalidConfigValue {
                key,
                message: "Key not found".to_string(),
            },
            config::ConfigError::FileParse { uri, cause } => TendrilError::ConfigParse(format!(
                "Failed to parse {}: {}",
                uri.unwrap_or_default(),
                cause
            )),
            config::ConfigError::Type {
                origin,
                unexpected,
                expected,
                key,
            } => TendrilError::InvalidConfigValue {
                key: key.unwrap_or_else(|| origin.map(|o| o.to_string()).unwrap_or_default()),
                message: format!("Expected {}, got {}", expected, unexpected),
            },
            _ => TendrilError::ConfigParse(err.to_string()),
        }
    }
}

// ============================================================================
// Error categorization helpers
// ============================================================================

impl TendrilError {
    /// Create an error from plugin code.
    pub fn plugin(message: impl Into<String>) -> Self {
        TendrilError::PluginError(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        TendrilError::Internal(message.into())
    }

    /// The only unrecoverable condition: the coordinating lock is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TendrilError::CoordinatorUnavailable(_))
    }

    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// Returns true if the plugin was rejected before it could load.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            TendrilError::ManifestParse { .. }
                | TendrilError::ManifestInvalid { .. }
                | TendrilError::CapabilityNotGranted { .. }
        )
    }

    /// Returns true if this error came out of dependency resolution.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            TendrilError::CyclicDependency { .. }
                | TendrilError::MissingDependency { .. }
                | TendrilError::VersionMismatch { .. }
                | TendrilError::DependencyFailed { .. }
        )
    }

    /// Returns true if this error is a contained sandbox invocation failure.
    pub fn is_invocation_error(&self) -> bool {
        matches!(
            self,
            TendrilError::CapabilityDenied { .. }
                | TendrilError::InvocationTimeout { .. }
                | TendrilError::RuntimeFault { .. }
                | TendrilError::ResourceLimitExceeded { .. }
        )
    }

    /// Returns true if this error is related to hook operations.
    pub fn is_hook_error(&self) -> bool {
        matches!(
            self,
            TendrilError::HookNotDefined(_)
                | TendrilError::HookAlreadyDefined(_)
                | TendrilError::DuplicateHandler { .. }
                | TendrilError::UndeclaredHook { .. }
                | TendrilError::HandlerNotFound { .. }
                | TendrilError::HookHandlerLimit { .. }
        )
    }

    /// Returns true if this error is related to configuration.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            TendrilError::ConfigParse(_) | TendrilError::InvalidConfigValue { .. }
        )
    }

    /// The plugin this error is about, when there is one.
    pub fn plugin_id(&self) -> Option<&str> {
        match self {
            TendrilError::ManifestInvalid { plugin, .. }
            | TendrilError::CapabilityNotGranted { plugin, .. }
            | TendrilError::MissingDependency { plugin, .. }
            | TendrilError::VersionMismatch { plugin, .. }
            | TendrilError::DependencyFailed { plugin, .. }
            | TendrilError::InvalidStateTransition { plugin, .. }
            | TendrilError::PluginInUse { plugin, .. }
            | TendrilError::EntryPointNotFound { plugin, .. }
            | TendrilError::PluginStartFailed { plugin, .. }
            | TendrilError::CapabilityDenied { plugin, .. }
            | TendrilError::InvocationTimeout { plugin, .. }
            | TendrilError::RuntimeFault { plugin, .. }
            | TendrilError::ResourceLimitExceeded { plugin, .. }
            | TendrilError::DuplicateHandler { plugin, .. }
            | TendrilError::UndeclaredHook { plugin, .. }
            | TendrilError::HandlerNotFound { plugin, .. } => Some(plugin),
            TendrilError::PluginNotFound(id) | TendrilError::PluginAlreadyInstalled(id) => {
                Some(id)
            }
            _ => None,
        }
    }

    /// Returns an error code suitable for logging or external reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            TendrilError::ManifestParse { .. } => "E1001",
            TendrilError::ManifestInvalid { .. } => "E1002",
            TendrilError::CapabilityNotGranted { .. } => "E1003",
            TendrilError::CyclicDependency { .. } => "E2001",
            TendrilError::MissingDependency { .. } => "E2002",
            TendrilError::VersionMismatch { .. } => "E2003",
            TendrilError::DependencyFailed { .. } => "E2004",
            TendrilError::PluginNotFound(_) => "E3001",
            TendrilError::PluginAlreadyInstalled(_) => "E3002",
            TendrilError::InvalidStateTransition { .. } => "E3003",
            TendrilError::PluginInUse { .. } => "E3004",
            TendrilError::EntryPointNotFound { .. } => "E3005",
            TendrilError::PluginStartFailed { .. } => "E3006",
            TendrilError::CoordinatorUnavailable(_) => "E3007",
            TendrilError::CapabilityDenied { .. } => "E4001",
            TendrilError::InvocationTimeout { .. } => "E4002",
            TendrilError::RuntimeFault { .. } => "E4003",
            TendrilError::ResourceLimitExceeded { .. } => "E4004",
            TendrilError::PluginError(_) => "E4005",
            TendrilError::HookNotDefined(_) => "E5001",
            TendrilError::HookAlreadyDefined(_) => "E5002",
            TendrilError::DuplicateHandler { .. } => "E5003",
            TendrilError::UndeclaredHook { .. } => "E5004",
            TendrilError::HandlerNotFound { .. } => "E5005",
            TendrilError::HookHandlerLimit { .. } => "E5006",
            TendrilError::ConfigParse(_) => "E6001",
            TendrilError::InvalidConfigValue { .. } => "E6002",
            TendrilError::Internal(_) => "E9001",
            TendrilError::Io(_) => "E9002",
            TendrilError::Serialization(_) => "E9003",
        }
    }

    /// Returns a user-friendly suggestion for how to resolve this error.
    pub fn user_suggestion(&self) -> Option<&'static str> {
        match self {
            TendrilError::ManifestInvalid { .. } => {
                Some("Fix every listed violation in the plugin manifest and install again")
            }
            TendrilError::CapabilityNotGranted { .. } => {
                Some("Grant the capability under [grants] in the host configuration")
            }
            TendrilError::CyclicDependency { .. } => {
                Some("Remove one dependency edge from the reported cycle")
            }
            TendrilError::MissingDependency { .. } => {
                Some("Install the missing dependency before starting this plugin")
            }
            TendrilError::VersionMismatch { .. } => {
                Some("Install a dependency version within the requested range")
            }
            TendrilError::PluginInUse { .. } => {
                Some("Stop the dependent plugins first, then retry the uninstall")
            }
            TendrilError::EntryPointNotFound { .. } => {
                Some("Register a factory for the entry point in the plugin catalog")
            }
            TendrilError::CoordinatorUnavailable(_) => {
                Some("The plugin runtime is wedged; restart the host process")
            }
            TendrilError::HookNotDefined(_) => {
                Some("Register the hook with register_hook before emitting it")
            }
            _ => None,
        }
    }

    /// Log this error with appropriate severity level.
    pub fn log(&self) {
        let code = self.error_code();
        let suggestion = self.user_suggestion();

        if self.is_fatal() {
            error!(
                error_code = %code,
                suggestion = suggestion,
                "Fatal runtime error: {}",
                self
            );
        } else {
            warn!(
                error_code = %code,
                suggestion = suggestion,
                "Error occurred: {}",
                self
            );
        }
    }

    /// Log this error with context information.
    pub fn log_with_context(&self, context: &ErrorContext) {
        let code = self.error_code();
        let suggestion = self.user_suggestion();

        if self.is_fatal() {
            error!(
                error_code = %code,
                location = %context,
                suggestion = suggestion,
                "Fatal runtime error at {}: {}",
                context,
                self
            );
        } else {
            warn!(
                error_code = %code,
                location = %context,
                suggestion = suggestion,
                "Error at {}: {}",
                context,
                self
            );
        }
    }
}

// ============================================================================
// User-friendly error formatting for CLI
// ============================================================================

/// Format an error for CLI display with suggestions.
pub struct CliErrorDisplay<'a> {
    error: &'a TendrilError,
    show_suggestion: bool,
}

impl<'a> CliErrorDisplay<'a> {
    pub fn new(error: &'a TendrilError) -> Self {
        Self {
            error,
            show_suggestion: true,
        }
    }

    pub fn without_suggestion(mut self) -> Self {
        self.show_suggestion = false;
        self
    }
}

impl<'a> fmt::Display for CliErrorDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let TendrilError::ManifestInvalid { plugin, violations } = self.error {
            writeln!(
                f,
                "[{}] Invalid manifest for '{}':",
                self.error.error_code(),
                plugin
            )?;
            for violation in violations {
                writeln!(f, "  - {}", violation)?;
            }
        } else {
            writeln!(f, "{}", self.error)?;
        }

        if self.show_suggestion {
            if let Some(suggestion) = self.error.user_suggestion() {
                writeln!(f)?;
                writeln!(f, "  Suggestion: {}", suggestion)?;
            }
        }

        Ok(())
    }
}
