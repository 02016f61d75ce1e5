//! Runs plugin code inside its sandbox.
//!
//! Every invocation is spawned onto its own tokio task so that a panic, a hang
//! or an error in plugin code turns into a value for the caller. The outcome of
//! each invocation is classified and published to the registered
//! [`InvocationObserver`]s, the health monitor being the main one.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{TendrilError, TendrilResult};

use super::sandbox::{Sandbox, SandboxContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Success,
    Timeout,
    CapabilityDenied,
    RuntimeFault,
}

impl InvocationStatus {
    pub fn of<T>(result: &TendrilResult<T>) -> Self {
        match result {
            Ok(_) => InvocationStatus::Success,
            Err(TendrilError::InvocationTimeout { .. }) => InvocationStatus::Timeout,
            Err(TendrilError::CapabilityDenied { .. }) => InvocationStatus::CapabilityDenied,
            Err(_) => InvocationStatus::RuntimeFault,
        }
    }

    /// Timeouts and faults count toward a health trip; denials do not.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Timeout | InvocationStatus::RuntimeFault
        )
    }
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvocationStatus::Success => write!(f, "success"),
            InvocationStatus::Timeout => write!(f, "timeout"),
            InvocationStatus::CapabilityDenied => write!(f, "capability_denied"),
            InvocationStatus::RuntimeFault => write!(f, "runtime_fault"),
        }
    }
}

/// Hook handlers are the plugin's work; lifecycle calls (`start`, `stop`,
/// event delivery) are the host driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationKind {
    Hook,
    Lifecycle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationReport {
    pub plugin_id: String,
    pub operation: String,
    pub kind: InvocationKind,
    pub status: InvocationStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait InvocationObserver: Send + Sync {
    async fn on_invocation(&self, report: &InvocationReport);
}

pub struct SandboxExecutor {
    observers: RwLock<Vec<Arc<dyn InvocationObserver>>>,
}

impl SandboxExecutor {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_observer(&self, observer: Arc<dyn InvocationObserver>) {
        self.observers.write().await.push(observer);
    }

    /// Run `f` in `sandbox` under a wall-clock deadline.
    ///
    /// `timeout` overrides the sandbox's own invocation timeout. Waiting for a
    /// concurrency slot counts against the same deadline. A timed-out task is
    /// aborted and never retried.
    pub async fn invoke<T, F, Fut>(
        &self,
        sandbox: &Arc<Sandbox>,
        operation: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> TendrilResult<T>
    where
        F: FnOnce(SandboxContext) -> Fut,
        Fut: Future<Output = TendrilResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run(InvocationKind::Hook, sandbox, operation, timeout, f)
            .await
    }

    /// Same as [`invoke`](Self::invoke), reported as [`InvocationKind::Lifecycle`].
    pub async fn invoke_lifecycle<T, F, Fut>(
        &self,
        sandbox: &Arc<Sandbox>,
        operation: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> TendrilResult<T>
    where
        F: FnOnce(SandboxContext) -> Fut,
        Fut: Future<Output = TendrilResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run(InvocationKind::Lifecycle, sandbox, operation, timeout, f)
            .await
    }

    async fn run<T, F, Fut>(
        &self,
        kind: InvocationKind,
        sandbox: &Arc<Sandbox>,
        operation: &str,
        timeout: Option<Duration>,
        f: F,
    ) -> TendrilResult<T>
    where
        F: FnOnce(SandboxContext) -> Fut,
        Fut: Future<Output = TendrilResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let plugin_id = sandbox.plugin_id().to_string();

        if sandbox.is_closed() {
            return Err(TendrilError::RuntimeFault {
                plugin: plugin_id,
                message: format!("sandbox torn down before {}", operation),
            });
        }

        let limit = timeout.unwrap_or_else(|| Duration::from_millis(sandbox.timeout_ms()));
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + limit;
        let timed_out = || TendrilError::InvocationTimeout {
            plugin: plugin_id.clone(),
            operation: operation.to_string(),
            timeout_ms: limit.as_millis() as u64,
        };

        let result = match tokio::time::timeout_at(deadline, sandbox.acquire_slot()).await {
            Err(_) => Err(timed_out()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(_permit)) => {
                let mut handle = tokio::spawn(f(SandboxContext::new(sandbox.clone())));

                match tokio::time::timeout_at(deadline, &mut handle).await {
                    Err(_) => {
                        handle.abort();
                        Err(timed_out())
                    }
                    Ok(Err(join_err)) => Err(TendrilError::RuntimeFault {
                        plugin: plugin_id.clone(),
                        message: if join_err.is_panic() {
                            format!("panicked: {}", panic_message(join_err.into_panic()))
                        } else {
                            "task cancelled".to_string()
                        },
                    }),
                    Ok(Ok(Ok(value))) => Ok(value),
                    Ok(Ok(Err(err))) => Err(classify_plugin_error(&plugin_id, err)),
                }
            }
        };

        let report = InvocationReport {
            plugin_id: plugin_id.clone(),
            operation: operation.to_string(),
            kind,
            status: InvocationStatus::of(&result),
            duration_ms: started.elapsed().as_millis() as u64,
            error: result.as_ref().err().map(|e| e.to_string()),
            timestamp: Utc::now(),
        };

        match &result {
            Ok(_) => debug!(
                plugin_id = %plugin_id,
                operation = %operation,
                duration_ms = report.duration_ms,
                "Invocation succeeded"
            ),
            Err(e) => warn!(
                plugin_id = %plugin_id,
                operation = %operation,
                status = %report.status,
                duration_ms = report.duration_ms,
                "Invocation failed: {}",
                e
            ),
        }

        let observers = self.observers.read().await.clone();
        for observer in observers {
            observer.on_invocation(&report).await;
        }

        result
    }
}

impl Default for SandboxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Denials and timeouts keep their identity; everything else plugin code
/// returns is a runtime fault.
fn classify_plugin_error(plugin_id: &str, err: TendrilError) -> TendrilError {
    match err {
        TendrilError::CapabilityDenied { .. } | TendrilError::InvocationTimeout { .. } => err,
        other => TendrilError::RuntimeFault {
            plugin: plugin_id.to_string(),
            message: other.to_string(),
        },
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
