use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TendrilError;
use crate::plugins::InvocationStatus;

/// How a hook's subscribers are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Every subscriber runs concurrently; failures are collected.
    FanOut,
    /// Subscribers run in order, each receiving the previous output.
    Pipeline,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchMode::FanOut => write!(f, "fan_out"),
            DispatchMode::Pipeline => write!(f, "pipeline"),
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fan_out" | "fanout" | "fan-out" => Ok(DispatchMode::FanOut),
            "pipeline" => Ok(DispatchMode::Pipeline),
            other => Err(format!(
                "unknown dispatch mode '{}' (expected fan_out or pipeline)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookDefinition {
    pub name: String,
    pub mode: DispatchMode,
    /// Overrides the sandbox invocation timeout for this hook.
    pub timeout_ms: Option<u64>,
    pub description: Option<String>,
}

impl HookDefinition {
    pub fn new(name: impl Into<String>, mode: DispatchMode) -> Self {
        Self {
            name: name.into(),
            mode,
            timeout_ms: None,
            description: None,
        }
    }

    pub fn fan_out(name: impl Into<String>) -> Self {
        Self::new(name, DispatchMode::FanOut)
    }

    pub fn pipeline(name: impl Into<String>) -> Self {
        Self::new(name, DispatchMode::Pipeline)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub hook: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub correlation_id: Uuid,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl HookContext {
    pub fn new(hook: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            hook: hook.into(),
            payload,
            timestamp: Utc::now(),
            source: String::new(),
            correlation_id: Uuid::new_v4(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn with_metadata<V: Serialize>(mut self, key: impl Into<String>, value: V) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    pub fn get_metadata<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.metadata
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Same event, next pipeline stage.
    pub(crate) fn with_payload(&self, payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..self.clone()
        }
    }
}

/// What a handler returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum HookResult {
    /// Leave the value untouched.
    #[default]
    Continue,
    /// Replace the value passed to the next handler.
    Modified(serde_json::Value),
    /// Stop the pipeline with a terminal value.
    Halt(serde_json::Value),
}

impl HookResult {
    pub fn ok() -> Self {
        HookResult::Continue
    }

    pub fn modified(value: serde_json::Value) -> Self {
        HookResult::Modified(value)
    }

    pub fn halt(value: serde_json::Value) -> Self {
        HookResult::Halt(value)
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, HookResult::Continue)
    }

    pub fn is_halt(&self) -> bool {
        matches!(self, HookResult::Halt(_))
    }

    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            HookResult::Modified(v) | HookResult::Halt(v) => Some(v),
            HookResult::Continue => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookExecution {
    pub id: Uuid,
    pub hook: String,
    pub plugin_id: String,
    pub correlation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: Option<InvocationStatus>,
    pub result: Option<HookResult>,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

impl HookExecution {
    pub fn new(ctx: &HookContext, plugin_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            hook: ctx.hook.clone(),
            plugin_id: plugin_id.into(),
            correlation_id: ctx.correlation_id,
            started_at: Utc::now(),
            completed_at: None,
            status: None,
            result: None,
            error: None,
            duration_ms: None,
        }
    }

    fn finish(&mut self, status: InvocationStatus) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.status = Some(status);
    }

    pub fn complete(mut self, result: HookResult) -> Self {
        self.finish(InvocationStatus::Success);
        self.result = Some(result);
        self
    }

    pub fn fail(mut self, error: &TendrilError) -> Self {
        let status = InvocationStatus::of::<()>(&Err(error.clone()));
        self.finish(status);
        self.error = Some(error.to_string());
        self
    }

    pub fn is_successful(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    pub plugin_id: String,
    pub priority: i32,
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookInfo {
    pub name: String,
    /// `None` while plugins have subscribed but the host has not registered the hook.
    pub definition: Option<HookDefinition>,
    pub subscribers: Vec<SubscriberInfo>,
}

/// Result of one handler inside a dispatch.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub plugin_id: String,
    pub status: InvocationStatus,
    pub result: Result<HookResult, TendrilError>,
    pub duration_ms: u64,
}

impl HandlerOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct FanOutReport {
    pub hook: String,
    pub correlation_id: Uuid,
    /// One entry per invoked handler, in subscriber order.
    pub outcomes: Vec<HandlerOutcome>,
}

impl FanOutReport {
    pub fn successes(&self) -> impl Iterator<Item = &HandlerOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &HandlerOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(|o| o.is_success())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineFailure {
    pub plugin_id: String,
    pub error: TendrilError,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub hook: String,
    pub correlation_id: Uuid,
    /// The final value, or the last good value when a handler failed.
    pub value: serde_json::Value,
    pub halted_by: Option<String>,
    pub failure: Option<PipelineFailure>,
    /// Plugins that completed successfully, in order.
    pub completed: Vec<String>,
}

impl PipelineReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// The value as a result: a failed pipeline never yields its partial value as success.
    pub fn into_result(self) -> Result<serde_json::Value, TendrilError> {
        match self.failure {
            Some(failure) => Err(failure.error),
            None => Ok(self.value),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    FanOut(FanOutReport),
    Pipeline(PipelineReport),
}

impl DispatchOutcome {
    pub fn mode(&self) -> DispatchMode {
        match self {
            DispatchOutcome::FanOut(_) => DispatchMode::FanOut,
            DispatchOutcome::Pipeline(_) => DispatchMode::Pipeline,
        }
    }

    pub fn as_fan_out(&self) -> Option<&FanOutReport> {
        match self {
            DispatchOutcome::FanOut(report) => Some(report),
            _ => None,
        }
    }

    pub fn as_pipeline(&self) -> Option<&PipelineReport> {
        match self {
            DispatchOutcome::Pipeline(report) => Some(report),
            _ => None,
        }
    }

    pub fn into_pipeline(self) -> Option<PipelineReport> {
        match self {
            DispatchOutcome::Pipeline(report) => Some(report),
            _ => None,
        }
    }

    pub fn into_fan_out(self) -> Option<FanOutReport> {
        match self {
            DispatchOutcome::FanOut(report) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_mode_parse() {
        assert_eq!("fanout".parse::<DispatchMode>().unwrap(), DispatchMode::FanOut);
        assert_eq!("fan-out".parse::<DispatchMode>().unwrap(), DispatchMode::FanOut);
        assert_eq!(
            "Pipeline".parse::<DispatchMode>().unwrap(),
            DispatchMode::Pipeline
        );
        assert!("broadcast".parse::<DispatchMode>().is_err());
        assert_eq!(DispatchMode::FanOut.to_string(), "fan_out");
    }

    #[test]
    fn test_hook_context_builder() {
        let ctx = HookContext::new("on_request", json!({"path": "/"}))
            .with_source("router")
            .with_metadata("attempt", 2);

        assert_eq!(ctx.source, "router");
        assert_eq!(ctx.get_metadata::<i32>("attempt"), Some(2));

        let next = ctx.with_payload(json!({"path": "/home"}));
        assert_eq!(next.correlation_id, ctx.correlation_id);
        assert_eq!(next.payload["path"], "/home");
    }

    #[test]
    fn test_hook_result_serde() {
        let halted = HookResult::halt(json!(7));
        let encoded = serde_json::to_value(&halted).unwrap();
        assert_eq!(encoded, json!({"action": "halt", "value": 7}));
        assert_eq!(halted.value(), Some(&json!(7)));
        assert!(HookResult::default().is_continue());
    }

    #[test]
    fn test_execution_tracking() {
        let ctx = HookContext::new("on_request", json!(null));
        let ok = HookExecution::new(&ctx, "auth").complete(HookResult::Continue);
        assert!(ok.is_successful());
        assert_eq!(ok.status, Some(InvocationStatus::Success));

        let failed = HookExecution::new(&ctx, "auth").fail(&TendrilError::InvocationTimeout {
            plugin: "auth".to_string(),
            operation: "hook:on_request".to_string(),
            timeout_ms: 10,
        });
        assert!(!failed.is_successful());
        assert_eq!(failed.status, Some(InvocationStatus::Timeout));
    }

    #[test]
    fn test_pipeline_report_into_result() {
        let report = PipelineReport {
            hook: "render".to_string(),
            correlation_id: Uuid::new_v4(),
            value: json!("partial"),
            halted_by: None,
            failure: Some(PipelineFailure {
                plugin_id: "b".to_string(),
                error: TendrilError::plugin("bad"),
            }),
            completed: vec!["a".to_string()],
        };
        assert!(!report.is_success());
        assert!(report.into_result().is_err());
    }
}
