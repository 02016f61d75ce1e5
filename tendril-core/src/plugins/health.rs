use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::config::HealthConfig;

use super::executor::{InvocationKind, InvocationObserver, InvocationReport, InvocationStatus};

/// Rolling per-plugin counters kept by the [`HealthMonitor`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub plugin_id: String,
    pub invocations: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub runtime_faults: u64,
    pub capability_denials: u64,
    pub total_execution_ms: u64,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub tripped: bool,
    pub tripped_at: Option<DateTime<Utc>>,
    /// Errors currently inside the sliding window.
    pub errors_in_window: usize,
    #[serde(skip)]
    recent_errors: VecDeque<Instant>,
}

impl HealthRecord {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            invocations: 0,
            successes: 0,
            errors: 0,
            timeouts: 0,
            runtime_faults: 0,
            capability_denials: 0,
            total_execution_ms: 0,
            last_error_at: None,
            last_error: None,
            tripped: false,
            tripped_at: None,
            errors_in_window: 0,
            recent_errors: VecDeque::new(),
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            self.errors as f64 / self.invocations as f64
        }
    }

    pub fn avg_execution_ms(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            self.total_execution_ms as f64 / self.invocations as f64
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.recent_errors.front() {
            if now.duration_since(*oldest) > window {
                self.recent_errors.pop_front();
            } else {
                break;
            }
        }
        self.errors_in_window = self.recent_errors.len();
    }
}

/// Sent to the lifecycle supervisor when a plugin trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripNotice {
    pub plugin_id: String,
    pub errors_in_window: usize,
    pub window_secs: u64,
    /// Matches the record's `tripped_at`; a reset record no longer does.
    pub tripped_at: DateTime<Utc>,
}

/// Watches invocation outcomes and trips a circuit breaker per plugin.
///
/// The monitor only marks records and requests a stop through its trip
/// channel; it never touches lifecycle state itself.
pub struct HealthMonitor {
    config: RwLock<HealthConfig>,
    records: RwLock<HashMap<String, HealthRecord>>,
    trip_tx: RwLock<Option<mpsc::UnboundedSender<TripNotice>>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config: RwLock::new(config),
            records: RwLock::new(HashMap::new()),
            trip_tx: RwLock::new(None),
        }
    }

    /// Open the trip channel. Only the latest receiver gets notices.
    pub async fn trip_notices(&self) -> mpsc::UnboundedReceiver<TripNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.trip_tx.write().await = Some(tx);
        rx
    }

    pub async fn config(&self) -> HealthConfig {
        self.config.read().await.clone()
    }

    pub async fn set_config(&self, config: HealthConfig) {
        *self.config.write().await = config;
    }

    /// Start tracking a plugin so that its record exists before the first call.
    pub async fn track(&self, plugin_id: &str) {
        self.records
            .write()
            .await
            .entry(plugin_id.to_string())
            .or_insert_with(|| HealthRecord::new(plugin_id));
    }

    /// Count a hook invocation. Lifecycle calls are not part of a plugin's
    /// health and are ignored.
    pub async fn record(&self, report: &InvocationReport) {
        if report.kind == InvocationKind::Lifecycle {
            return;
        }
        self.record_at(
            &report.plugin_id,
            report.status,
            report.duration_ms,
            report.error.as_deref(),
            Instant::now(),
        )
        .await
    }

    async fn record_at(
        &self,
        plugin_id: &str,
        status: InvocationStatus,
        duration_ms: u64,
        error: Option<&str>,
        now: Instant,
    ) {
        let config = self.config.read().await.clone();
        let window = Duration::from_secs(config.window_secs);

        let notice = {
            let mut records = self.records.write().await;
            let record = records
                .entry(plugin_id.to_string())
                .or_insert_with(|| HealthRecord::new(plugin_id));

            record.invocations += 1;
            record.total_execution_ms += duration_ms;

            match status {
                InvocationStatus::Success => record.successes += 1,
                InvocationStatus::CapabilityDenied => record.capability_denials += 1,
                InvocationStatus::Timeout => record.timeouts += 1,
                InvocationStatus::RuntimeFault => record.runtime_faults += 1,
            }

            if status.is_error() {
                record.errors += 1;
                record.last_error_at = Some(Utc::now());
                record.last_error = error.map(str::to_string);
                record.recent_errors.push_back(now);
            }

            record.prune(now, window);

            if !record.tripped && record.errors_in_window > config.error_threshold as usize {
                let tripped_at = Utc::now();
                record.tripped = true;
                record.tripped_at = Some(tripped_at);
                warn!(
                    plugin_id = %plugin_id,
                    errors_in_window = record.errors_in_window,
                    window_secs = config.window_secs,
                    threshold = config.error_threshold,
                    "Plugin health tripped"
                );
                Some(TripNotice {
                    plugin_id: plugin_id.to_string(),
                    errors_in_window: record.errors_in_window,
                    window_secs: config.window_secs,
                    tripped_at,
                })
            } else {
                None
            }
        };

        if let Some(notice) = notice {
            if let Some(tx) = self.trip_tx.read().await.as_ref() {
                if tx.send(notice).is_err() {
                    debug!(plugin_id = %plugin_id, "No supervisor listening for trip notices");
                }
            }
        }
    }

    pub async fn get(&self, plugin_id: &str) -> Option<HealthRecord> {
        let now = Instant::now();
        let window = Duration::from_secs(self.config.read().await.window_secs);
        let mut records = self.records.write().await;
        records.get_mut(plugin_id).map(|record| {
            record.prune(now, window);
            record.clone()
        })
    }

    pub async fn all(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        records
    }

    pub async fn is_tripped(&self, plugin_id: &str) -> bool {
        self.records
            .read()
            .await
            .get(plugin_id)
            .is_some_and(|r| r.tripped)
    }

    /// Whether `notice` still describes the plugin's current trip.
    pub async fn is_current_trip(&self, notice: &TripNotice) -> bool {
        self.records
            .read()
            .await
            .get(&notice.plugin_id)
            .is_some_and(|r| r.tripped && r.tripped_at == Some(notice.tripped_at))
    }

    /// Clear a plugin's record; used when an operator reloads it.
    pub async fn reset(&self, plugin_id: &str) {
        self.records
            .write()
            .await
            .insert(plugin_id.to_string(), HealthRecord::new(plugin_id));
        debug!(plugin_id = %plugin_id, "Health record reset");
    }

    pub async fn remove(&self, plugin_id: &str) {
        self.records.write().await.remove(plugin_id);
    }
}

#[async_trait]
impl InvocationObserver for HealthMonitor {
    async fn on_invocation(&self, report: &InvocationReport) {
        self.record(report).await;
    }
}
