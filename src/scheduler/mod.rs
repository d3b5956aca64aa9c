//! Auto-report scheduling: buffers anomalies and decides when a cluster of
//! them is worth a report.
//!
//! Two cooldown clocks run independently (one for critical instant reports,
//! one for every report), so there is no single state enum here: each
//! decision compares two timestamps against two durations. The scheduler's
//! "now" is the timestamp of the anomaly being processed, which keeps replays
//! of historical data deterministic.

pub mod engine;
pub mod history;

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ReportingConfig;
use crate::detect::{DetectError, DetectionResult, Severity};

pub use self::engine::{run_dispatch_loop, ReportPipeline};
pub use self::history::{DispatchOutcome, DispatchStats};

/// An anomalous reading as remembered by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub key: String,
    pub value: f64,
    pub unit: Option<String>,
    pub z_score: f64,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl AnomalyEvent {
    /// `None` unless the detection was flagged as an anomaly.
    pub fn from_detection(result: &DetectionResult) -> Option<Self> {
        result.is_anomaly.then(|| Self {
            key: result.key.clone(),
            value: result.value,
            unit: result.unit.clone(),
            z_score: result.z_score,
            severity: result.severity,
            timestamp: result.timestamp,
        })
    }
}

/// Which condition fired a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Critical,
    AnomalyCount,
    MultiSensor,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Critical => write!(f, "critical"),
            TriggerKind::AnomalyCount => write!(f, "anomaly_count"),
            TriggerKind::MultiSensor => write!(f, "multi_sensor"),
        }
    }
}

/// A bounded list of anomalies handed off for report generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub id: Uuid,
    pub trigger: TriggerKind,
    pub reason: String,
    pub events: Vec<AnomalyEvent>,
    pub affected_keys: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Cooldown,
    CriticalCooldown,
    OffHours,
}

/// Outcome of feeding one anomaly to the scheduler.
#[derive(Debug, Clone)]
pub enum TriggerDecision {
    /// Buffered; no trigger condition met.
    Buffered,
    /// Buffered and counted, but auto-reporting is switched off.
    Disabled,
    /// A trigger condition was met but suppressed.
    Skipped(SkipReason),
    Triggered(ReportRequest),
}

impl TriggerDecision {
    pub fn is_triggered(&self) -> bool {
        matches!(self, TriggerDecision::Triggered(_))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastTrigger {
    pub report_id: Uuid,
    pub kind: TriggerKind,
    pub at: DateTime<Utc>,
    pub anomaly_count: usize,
}

/// Cooldown clocks and counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportTriggerState {
    pub last_report_sent_at: Option<DateTime<Utc>>,
    pub last_critical_report_sent_at: Option<DateTime<Utc>>,
    pub total_anomalies_processed: u64,
    pub reports_sent: u64,
    pub reports_skipped_cooldown: u64,
    pub reports_skipped_off_hours: u64,
    pub last_trigger: Option<LastTrigger>,
}

/// Read-only snapshot returned by [`AutoReportScheduler::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    #[serde(flatten)]
    pub state: ReportTriggerState,
    pub buffer_size: usize,
    pub buffered_keys: Vec<String>,
    pub config: ReportingConfig,
}

struct SchedulerInner {
    config: ReportingConfig,
    buffer: VecDeque<AnomalyEvent>,
    state: ReportTriggerState,
}

impl SchedulerInner {
    fn distinct_keys(&self) -> BTreeSet<&str> {
        self.buffer.iter().map(|e| e.key.as_str()).collect()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        // Unrepresentable windows never expire anything.
        let Some(window) = Duration::try_minutes(self.config.anomaly_window_minutes) else {
            return;
        };
        let before = self.buffer.len();
        self.buffer.retain(|e| now - e.timestamp <= window);
        let pruned = before - self.buffer.len();
        if pruned > 0 {
            debug!(pruned, "pruned expired anomalies from buffer");
        }
    }

    fn in_working_hours(&self, now: DateTime<Utc>) -> bool {
        if !self.config.working_hours_only {
            return true;
        }
        let hour = now.hour();
        hour >= self.config.working_hours_start && hour < self.config.working_hours_end
    }

    /// Drain the buffer into a request and start the cooldown clocks.
    fn fire(&mut self, kind: TriggerKind, reason: String, now: DateTime<Utc>) -> ReportRequest {
        let mut events: Vec<AnomalyEvent> = self.buffer.drain(..).collect();
        let total = events.len();
        if total > self.config.max_events_per_report {
            events.drain(..total - self.config.max_events_per_report);
        }
        let affected_keys: Vec<String> = events
            .iter()
            .map(|e| e.key.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let request = ReportRequest {
            id: Uuid::new_v4(),
            trigger: kind,
            reason,
            events,
            affected_keys,
            requested_at: now,
        };

        self.state.last_report_sent_at = Some(now);
        if kind == TriggerKind::Critical {
            self.state.last_critical_report_sent_at = Some(now);
        }
        self.state.reports_sent += 1;
        self.state.last_trigger = Some(LastTrigger {
            report_id: request.id,
            kind,
            at: now,
            anomaly_count: total,
        });

        warn!(
            report_id = %request.id,
            trigger = %kind,
            anomalies = total,
            keys = ?request.affected_keys,
            reason = %request.reason,
            "report triggered"
        );
        request
    }
}

fn cooled_down(last: Option<DateTime<Utc>>, minutes: i64, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(at) => Duration::try_minutes(minutes).is_some_and(|cooldown| now - at >= cooldown),
    }
}

pub struct AutoReportScheduler {
    inner: Mutex<SchedulerInner>,
}

impl AutoReportScheduler {
    pub fn new(config: ReportingConfig) -> Result<Self, DetectError> {
        config.validate()?;
        info!(enabled = config.enabled, "auto-report scheduler initialised");
        Ok(Self {
            inner: Mutex::new(SchedulerInner {
                config,
                buffer: VecDeque::new(),
                state: ReportTriggerState::default(),
            }),
        })
    }

    /// Buffer an anomaly and evaluate the trigger conditions.
    pub async fn on_anomaly(&self, event: AnomalyEvent) -> TriggerDecision {
        let mut inner = self.inner.lock().await;

        let now = inner
            .buffer
            .iter()
            .map(|e| e.timestamp)
            .max()
            .map_or(event.timestamp, |newest| newest.max(event.timestamp));

        inner.prune(now);
        let severity = event.severity;
        let key = event.key.clone();
        let z_score = event.z_score;
        inner.buffer.push_back(event);
        while inner.buffer.len() > inner.config.buffer_capacity {
            inner.buffer.pop_front();
        }
        inner.state.total_anomalies_processed += 1;

        if !inner.config.enabled {
            debug!(%key, "auto-reporting disabled, anomaly buffered only");
            return TriggerDecision::Disabled;
        }

        if inner.config.instant_report_on_critical && severity == Severity::Critical {
            if !cooled_down(
                inner.state.last_critical_report_sent_at,
                inner.config.critical_cooldown_minutes,
                now,
            ) {
                inner.state.reports_skipped_cooldown += 1;
                info!(%key, "critical report suppressed by cooldown");
                return TriggerDecision::Skipped(SkipReason::CriticalCooldown);
            }
            if !inner.in_working_hours(now) {
                inner.state.reports_skipped_off_hours += 1;
                info!(%key, "critical report deferred outside working hours");
                return TriggerDecision::Skipped(SkipReason::OffHours);
            }
            let reason = format!("critical anomaly on '{}' (z-score {:.2})", key, z_score);
            return TriggerDecision::Triggered(inner.fire(TriggerKind::Critical, reason, now));
        }

        let count = inner.buffer.len();
        let keys = inner.distinct_keys().len();
        let count_met = count >= inner.config.min_anomalies_for_report;
        let keys_met = keys >= inner.config.multi_sensor_threshold;
        if !count_met && !keys_met {
            debug!(%key, count, keys, "anomaly buffered");
            return TriggerDecision::Buffered;
        }

        if !cooled_down(inner.state.last_report_sent_at, inner.config.cooldown_minutes, now) {
            inner.state.reports_skipped_cooldown += 1;
            info!(%key, count, keys, "report suppressed by cooldown");
            return TriggerDecision::Skipped(SkipReason::Cooldown);
        }
        if !inner.in_working_hours(now) {
            inner.state.reports_skipped_off_hours += 1;
            info!(%key, count, keys, "report deferred outside working hours");
            return TriggerDecision::Skipped(SkipReason::OffHours);
        }

        let window = inner.config.anomaly_window_minutes;
        let (kind, reason) = if count_met {
            (
                TriggerKind::AnomalyCount,
                format!("{} anomalies within {} minutes", count, window),
            )
        } else {
            (
                TriggerKind::MultiSensor,
                format!("{} distinct keys affected within {} minutes", keys, window),
            )
        };
        TriggerDecision::Triggered(inner.fire(kind, reason, now))
    }

    pub async fn status(&self) -> SchedulerStatus {
        let inner = self.inner.lock().await;
        SchedulerStatus {
            enabled: inner.config.enabled,
            state: inner.state.clone(),
            buffer_size: inner.buffer.len(),
            buffered_keys: inner.distinct_keys().into_iter().map(str::to_string).collect(),
            config: inner.config.clone(),
        }
    }

    /// Switch auto-reporting on or off. Buffer and cooldowns are kept.
    pub async fn toggle(&self, enabled: bool) {
        let mut inner = self.inner.lock().await;
        inner.config.enabled = enabled;
        info!(enabled, "auto-reporting toggled");
    }

    /// Replace the policy. Buffer and cooldowns are kept.
    pub async fn update_config(&self, config: ReportingConfig) -> Result<(), DetectError> {
        config.validate()?;
        let mut inner = self.inner.lock().await;
        inner.config = config;
        info!(enabled = inner.config.enabled, "auto-report config updated");
        Ok(())
    }

    /// Overlay the given fields on the current config and apply the result,
    /// all under one lock so a concurrent toggle is not lost.
    pub async fn apply_patch(
        &self,
        fields: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ReportingConfig, DetectError> {
        let mut inner = self.inner.lock().await;
        let mut current = serde_json::to_value(&inner.config)
            .map_err(|e| DetectError::InvalidConfig(e.to_string()))?;
        if let serde_json::Value::Object(map) = &mut current {
            for (k, v) in fields {
                if !map.contains_key(&k) {
                    return Err(DetectError::InvalidConfig(format!("unknown field '{}'", k)));
                }
                map.insert(k, v);
            }
        }
        let config: ReportingConfig = serde_json::from_value(current)
            .map_err(|e| DetectError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        inner.config = config.clone();
        info!(enabled = config.enabled, "auto-report config patched");
        Ok(config)
    }

    pub async fn config(&self) -> ReportingConfig {
        self.inner.lock().await.config.clone()
    }

    /// Clear the buffer, cooldown clocks and counters.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.buffer.clear();
        inner.state = ReportTriggerState::default();
        info!("auto-report scheduler reset");
    }
}
