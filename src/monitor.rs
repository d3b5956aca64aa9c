//! Glue between detection and reporting.
//!
//! A reading goes through the engine; if it is flagged it is archived and
//! offered to the scheduler, and a triggered report request is handed to the
//! dispatch worker without waiting on it.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::{DetectionConfig, ReportingConfig};
use crate::detect::{AnomalyEngine, DetectError, DetectionResult, Reading};
use crate::scheduler::{
    AnomalyEvent, AutoReportScheduler, DispatchStats, ReportRequest, SkipReason, TriggerDecision,
    TriggerKind,
};
use crate::storage::AnomalyLog;

/// What the scheduler did with a flagged reading.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReportNotice {
    Buffered,
    Disabled,
    Skipped { reason: SkipReason },
    Triggered { report_id: Uuid, trigger: TriggerKind, queued: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadingOutcome {
    #[serde(flatten)]
    pub result: DetectionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ReportNotice>,
}

pub struct Monitor {
    engine: AnomalyEngine,
    scheduler: AutoReportScheduler,
    reports: Option<mpsc::Sender<ReportRequest>>,
    anomaly_log: Option<AnomalyLog>,
    dispatch_stats: Arc<RwLock<DispatchStats>>,
}

impl Monitor {
    pub fn new(detection: DetectionConfig, reporting: ReportingConfig) -> Result<Self, DetectError> {
        Ok(Self {
            engine: AnomalyEngine::new(detection)?,
            scheduler: AutoReportScheduler::new(reporting)?,
            reports: None,
            anomaly_log: None,
            dispatch_stats: Arc::new(RwLock::new(DispatchStats::default())),
        })
    }

    /// Send triggered requests to a dispatch worker.
    pub fn with_report_channel(
        mut self,
        tx: mpsc::Sender<ReportRequest>,
        stats: Arc<RwLock<DispatchStats>>,
    ) -> Self {
        self.reports = Some(tx);
        self.dispatch_stats = stats;
        self
    }

    /// Archive flagged detections.
    pub fn with_anomaly_log(mut self, log: AnomalyLog) -> Self {
        self.anomaly_log = Some(log);
        self
    }

    pub fn engine(&self) -> &AnomalyEngine {
        &self.engine
    }

    pub fn scheduler(&self) -> &AutoReportScheduler {
        &self.scheduler
    }

    pub fn anomaly_log(&self) -> Option<&AnomalyLog> {
        self.anomaly_log.as_ref()
    }

    pub async fn dispatch_stats(&self) -> DispatchStats {
        self.dispatch_stats.read().await.clone()
    }

    pub async fn process_reading(&self, reading: &Reading) -> Result<ReadingOutcome, DetectError> {
        let result = self
            .engine
            .process_reading(
                &reading.key,
                reading.value,
                reading.unit.as_deref(),
                reading.timestamp,
            )
            .await?;

        let Some(event) = AnomalyEvent::from_detection(&result) else {
            return Ok(ReadingOutcome {
                result,
                report: None,
            });
        };

        self.archive(&result).await;

        let notice = match self.scheduler.on_anomaly(event).await {
            TriggerDecision::Buffered => ReportNotice::Buffered,
            TriggerDecision::Disabled => ReportNotice::Disabled,
            TriggerDecision::Skipped(reason) => ReportNotice::Skipped { reason },
            TriggerDecision::Triggered(request) => {
                let report_id = request.id;
                let trigger = request.trigger;
                let queued = self.hand_off(request).await;
                ReportNotice::Triggered {
                    report_id,
                    trigger,
                    queued,
                }
            }
        };

        Ok(ReadingOutcome {
            result,
            report: Some(notice),
        })
    }

    async fn archive(&self, result: &DetectionResult) {
        let Some(log) = self.anomaly_log.clone() else {
            return;
        };
        let result = result.clone();
        let key = result.key.clone();
        match tokio::task::spawn_blocking(move || log.record(&result)).await {
            Ok(Ok(())) => debug!(%key, "anomaly archived"),
            Ok(Err(e)) => error!(%key, error = %e, "failed to archive anomaly"),
            Err(e) => error!(%key, error = %e, "anomaly archive task failed"),
        }
    }

    /// Never blocks: a full queue drops the request.
    async fn hand_off(&self, request: ReportRequest) -> bool {
        let Some(tx) = &self.reports else {
            debug!(report_id = %request.id, "no dispatch worker attached, request dropped");
            return false;
        };
        match tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(request)) => {
                warn!(report_id = %request.id, "report queue full, request dropped");
                self.dispatch_stats.write().await.requests_dropped += 1;
                false
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                error!(report_id = %request.id, "report worker gone, request dropped");
                self.dispatch_stats.write().await.requests_dropped += 1;
                false
            }
        }
    }

    /// Clear detection state and the report buffer, cooldowns and counters.
    pub async fn reset(&self) {
        self.engine.reset().await;
        self.scheduler.reset().await;
    }
}
