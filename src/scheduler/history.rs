//! Bookkeeping for report requests handled by the dispatch worker.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::report::RiskLevel;
use crate::scheduler::TriggerKind;

/// How one report request ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Delivered {
        report_id: Uuid,
        trigger: TriggerKind,
        risk_level: RiskLevel,
        generator: String,
        queued: usize,
    },
    GenerationFailed {
        report_id: Uuid,
        error: String,
    },
    DeliveryFailed {
        report_id: Uuid,
        error: String,
    },
}

impl DispatchOutcome {
    pub fn report_id(&self) -> Uuid {
        match self {
            DispatchOutcome::Delivered { report_id, .. }
            | DispatchOutcome::GenerationFailed { report_id, .. }
            | DispatchOutcome::DeliveryFailed { report_id, .. } => *report_id,
        }
    }
}

/// Worker counters, exposed on the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatchStats {
    pub requests_received: u64,
    /// Requests lost because the worker queue was full.
    pub requests_dropped: u64,
    pub reports_generated: u64,
    pub fallback_reports: u64,
    pub generation_failures: u64,
    pub delivery_failures: u64,
    pub messages_queued: u64,
    pub last_outcome: Option<DispatchOutcome>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

impl DispatchStats {
    pub fn record(&mut self, outcome: DispatchOutcome) {
        match &outcome {
            DispatchOutcome::Delivered { queued, .. } => {
                self.reports_generated += 1;
                self.messages_queued += *queued as u64;
            }
            DispatchOutcome::GenerationFailed { .. } => self.generation_failures += 1,
            DispatchOutcome::DeliveryFailed { .. } => {
                self.reports_generated += 1;
                self.delivery_failures += 1;
            }
        }
        self.last_outcome = Some(outcome);
        self.last_finished_at = Some(Utc::now());
    }
}
